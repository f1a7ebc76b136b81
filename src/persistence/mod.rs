//! Persistence Module
//!
//! Stores reconciled ticks and multi-resolution candles. The stage owns a
//! tick cache that is bulk-upserted every `flush_threshold` points, upserts
//! one candle row per configured time scale for every point, and sweeps old
//! ticks on a timer.

mod memory;
mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::StorageResult;
use crate::oracle::CandleBuilder;
use crate::types::{Instrument, Kline, TimeScale};

/// Durable kline storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KlineStore: Send + Sync {
    /// Upsert into the tick table. High/low widen, everything else is
    /// last-write-wins.
    async fn upsert_ticks(&self, ticks: &[Kline]) -> StorageResult<()>;

    /// Upsert candle rows. Open is kept, close and update time replaced,
    /// high/low widen and volume accumulates.
    async fn upsert_candles(&self, rows: &[Kline]) -> StorageResult<()>;

    /// Candle of `scale` whose bucket contains `create_time`
    async fn find_candle(
        &self,
        instrument: &Instrument,
        scale: &TimeScale,
        create_time: i64,
    ) -> StorageResult<Option<Kline>>;

    /// Delete ticks created before `cutoff`, returning the number removed
    async fn delete_ticks_before(&self, cutoff: i64) -> StorageResult<u64>;
}

/// Persistence stage settings
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub flush_threshold: usize,
    /// Ticks older than this are swept
    pub retention: Duration,
    pub retention_initial_delay: Duration,
    pub retention_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 60,
            retention: Duration::from_secs(6 * 3600),
            retention_initial_delay: Duration::from_secs(60),
            retention_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// Consumes canonical points and writes them to a `KlineStore`
pub struct PersistenceStage {
    store: Arc<dyn KlineStore>,
    candles: CandleBuilder,
    config: PersistenceConfig,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceStage {
    pub fn new(store: Arc<dyn KlineStore>, candles: CandleBuilder, config: PersistenceConfig) -> Self {
        Self {
            store,
            candles,
            config,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn start(&mut self, inbound: mpsc::Receiver<Kline>) {
        if self.handle.is_some() {
            return;
        }
        let worker = Worker {
            store: self.store.clone(),
            candles: self.candles.clone(),
            config: self.config.clone(),
            cache: Vec::with_capacity(self.config.flush_threshold),
        };
        info!(
            flush_threshold = self.config.flush_threshold,
            retention_secs = self.config.retention.as_secs(),
            scales = self.candles.scales().len(),
            "💾 Persistence stage started"
        );
        self.handle = Some(tokio::spawn(worker.run(inbound, self.cancel.clone())));
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Drain what is already queued, flush the tick cache and wait for the
    /// worker to exit
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Persistence task panicked");
            }
        }
    }
}

struct Worker {
    store: Arc<dyn KlineStore>,
    candles: CandleBuilder,
    config: PersistenceConfig,
    cache: Vec<Kline>,
}

impl Worker {
    async fn run(mut self, mut inbound: mpsc::Receiver<Kline>, cancel: CancellationToken) {
        let retention = tokio::time::sleep(self.config.retention_initial_delay);
        tokio::pin!(retention);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inbound.close();
                    while let Some(point) = inbound.recv().await {
                        self.handle_point(point).await;
                    }
                    break;
                }
                maybe = inbound.recv() => match maybe {
                    Some(point) => self.handle_point(point).await,
                    None => break,
                },
                _ = &mut retention => {
                    self.sweep().await;
                    retention.as_mut().reset(Instant::now() + self.config.retention_interval);
                }
            }
        }

        self.flush_ticks().await;
        info!("💾 Persistence stage stopped");
    }

    async fn handle_point(&mut self, point: Kline) {
        let rows = self.candles.rows_for(&point);
        self.cache.push(point);
        if self.cache.len() >= self.config.flush_threshold {
            self.flush_ticks().await;
        }

        if let Err(e) = self.store.upsert_candles(&rows).await {
            error!(error = %e, rows = rows.len(), "Candle upsert failed, rows dropped");
        }
    }

    async fn flush_ticks(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.cache);
        match self.store.upsert_ticks(&batch).await {
            Ok(()) => debug!(count = batch.len(), "Tick cache flushed"),
            Err(e) => error!(error = %e, count = batch.len(), "Tick flush failed, batch dropped"),
        }
    }

    async fn sweep(&self) {
        let cutoff = chrono::Utc::now().timestamp() - self.config.retention.as_secs() as i64;
        match self.store.delete_ticks_before(cutoff).await {
            Ok(removed) => info!(removed, cutoff, "🧹 Old ticks swept"),
            Err(e) => error!(error = %e, cutoff, "Tick retention sweep failed"),
        }
    }
}
