//! Hub - Wires sources, engine and stages together
//!
//! Start order is downstream first (persistence, publication, staging,
//! engine, sources) so no point is produced before its consumer exists.
//! Stop runs the other way and ends with the transport, after the
//! persistence stage has flushed its tick cache.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::oracle::sources::QuoteSource;
use crate::oracle::{CandleBuilder, EngineConfig, ReconciliationEngine, SourceFeed};
use crate::persistence::{KlineStore, PersistenceConfig, PersistenceStage};
use crate::pipeline::{StageSinks, StagingPipeline};
use crate::publisher::{PublicationConfig, PublicationStage};
use crate::risk::RiskDesk;
use crate::transport::Transport;
use crate::types::{Instrument, Kline, TimeScaleTable};

/// Queue and consumer tag of the optional debug consumer
pub const DEBUG_QUEUE: &str = "kline";
pub const DEBUG_CONSUMER_TAG: &str = "test_callback";

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub instruments: Vec<Instrument>,
    /// Source whose samples are risk directives
    pub local_provider: String,
    pub channel_capacity: usize,
    pub engine: EngineConfig,
    pub persistence: PersistenceConfig,
    pub time_scales: TimeScaleTable,
    pub publication: PublicationConfig,
    pub debug_consumer: bool,
}

impl HubSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            instruments: config.instruments(),
            local_provider: config.sources.local_provider.clone(),
            channel_capacity: config.pipeline.channel_capacity.max(1),
            engine: config.engine_config(),
            persistence: config.persistence_config(),
            time_scales: config.time_scale_table()?,
            publication: PublicationConfig {
                app_id: config.broker.app_id.clone(),
                exchange: config.broker.exchange.clone(),
                routing_key: config.broker.routing_key.clone(),
                daily_scale: config.daily_scale()?,
            },
            debug_consumer: config.broker.debug_consumer,
        })
    }
}

pub struct Hub {
    settings: HubSettings,
    sources: Vec<Box<dyn QuoteSource>>,
    desk: RiskDesk,
    engine: ReconciliationEngine,
    staging: Option<StagingPipeline>,
    persistence: PersistenceStage,
    publication: PublicationStage,
    transport: Transport,
    running: bool,
}

impl Hub {
    pub fn new(
        settings: HubSettings,
        sources: Vec<Box<dyn QuoteSource>>,
        desk: RiskDesk,
        store: Arc<dyn KlineStore>,
        transport: Transport,
    ) -> Self {
        let persistence = PersistenceStage::new(
            store.clone(),
            CandleBuilder::new(settings.time_scales.clone()),
            settings.persistence.clone(),
        );
        let publication = PublicationStage::new(store, transport.handle(), settings.publication.clone());
        Self {
            engine: ReconciliationEngine::new(settings.engine),
            settings,
            sources,
            desk,
            staging: None,
            persistence,
            publication,
            transport,
            running: false,
        }
    }

    /// Build every configured provider through the registry
    pub fn from_config(config: &AppConfig, store: Arc<dyn KlineStore>, transport: Transport) -> Result<Self> {
        let settings = HubSettings::from_config(config)?;
        let desk = RiskDesk::new();
        let timing = config.source_timing();
        let sources = config
            .providers()?
            .into_iter()
            .map(|kind| {
                kind.build(&settings.instruments, timing, &desk)
                    .with_context(|| format!("Failed to build provider {}", kind))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(settings, sources, desk, store, transport))
    }

    /// Operator handle for risk directives
    pub fn risk_desk(&self) -> RiskDesk {
        self.desk.clone()
    }

    pub fn current_price(&self, instrument: &Instrument) -> Option<Kline> {
        self.engine.current_price(instrument)
    }

    pub fn latest_published(&self, instrument: &Instrument) -> Option<Kline> {
        self.publication.latest(instrument)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let capacity = self.settings.channel_capacity;

        let (persist_tx, persist_rx) = mpsc::channel(capacity);
        let (publish_tx, publish_rx) = mpsc::channel(capacity);
        self.persistence.start(persist_rx);
        self.publication.start(publish_rx);

        if self.settings.debug_consumer {
            if let Err(e) = self.start_debug_consumer().await {
                self.publication.stop().await;
                self.persistence.stop().await;
                return Err(e);
            }
        }

        let mut staging = StagingPipeline::new(StageSinks {
            persistence: persist_tx,
            publication: publish_tx,
        });

        for instrument in &self.settings.instruments {
            let (tx, rx) = mpsc::channel(capacity);
            staging.start(instrument.clone(), rx);

            let feeds: Vec<SourceFeed> = self
                .sources
                .iter_mut()
                .filter_map(|source| {
                    let rx = source.read_channel(instrument)?;
                    Some(SourceFeed {
                        name: source.name(),
                        origin: source.origin(),
                        is_local: source.name() == self.settings.local_provider,
                        rx,
                    })
                })
                .collect();
            if feeds.is_empty() {
                warn!(instrument = %instrument, "No source supports this instrument");
            }
            self.engine.start(instrument.clone(), feeds, tx);
        }
        self.staging = Some(staging);

        for source in self.sources.iter_mut() {
            source.start_collecting();
        }

        self.running = true;
        info!(
            instruments = self.settings.instruments.len(),
            sources = self.sources.len(),
            "✅ Hub started"
        );
        Ok(())
    }

    async fn start_debug_consumer(&self) -> Result<()> {
        let handle = self.transport.handle();
        let exchange = &self.settings.publication.exchange;
        let queue = handle
            .declare_queue(DEBUG_QUEUE, exchange, &self.settings.publication.routing_key)
            .await
            .context("Failed to declare debug queue")?;
        handle
            .consume(&queue, DEBUG_CONSUMER_TAG, |delivery| {
                info!(
                    routing_key = %delivery.routing_key,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Debug delivery"
                );
            })
            .await
            .context("Failed to start debug consumer")?;
        info!(queue = %queue, "Debug consumer attached");
        Ok(())
    }

    /// Ordered shutdown. Every stage has exited when this returns.
    pub async fn stop(&mut self) {
        info!("🧹 Hub stopping");
        for source in self.sources.iter_mut() {
            source.stop().await;
        }
        self.engine.stop().await;
        if let Some(mut staging) = self.staging.take() {
            staging.stop().await;
        }
        self.publication.stop().await;
        self.persistence.stop().await;
        self.transport.close().await;
        self.running = false;
        info!("Hub stopped");
    }
}
