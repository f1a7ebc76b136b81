//! Staging pipeline - Fans canonical points out to the downstream stages
//!
//! One task per instrument. Each point is cloned to the persistence and the
//! publication inbound channels concurrently; a slow sink only holds the
//! other back once its own channel is full.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::{Instrument, Kline};

/// Default depth of every stage inbound channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Downstream channels shared by all instrument tasks
#[derive(Clone)]
pub struct StageSinks {
    pub persistence: mpsc::Sender<Kline>,
    pub publication: mpsc::Sender<Kline>,
}

enum Forward {
    Sent,
    SinkClosed,
    Cancelled,
}

pub struct StagingPipeline {
    sinks: StageSinks,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl StagingPipeline {
    pub fn new(sinks: StageSinks) -> Self {
        Self {
            sinks,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn the forwarding task for `instrument`
    pub fn start(&mut self, instrument: Instrument, inbound: mpsc::Receiver<Kline>) {
        let task = Self::run(instrument, inbound, self.sinks.clone(), self.cancel.clone());
        self.handles.push(tokio::spawn(task));
    }

    async fn forward(sink: &mpsc::Sender<Kline>, point: Kline, cancel: &CancellationToken) -> Forward {
        tokio::select! {
            _ = cancel.cancelled() => Forward::Cancelled,
            sent = sink.send(point) => match sent {
                Ok(()) => Forward::Sent,
                Err(_) => Forward::SinkClosed,
            },
        }
    }

    async fn run(
        instrument: Instrument,
        mut inbound: mpsc::Receiver<Kline>,
        sinks: StageSinks,
        cancel: CancellationToken,
    ) {
        info!(instrument = %instrument, "Staging task started");

        loop {
            let point = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = inbound.recv() => match maybe {
                    Some(point) => point,
                    None => break,
                },
            };

            let (stored, published) = tokio::join!(
                Self::forward(&sinks.persistence, point.clone(), &cancel),
                Self::forward(&sinks.publication, point, &cancel),
            );

            if matches!(stored, Forward::Cancelled) || matches!(published, Forward::Cancelled) {
                break;
            }
            if matches!(stored, Forward::SinkClosed) {
                warn!(instrument = %instrument, "Persistence inbound closed, point not stored");
            }
            if matches!(published, Forward::SinkClosed) {
                warn!(instrument = %instrument, "Publication inbound closed, point not published");
            }
        }

        info!(instrument = %instrument, "Staging task stopped");
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Staging task panicked");
            }
        }
    }
}
