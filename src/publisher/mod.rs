//! Publication stage - Pushes tick events to subscribers
//!
//! Each point is decorated with the day's aggregate (open, high, low and
//! volume from the `1D` candle) and published as a `tick_<instrument>` event
//! wrapped in the application envelope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::persistence::KlineStore;
use crate::transport::TransportHandle;
use crate::types::{Instrument, Kline, Origin, TimeScale};

pub const TICK_EVENT_PREFIX: &str = "tick_";

/// Message wrapper seen by every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    /// JSON-encoded `EventBody`
    pub body: String,
}

/// Payload carried inside `Envelope::body`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub data: Kline,
}

pub fn event_type(instrument: &Instrument) -> String {
    format!("{}{}", TICK_EVENT_PREFIX, instrument)
}

/// Serialize `point` into the wire envelope
pub fn encode_event(app_id: &str, point: &Kline) -> serde_json::Result<Vec<u8>> {
    let event_type = event_type(&point.instrument);
    let body = serde_json::to_string(&EventBody {
        event_type: event_type.clone(),
        data: point.clone(),
    })?;
    serde_json::to_vec(&Envelope {
        app_id: app_id.to_string(),
        event_type,
        body,
    })
}

#[derive(Debug, Clone)]
pub struct PublicationConfig {
    pub app_id: String,
    pub exchange: String,
    pub routing_key: String,
    /// Scale whose candle supplies the daily aggregate
    pub daily_scale: TimeScale,
}

pub type LatestMap = Arc<RwLock<HashMap<Instrument, Kline>>>;

pub struct PublicationStage {
    store: Arc<dyn KlineStore>,
    transport: TransportHandle,
    config: PublicationConfig,
    latest: LatestMap,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PublicationStage {
    pub fn new(store: Arc<dyn KlineStore>, transport: TransportHandle, config: PublicationConfig) -> Self {
        Self {
            store,
            transport,
            config,
            latest: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Last point published for `instrument`
    pub fn latest(&self, instrument: &Instrument) -> Option<Kline> {
        self.latest.read().ok()?.get(instrument).cloned()
    }

    pub fn start(&mut self, inbound: mpsc::Receiver<Kline>) {
        if self.handle.is_some() {
            return;
        }
        let worker = Publisher {
            store: self.store.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            latest: self.latest.clone(),
        };
        info!(exchange = %self.config.exchange, routing_key = %self.config.routing_key, "📣 Publication stage started");
        self.handle = Some(tokio::spawn(worker.run(inbound, self.cancel.clone())));
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Publication task panicked");
            }
        }
    }
}

struct Publisher {
    store: Arc<dyn KlineStore>,
    transport: TransportHandle,
    config: PublicationConfig,
    latest: LatestMap,
}

impl Publisher {
    async fn run(self, mut inbound: mpsc::Receiver<Kline>, cancel: CancellationToken) {
        loop {
            let point = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = inbound.recv() => match maybe {
                    Some(point) => point,
                    None => break,
                },
            };

            let point = self.enrich(point).await;
            if let Ok(mut latest) = self.latest.write() {
                latest.insert(point.instrument.clone(), point.clone());
            }

            let body = match encode_event(&self.config.app_id, &point) {
                Ok(body) => body,
                Err(e) => {
                    error!(instrument = %point.instrument, error = %e, "Event encoding failed");
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.transport.publish_transient(&self.config.exchange, &self.config.routing_key, body) => {
                    if let Err(e) = sent {
                        warn!(instrument = %point.instrument, error = %e, "Tick event not queued");
                    }
                }
            }
        }

        inbound.close();
        let mut dropped = 0usize;
        while inbound.try_recv().is_ok() {
            dropped += 1;
        }
        info!(dropped, "📣 Publication stage stopped");
    }

    /// Mark as market data and copy in the day's aggregate when available
    async fn enrich(&self, mut point: Kline) -> Kline {
        point.origin = Origin::Market;
        point.volume = "0".to_string();

        match self
            .store
            .find_candle(&point.instrument, &self.config.daily_scale, point.create_time)
            .await
        {
            Ok(Some(daily)) => {
                point.volume = daily.volume;
                point.open = daily.open;
                point.high = daily.high;
                point.low = daily.low;
            }
            Ok(None) => debug!(instrument = %point.instrument, "No daily candle yet"),
            Err(e) => warn!(instrument = %point.instrument, error = %e, "Daily candle lookup failed, publishing unenriched"),
        }
        point
    }
}
