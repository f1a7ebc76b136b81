//! In-process broker for development and tests
//!
//! Routes published messages to queues bound with a matching
//! (exchange, routing key) pair. `sever` drops every open session the way a
//! broker restart would: sessions become unusable, consumers end and the
//! auto-delete queues disappear while durable exchanges survive.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    BrokerEvent, BrokerEvents, Connector, Delivery, DeliveryStream, ExchangeSpec, OutboundMessage,
    QueueSpec, Session,
};

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// queue -> bindings (exchange, routing key)
    queues: HashMap<String, Vec<(String, String)>>,
    /// queue -> (session id, consumer feed)
    consumers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>,
    /// live session ids and their event feeds
    sessions: HashMap<u64, mpsc::UnboundedSender<BrokerEvent>>,
    published: Vec<OutboundMessage>,
    next_session: u64,
    next_queue: u64,
    connections: usize,
    closed_sessions: usize,
    refuse_connections: bool,
    failing_publishes: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop every open session
    pub fn sever(&self) {
        let mut state = self.lock();
        for (_, events) in state.sessions.drain() {
            let _ = events.send(BrokerEvent::Closed("connection reset by broker".to_string()));
        }
        state.consumers.clear();
        state.queues.clear();
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Make the next `n` publishes fail on the session
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    /// Every message the broker accepted, in order
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Successful connects so far
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Sessions closed by their owner
    pub fn closed_sessions(&self) -> usize {
        self.lock().closed_sessions
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> TransportResult<(Box<dyn Session>, BrokerEvents)> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.connections += 1;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.sessions.insert(id, events_tx);

        let session = MemorySession {
            broker: self.clone(),
            id,
        };
        Ok((Box::new(session), events_rx))
    }
}

pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

impl MemorySession {
    fn live(&self) -> TransportResult<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(TransportError::Channel("session is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()> {
        self.live()?.exchanges.insert(spec.name.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<String> {
        let mut state = self.live()?;
        if !spec.exchange.is_empty() && !state.exchanges.contains(&spec.exchange) {
            return Err(TransportError::Declare(format!(
                "no exchange '{}'",
                spec.exchange
            )));
        }

        let name = if spec.name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            spec.name.clone()
        };

        let bindings = state.queues.entry(name.clone()).or_default();
        if !spec.exchange.is_empty() {
            let binding = (spec.exchange.clone(), spec.routing_key.clone());
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }
        Ok(name)
    }

    async fn consume(&self, queue: &str, _tag: &str) -> TransportResult<DeliveryStream> {
        let mut state = self.live()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Declare(format!("no queue '{queue}'")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .consumers
            .entry(queue.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, message: &OutboundMessage) -> TransportResult<()> {
        let mut state = self.live()?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(TransportError::Publish("channel write failed".to_string()));
        }
        state.published.push(message.clone());

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, bindings)| {
                bindings
                    .iter()
                    .any(|(ex, key)| *ex == message.exchange && *key == message.routing_key)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for queue in targets {
            if let Some(consumers) = state.consumers.get(&queue) {
                let delivery = Delivery {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                };
                for (_, feed) in consumers {
                    let _ = feed.send(delivery.clone());
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.live()?;
        state.sessions.remove(&self.id);
        state.closed_sessions += 1;
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        state.sessions.remove(&self.id);
        let id = self.id;
        for consumers in state.consumers.values_mut() {
            consumers.retain(|(owner, _)| *owner != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_to_bound_consumers() {
        let broker = MemoryBroker::new();
        let (session, _events) = broker.connect().await.unwrap();
        session
            .declare_exchange(&ExchangeSpec { name: "ex".into() })
            .await
            .unwrap();
        let queue = session
            .declare_queue(&QueueSpec { name: "q".into(), exchange: "ex".into(), routing_key: "kline".into() })
            .await
            .unwrap();
        let mut deliveries = session.consume(&queue, "tag").await.unwrap();

        let msg = OutboundMessage::new("ex", "kline", "hello", crate::transport::DeliveryMode::Transient);
        session.publish(&msg).await.unwrap();
        let other = OutboundMessage::new("ex", "other", "nope", crate::transport::DeliveryMode::Transient);
        session.publish(&other).await.unwrap();

        assert_eq!(deliveries.next().await.unwrap().body, b"hello".to_vec());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_sever_invalidates_sessions() {
        let broker = MemoryBroker::new();
        let (session, mut events) = broker.connect().await.unwrap();
        session
            .declare_exchange(&ExchangeSpec { name: "ex".into() })
            .await
            .unwrap();
        broker.sever();

        assert!(matches!(events.recv().await, Some(BrokerEvent::Closed(_))));
        let msg = OutboundMessage::new("ex", "kline", "x", crate::transport::DeliveryMode::Transient);
        assert!(matches!(session.publish(&msg).await, Err(TransportError::Channel(_))));
    }
}
