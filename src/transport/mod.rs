//! Resilient message transport
//!
//! A single reactor task owns the broker session. Callers talk to it through
//! a bounded publish queue and a command channel. When the broker drops the
//! session the reactor keeps queued work, reconnects on a fixed interval and
//! replays every exchange, queue and consumer in the order they were first
//! declared.

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemorySession};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};

/// AMQP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn code(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// A message waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub mode: DeliveryMode,
    /// Epoch seconds, set when the message is queued
    pub timestamp: u64,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            mode,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// A message received by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Asynchronous notifications from a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The connection or channel is gone
    Closed(String),
    /// An unroutable message came back
    Returned {
        exchange: String,
        routing_key: String,
        reply_text: String,
    },
}

pub type DeliveryStream = BoxStream<'static, Delivery>;
pub type BrokerEvents = mpsc::UnboundedReceiver<BrokerEvent>;
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Direct, durable exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
}

/// Auto-delete queue, optionally bound to an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty asks the broker for a generated name
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Clone)]
pub struct ConsumerSpec {
    pub queue: String,
    pub tag: String,
    pub handler: DeliveryHandler,
}

impl fmt::Debug for ConsumerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .finish()
    }
}

/// One open broker session
#[async_trait]
pub trait Session: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()>;

    /// Declare and bind a queue, returning its (possibly generated) name
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<String>;

    /// Auto-ack consumer on `queue`
    async fn consume(&self, queue: &str, tag: &str) -> TransportResult<DeliveryStream>;

    /// Fire-and-forget publish
    async fn publish(&self, message: &OutboundMessage) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> TransportResult<(Box<dyn Session>, BrokerEvents)>;
}

/// Link status as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Broken,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Broken => write!(f, "broken"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub reconnect_interval: Duration,
    pub publish_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            publish_queue_capacity: 1024,
        }
    }
}

/// Declared broker objects, in registration order
#[derive(Debug, Default)]
struct Topology {
    exchanges: Vec<ExchangeSpec>,
    /// (requested spec, name the broker assigned last time)
    queues: Vec<(QueueSpec, String)>,
    consumers: Vec<ConsumerSpec>,
}

enum Command {
    DeclareExchange(ExchangeSpec, oneshot::Sender<TransportResult<()>>),
    DeclareQueue(QueueSpec, oneshot::Sender<TransportResult<String>>),
    Consume(ConsumerSpec, oneshot::Sender<TransportResult<()>>),
}

/// Cloneable caller side of the transport
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<Command>,
    outbound: mpsc::Sender<OutboundMessage>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Queue a message, waiting for space or shutdown
    pub async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            sent = self.outbound.send(message) => sent.map_err(|_| TransportError::Closed),
        }
    }

    pub async fn publish_transient(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> TransportResult<()> {
        self.publish(OutboundMessage::new(exchange, routing_key, body, DeliveryMode::Transient))
            .await
    }

    pub async fn publish_persistent(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> TransportResult<()> {
        self.publish(OutboundMessage::new(exchange, routing_key, body, DeliveryMode::Persistent))
            .await
    }

    pub async fn declare_exchange(&self, name: &str) -> TransportResult<()> {
        let spec = ExchangeSpec { name: name.to_string() };
        self.request(|reply| Command::DeclareExchange(spec, reply)).await
    }

    /// Declare a queue bound to `exchange` with `routing_key`. An empty name
    /// lets the broker pick one; the chosen name is returned.
    pub async fn declare_queue(
        &self,
        name: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<String> {
        let spec = QueueSpec {
            name: name.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.request(|reply| Command::DeclareQueue(spec, reply)).await
    }

    /// Register `handler` for every delivery on `queue`
    pub async fn consume<H>(&self, queue: &str, tag: &str, handler: H) -> TransportResult<()>
    where
        H: Fn(Delivery) + Send + Sync + 'static,
    {
        if tag.is_empty() {
            return Err(TransportError::InvalidConsumer);
        }
        let spec = ConsumerSpec {
            queue: queue.to_string(),
            tag: tag.to_string(),
            handler: Arc::new(handler),
        };
        self.request(|reply| Command::Consume(spec, reply)).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<TransportResult<T>>) -> Command,
    ) -> TransportResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// Owner of the reactor task
pub struct Transport {
    handle: TransportHandle,
    cancel: CancellationToken,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Connect and spawn the reactor. A failed first connect is fatal.
    pub async fn start<C: Connector>(connector: C, config: TransportConfig) -> TransportResult<Self> {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (session, events) = connector.connect().await?;
        let _ = state_tx.send(LinkState::Connected);
        info!("📡 Broker connected");

        let (command_tx, command_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.publish_queue_capacity.max(1));
        let cancel = CancellationToken::new();

        let reactor = Reactor {
            connector: Box::new(connector),
            config,
            session: Some(session),
            events: Some(events),
            topology: Topology::default(),
            pumps: Vec::new(),
            pending: VecDeque::new(),
            state: state_tx,
        };
        let task = tokio::spawn(reactor.run(command_rx, outbound_rx, cancel.clone()));

        Ok(Self {
            handle: TransportHandle {
                commands: command_tx,
                outbound: outbound_tx,
                state: state_rx,
                cancel: cancel.clone(),
            },
            cancel,
            reactor: Mutex::new(Some(task)),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LinkState {
        self.handle.state()
    }

    /// Stop the reactor, publishing what is already queued if the link is
    /// up, and wait for it to exit
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.reactor.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Transport reactor panicked");
            }
        }
    }
}

struct Reactor {
    connector: Box<dyn Connector>,
    config: TransportConfig,
    session: Option<Box<dyn Session>>,
    events: Option<BrokerEvents>,
    topology: Topology,
    pumps: Vec<JoinHandle<()>>,
    /// Publishes that failed on a live session, resent after reconnect
    pending: VecDeque<OutboundMessage>,
    state: watch::Sender<LinkState>,
}

async fn next_event(events: &mut Option<BrokerEvents>) -> Option<BrokerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Reactor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut outbound: mpsc::Receiver<OutboundMessage>,
        cancel: CancellationToken,
    ) {
        let mut reconnect = tokio::time::interval(self.config.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = self.session.is_some();
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(message) = outbound.recv(), if connected => self.publish(message).await,
                event = next_event(&mut self.events) => match event {
                    Some(BrokerEvent::Closed(reason)) => self.mark_broken(&reason).await,
                    Some(BrokerEvent::Returned { exchange, routing_key, reply_text }) => {
                        warn!(exchange = %exchange, routing_key = %routing_key, reply = %reply_text, "Message returned by broker, dropped");
                    }
                    None => self.mark_broken("event stream ended").await,
                },
                _ = reconnect.tick() => {
                    if self.session.is_none() {
                        if let Err(e) = self.reconnect().await {
                            error!(error = %e, "Broker reconnect failed, link stays broken");
                        }
                    }
                }
            }
        }

        self.shutdown(&mut outbound).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::DeclareExchange(spec, reply) => {
                let result = match &self.session {
                    Some(session) => session.declare_exchange(&spec).await,
                    None => Err(TransportError::NotConnected),
                };
                if result.is_ok() {
                    debug!(exchange = %spec.name, "Exchange declared");
                    self.topology.exchanges.push(spec);
                }
                let _ = reply.send(result);
            }
            Command::DeclareQueue(spec, reply) => {
                let result = match &self.session {
                    Some(session) => session.declare_queue(&spec).await,
                    None => Err(TransportError::NotConnected),
                };
                if let Ok(name) = &result {
                    debug!(queue = %name, exchange = %spec.exchange, routing_key = %spec.routing_key, "Queue declared");
                    self.topology.queues.push((spec, name.clone()));
                }
                let _ = reply.send(result);
            }
            Command::Consume(spec, reply) => {
                let result = match &self.session {
                    Some(session) => session.consume(&spec.queue, &spec.tag).await,
                    None => Err(TransportError::NotConnected),
                };
                let result = result.map(|stream| {
                    self.pumps.push(spawn_pump(&spec, stream));
                    debug!(queue = %spec.queue, tag = %spec.tag, "Consumer registered");
                    self.topology.consumers.push(spec);
                });
                let _ = reply.send(result);
            }
        }
    }

    async fn publish(&mut self, message: OutboundMessage) {
        let Some(session) = &self.session else {
            self.pending.push_back(message);
            return;
        };
        if let Err(e) = session.publish(&message).await {
            warn!(error = %e, exchange = %message.exchange, "Publish failed, message kept for resend");
            self.pending.push_back(message);
            self.mark_broken(&e.to_string()).await;
        }
    }

    async fn mark_broken(&mut self, reason: &str) {
        if self.session.is_none() {
            return;
        }
        warn!(reason = %reason, "⚠️ Broker link broken");
        self.session = None;
        self.events = None;
        let _ = self.state.send(LinkState::Broken);
        self.drain_pumps().await;
    }

    /// Wait for consumer pumps to finish delivering what they already have
    async fn drain_pumps(&mut self) {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(self.config.reconnect_interval, &mut pump)
                .await
                .is_err()
            {
                pump.abort();
            }
        }
    }

    async fn reconnect(&mut self) -> TransportResult<()> {
        let (session, events) = self
            .connector
            .connect()
            .await
            .map_err(|e| TransportError::Replay(e.to_string()))?;
        self.pumps = self.replay(session.as_ref()).await?;

        self.session = Some(session);
        self.events = Some(events);
        let _ = self.state.send(LinkState::Connected);
        info!(
            exchanges = self.topology.exchanges.len(),
            queues = self.topology.queues.len(),
            consumers = self.topology.consumers.len(),
            pending = self.pending.len(),
            "📡 Broker reconnected, topology replayed"
        );

        while let Some(message) = self.pending.pop_front() {
            let Some(session) = &self.session else {
                self.pending.push_front(message);
                break;
            };
            if let Err(e) = session.publish(&message).await {
                warn!(error = %e, "Resend failed");
                self.pending.push_front(message);
                self.mark_broken(&e.to_string()).await;
                break;
            }
        }
        Ok(())
    }

    /// Re-declare everything on a fresh session. On failure the pumps
    /// started so far are aborted.
    async fn replay(&mut self, session: &dyn Session) -> TransportResult<Vec<JoinHandle<()>>> {
        let replay_err = |what: &str, e: TransportError| TransportError::Replay(format!("{what}: {e}"));

        for exchange in &self.topology.exchanges {
            session
                .declare_exchange(exchange)
                .await
                .map_err(|e| replay_err(&exchange.name, e))?;
        }

        for (spec, assigned) in self.topology.queues.iter_mut() {
            let name = session
                .declare_queue(spec)
                .await
                .map_err(|e| replay_err(&spec.name, e))?;
            if name != *assigned {
                for consumer in self.topology.consumers.iter_mut() {
                    if consumer.queue == *assigned {
                        consumer.queue = name.clone();
                    }
                }
                *assigned = name;
            }
        }

        let mut pumps = Vec::with_capacity(self.topology.consumers.len());
        for consumer in &self.topology.consumers {
            match session.consume(&consumer.queue, &consumer.tag).await {
                Ok(stream) => pumps.push(spawn_pump(consumer, stream)),
                Err(e) => {
                    for pump in pumps {
                        pump.abort();
                    }
                    return Err(replay_err(&consumer.tag, e));
                }
            }
        }
        Ok(pumps)
    }

    async fn shutdown(mut self, outbound: &mut mpsc::Receiver<OutboundMessage>) {
        outbound.close();
        if let Some(session) = self.session.take() {
            let mut flushed = 0usize;
            while let Some(message) = self.pending.pop_front() {
                if session.publish(&message).await.is_ok() {
                    flushed += 1;
                }
            }
            while let Some(message) = outbound.recv().await {
                match session.publish(&message).await {
                    Ok(()) => flushed += 1,
                    Err(e) => warn!(error = %e, "Publish during shutdown failed"),
                }
            }
            if let Err(e) = session.close().await {
                warn!(error = %e, "Broker session close failed");
            }
            info!(flushed, "Broker session closed");
        } else {
            let mut dropped = self.pending.len();
            while outbound.recv().await.is_some() {
                dropped += 1;
            }
            warn!(dropped, "Transport closed while link broken, queued messages dropped");
        }

        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        let _ = self.state.send(LinkState::Closed);
    }
}

fn spawn_pump(consumer: &ConsumerSpec, mut stream: DeliveryStream) -> JoinHandle<()> {
    let handler = consumer.handler.clone();
    let tag = consumer.tag.clone();
    tokio::spawn(async move {
        while let Some(delivery) = stream.next().await {
            handler(delivery);
        }
        debug!(tag = %tag, "Consumer stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            reconnect_interval: Duration::from_millis(20),
            publish_queue_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let result = Transport::start(broker, config()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_consume_requires_tag() {
        let transport = Transport::start(MemoryBroker::new(), config()).await.unwrap();
        let handle = transport.handle();
        let err = handle.consume("kline", "", |_| {}).await.unwrap_err();
        assert_eq!(err, TransportError::InvalidConsumer);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_server_named_queue() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();
        handle.declare_exchange("ex").await.unwrap();
        let name = handle.declare_queue("", "ex", "kline").await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.has_queue(&name));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();
        handle.declare_exchange("ex").await.unwrap();
        for i in 0..5 {
            handle.publish_transient("ex", "kline", format!("m{i}")).await.unwrap();
        }
        transport.close().await;

        let bodies: Vec<Vec<u8>> = broker.published().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies.len(), 5);
        assert_eq!(bodies[4], b"m4".to_vec());
        assert_eq!(transport.state(), LinkState::Closed);
        assert_eq!(broker.closed_sessions(), 1);
        assert!(handle.publish_transient("ex", "kline", "late").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_publish_is_resent_after_reconnect() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();
        handle.declare_exchange("ex").await.unwrap();

        broker.fail_next_publishes(1);
        handle.publish_persistent("ex", "kline", "first").await.unwrap();
        handle.publish_persistent("ex", "kline", "second").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.published().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let bodies: Vec<Vec<u8>> = broker.published().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![b"first".to_vec(), b"second".to_vec()]);
        assert!(broker.connections() >= 2);
        transport.close().await;
    }
}
