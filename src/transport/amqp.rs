//! RabbitMQ connector built on lapin
//!
//! One connection and one channel per session. Connection errors are
//! forwarded as `BrokerEvent::Closed` so the reactor can reconnect.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    BrokerEvent, BrokerEvents, Connector, Delivery, DeliveryStream, ExchangeSpec, OutboundMessage,
    QueueSpec, Session,
};

const CONTENT_TYPE: &str = "text/plain";

pub struct AmqpConnector {
    url: String,
    app_id: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> TransportResult<(Box<dyn Session>, BrokerEvents)> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = events_tx.send(BrokerEvent::Closed(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        debug!(channel = channel.id(), "AMQP channel opened");
        let session = AmqpSession {
            connection,
            channel,
            app_id: self.app_id.clone(),
        };
        Ok((Box::new(session), events_rx))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    app_id: String,
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(&spec.name, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| TransportError::Declare(e.to_string()))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<String> {
        let options = QueueDeclareOptions {
            auto_delete: true,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|e| TransportError::Declare(e.to_string()))?;
        let name = queue.name().as_str().to_string();

        if !spec.exchange.is_empty() {
            self.channel
                .queue_bind(
                    &name,
                    &spec.exchange,
                    &spec.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Declare(e.to_string()))?;
        }
        Ok(name)
    }

    async fn consume(&self, queue: &str, tag: &str) -> TransportResult<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, tag, options, FieldTable::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        let stream = consumer.filter_map(|delivery| async move {
            match delivery {
                Ok(d) => Some(Delivery {
                    exchange: d.exchange.as_str().to_string(),
                    routing_key: d.routing_key.as_str().to_string(),
                    body: d.data,
                }),
                Err(e) => {
                    debug!(error = %e, "Consumer delivery error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, message: &OutboundMessage) -> TransportResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(message.mode.code())
            .with_content_type(CONTENT_TYPE.into())
            .with_timestamp(message.timestamp)
            .with_app_id(self.app_id.as_str().into())
            .with_message_id(uuid::Uuid::new_v4().to_string().into());

        // The returned confirm is only meaningful in confirm mode, which is not enabled.
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}
