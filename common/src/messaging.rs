use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;

pub const DOCUMENT_EXCHANGE: &str = "documents";
// queues
pub const DOCUMENT_QUEUE: &str = "documents";
pub const INVESTIGATION_QUEUE: &str = "investigations";
pub const FAILED_DOCUMENT_QUEUE: &str = "documents.failed";

/// Correlation header carried end-to-end for tracing.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
/// Delivery attempt counter maintained across republishes.
pub const ATTEMPTS_HEADER: &str = "x-attempts";

/// RabbitMQ client owning the connection, one channel and the direct
/// exchange all queues are bound to.
pub struct RabbitMqClient {
    _connection: Connection,
    pub channel: Channel,
}

impl RabbitMqClient {
    /// Connects, declares the durable direct exchange and declares + binds
    /// every queue of the document flow.
    pub async fn new(addr: &str) -> Result<Self, AppError> {
        let connection = Connection::connect(addr, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                DOCUMENT_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        for queue in [DOCUMENT_QUEUE, INVESTIGATION_QUEUE, FAILED_DOCUMENT_QUEUE] {
            Self::declare_and_bind_queue(&channel, queue).await?;
        }

        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    async fn declare_and_bind_queue(channel: &Channel, name: &str) -> Result<(), AppError> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                name,
                DOCUMENT_EXCHANGE,
                name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Publishes a JSON-encoded message. A request id header is generated
    /// when the caller does not carry one forward.
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        body: &T,
        correlation_id: Option<String>,
        request_id: Option<String>,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_vec(body)?;
        self.publish_raw(routing_key, payload, correlation_id, request_id, None)
            .await
    }

    /// Publishes pre-encoded bytes, preserving tracing headers. Used by the
    /// dead-letter path, which must forward the original body untouched.
    pub async fn publish_raw(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        correlation_id: Option<String>,
        request_id: Option<String>,
        attempts: Option<u32>,
    ) -> Result<(), AppError> {
        let mut headers = FieldTable::default();
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        headers.insert(
            ShortString::from(REQUEST_ID_HEADER),
            AMQPValue::LongString(request_id.clone().into()),
        );
        if let Some(attempts) = attempts {
            headers.insert(
                ShortString::from(ATTEMPTS_HEADER),
                AMQPValue::LongUInt(attempts),
            );
        }

        let mut properties = BasicProperties::default().with_headers(headers);
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }

        self.channel
            .basic_publish(
                DOCUMENT_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;

        debug!(%routing_key, %request_id, "published message");

        Ok(())
    }

    /// Starts a manually-acked consumer on the given queue.
    pub async fn consumer(&self, queue: &str, tag: &str) -> Result<Consumer, AppError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer)
    }
}

/// Reads the request id header from a delivery, if present.
pub fn request_id_from(headers: Option<&FieldTable>) -> Option<String> {
    headers
        .and_then(|table| table.inner().get(REQUEST_ID_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongString(s) => Some(s.to_string()),
            AMQPValue::ShortString(s) => Some(s.to_string()),
            _ => None,
        })
}

/// Reads the attempt counter header from a delivery, defaulting to zero.
pub fn attempts_from(headers: Option<&FieldTable>) -> u32 {
    headers
        .and_then(|table| table.inner().get(ATTEMPTS_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0)
}
