//! Publishes decoded change events and waits for the sink to acknowledge them.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, Instrument, Span};

use crate::model::{self, ChangeEvent};
use crate::rabbitmq::{self, Message, Publish};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid publish format: {0}")]
    InvalidPublishFormat(String),
    #[error("Failed to serialize change event: {0}")]
    Serialize(#[from] model::Error),
    #[error("Failed to publish change event: {0}")]
    Publish(#[from] rabbitmq::Error),
}

/// Encoding of the outbound message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFormat {
    Json,
    Avro,
}

impl PublishFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            PublishFormat::Json => "application/json",
            PublishFormat::Avro => "avro/binary",
        }
    }

    fn encode(&self, event: &ChangeEvent) -> Result<Vec<u8>, model::Error> {
        match self {
            PublishFormat::Json => event.to_json(),
            PublishFormat::Avro => event.to_avro(),
        }
    }
}

impl FromStr for PublishFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(PublishFormat::Json),
            "avro" => Ok(PublishFormat::Avro),
            _ => Err(Error::InvalidPublishFormat(s.to_string())),
        }
    }
}

/// Sink acknowledgement of a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub id: String,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Deliver `event` downstream, returning only once it was acknowledged.
    async fn handle(&self, event: &ChangeEvent) -> Result<Ack, Error>;
}

/// [`Handler`] that encodes events and publishes them through a [`Publish`] sink.
pub struct EventHandler {
    publisher: Arc<dyn Publish>,
    format: PublishFormat,
    span: Span,
}

impl EventHandler {
    /// # Errors
    /// Returns [`Error::InvalidPublishFormat`] for anything but `json` or `avro`.
    pub fn new(publisher: Arc<dyn Publish>, publish_format: &str, span: Span) -> Result<Self, Error> {
        Ok(Self {
            publisher,
            format: publish_format.parse()?,
            span,
        })
    }

    pub fn format(&self) -> PublishFormat {
        self.format
    }
}

#[async_trait]
impl Handler for EventHandler {
    async fn handle(&self, event: &ChangeEvent) -> Result<Ack, Error> {
        let message = Message {
            data: self.format.encode(event)?,
            content_type: self.format.content_type(),
        };
        async {
            let pending = self.publisher.publish(message).await?;
            let id = pending.await?;
            info!(id = %id, operation = %event.operation_type, "successful publish event");
            Ok::<_, Error>(Ack { id })
        }
        .instrument(self.span.clone())
        .await
    }
}
