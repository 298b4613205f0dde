use std::future::Future;
use std::sync::Arc;

use super::error::Error;
use super::publish::{Message, PendingAck, Publish};
use crate::config::RabbitMq;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::trace;

const PERSISTENT_DELIVERY: u8 = 2;

/// RabbitMQ publisher for change events.
///
/// The `Publisher` owns a channel in publisher-confirm mode and publishes to
/// the configured queue through the default exchange. Every published message
/// is identified by the channel's delivery tag, which is what the broker
/// acknowledges.
pub struct Publisher {
    pub config: RabbitMq,
    channel: Channel,
    delivery_tags: DeliveryTags,
    // DD: to hold a connection while the channel is alive
    _connection: Arc<Connection>,
}

impl Publisher {
    /// Create a new `Publisher` for the given RabbitMQ configuration and URI.
    ///
    /// This method establishes a connection to RabbitMQ, creates a channel, and declares the target queue.
    ///
    /// # Errors
    /// Returns an error if the connection, channel, or queue declaration fails.
    pub async fn new(config: &RabbitMq, rabbitmq_uri: &str) -> Result<Self, Error> {
        let conn = Connection::connect(rabbitmq_uri, ConnectionProperties::default()).await?;
        Self::with_connection(config.clone(), Arc::new(conn)).await
    }

    /// Create a new `Publisher` using an existing RabbitMQ connection.
    ///
    /// The publisher gets its own channel but shares the provided connection.
    ///
    /// # Errors
    /// Returns an error if the channel creation, confirm mode, or queue declaration fails.
    pub async fn with_connection(
        config: RabbitMq,
        connection: Arc<Connection>,
    ) -> Result<Self, Error> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .queue_declare(
                &config.stream_name,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            config,
            channel,
            delivery_tags: DeliveryTags::default(),
            _connection: connection,
        })
    }

    /// Publish `message` to the configured queue.
    ///
    /// # Errors
    /// Returns an error if the message cannot be sent. Broker rejection is
    /// reported by the returned [`PendingAck`].
    pub async fn publish(&self, message: Message) -> Result<PendingAck, Error> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(PERSISTENT_DELIVERY);
        let (delivery_tag, sent) = self
            .delivery_tags
            .send(self.channel.basic_publish(
                "",
                &self.config.stream_name,
                BasicPublishOptions::default(),
                &message.data,
                properties,
            ))
            .await;
        let confirm = sent?;

        trace!(queue = %self.config.stream_name, delivery_tag, bytes = message.data.len(), "Published message to RabbitMQ");
        Ok(Box::pin(async move {
            match confirm.await? {
                Confirmation::Nack(_) => Err(Error::Nacked { delivery_tag }),
                Confirmation::Ack(_) | Confirmation::NotRequested => Ok(delivery_tag.to_string()),
            }
        }))
    }

    /// Close the channel. The shared connection stays open.
    pub async fn close(&self) -> Result<(), Error> {
        self.channel.close(200, "OK").await?;
        Ok(())
    }
}

/// Mirrors the broker's delivery tag numbering for one confirm-mode channel.
///
/// The broker numbers every publish attempt on the channel, so a tag is
/// consumed even when sending fails.
#[derive(Debug, Default)]
struct DeliveryTags {
    last: Mutex<u64>,
}

impl DeliveryTags {
    /// Run `send` under the tag lock and return the tag it was assigned.
    async fn send<T, E>(
        &self,
        send: impl Future<Output = Result<T, E>>,
    ) -> (u64, Result<T, E>) {
        let mut last = self.last.lock().await;
        *last += 1;
        let tag = *last;
        (tag, send.await)
    }
}

#[async_trait::async_trait]
impl Publish for Publisher {
    async fn publish(&self, message: Message) -> Result<PendingAck, Error> {
        self.publish(message).await
    }
}
