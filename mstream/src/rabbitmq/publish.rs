use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::Error;

/// An outbound message body and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    pub content_type: &'static str,
}

/// Resolves to the sink-assigned identifier once the broker confirmed the message.
pub type PendingAck = BoxFuture<'static, Result<String, Error>>;

#[async_trait]
pub trait Publish: Send + Sync {
    /// Hand `message` to the sink.
    ///
    /// Returns as soon as the message was sent; await the returned
    /// [`PendingAck`] for the broker's confirmation.
    async fn publish(&self, message: Message) -> Result<PendingAck, Error>;
}
