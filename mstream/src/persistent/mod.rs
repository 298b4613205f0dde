//! Durable storage for the last acknowledged resume token.
//!
//! A [`Storage`] is a single slot holding an opaque string. The
//! [`CheckpointBuffer`] sits in front of it and coalesces high frequency
//! updates into occasional writes.

pub mod buffer;
pub mod error;
pub mod file;
pub mod log;
pub mod memory;
pub mod mongo;

use async_trait::async_trait;

pub use buffer::CheckpointBuffer;
pub use error::Error;
pub use file::FileStorage;
pub use log::LogStorage;
pub use memory::MemoryStorage;
pub use mongo::MongoStorage;

/// A durable slot holding one resume token.
///
/// Every `read` reflects the last successful `write`; implementations must not
/// cache. `read` returns an empty string when nothing has been written or the
/// slot was cleared.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, value: &str) -> Result<(), Error>;

    async fn read(&self) -> Result<String, Error>;

    /// Reset the slot to the "nothing written" state. Idempotent.
    async fn clear(&self) -> Result<(), Error>;

    /// Release the underlying resource.
    async fn close(&self) -> Result<(), Error>;
}
