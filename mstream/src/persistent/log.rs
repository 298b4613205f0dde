use async_trait::async_trait;
use tracing::{info, Span};

use super::{Error, Storage};

/// Storage that only logs what it is asked to persist.
///
/// Reads always come back empty, so a streamer using it starts from the
/// current tail on every restart. Meant for local runs and diagnostics.
pub struct LogStorage {
    span: Span,
}

impl LogStorage {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

#[async_trait]
impl Storage for LogStorage {
    async fn write(&self, value: &str) -> Result<(), Error> {
        self.span.in_scope(|| info!(data = %value, "persistent: write data"));
        Ok(())
    }

    async fn read(&self) -> Result<String, Error> {
        self.span.in_scope(|| info!("persistent: read data"));
        Ok(String::new())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.span.in_scope(|| info!("persistent: clear data"));
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
