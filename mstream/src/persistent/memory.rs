use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Error, Storage};

#[derive(Debug, Default)]
struct Slot {
    value: String,
    history: Vec<String>,
    clears: usize,
    closed: bool,
}

/// In-process token slot.
///
/// Keeps every committed write in order, which lets callers check exactly
/// which tokens reached durable storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slot: Mutex<Slot>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the slot as if `value` had been written by a previous run.
    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: value.into(),
                ..Slot::default()
            }),
        }
    }

    /// All values written so far, oldest first.
    pub async fn history(&self) -> Vec<String> {
        self.slot.lock().await.history.clone()
    }

    pub async fn clears(&self) -> usize {
        self.slot.lock().await.clears
    }

    pub async fn is_closed(&self) -> bool {
        self.slot.lock().await.closed
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, value: &str) -> Result<(), Error> {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(Error::Closed);
        }
        slot.value = value.to_string();
        slot.history.push(value.to_string());
        Ok(())
    }

    async fn read(&self) -> Result<String, Error> {
        let slot = self.slot.lock().await;
        if slot.closed {
            return Err(Error::Closed);
        }
        Ok(slot.value.clone())
    }

    async fn clear(&self) -> Result<(), Error> {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(Error::Closed);
        }
        slot.value.clear();
        slot.clears += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.slot.lock().await.closed = true;
        Ok(())
    }
}
