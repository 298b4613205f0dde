use std::sync::Arc;

use mongodb::bson::Document;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::client::{ChangeCursor, Feed, WatchOptions};
use crate::config::WatchedDb;
use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::model::ChangeEvent;
use crate::persistent::{self, CheckpointBuffer};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Change stream error: {0}")]
    Feed(#[from] super::Error),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] persistent::Error),
}

/// Tails one collection's change stream and publishes every event.
///
/// An event's resume token is handed to the [`CheckpointBuffer`] only after the
/// handler acknowledged it. Events that fail to decode or publish are counted,
/// logged and skipped; they are not retried within this run.
pub struct Watcher {
    cursor: Box<dyn ChangeCursor>,
    processor: EventProcessor,
    span: Span,
}

/// Per-event work, kept apart from the cursor so it can be shared across awaits.
struct EventProcessor {
    handler: Arc<dyn Handler>,
    buffer: Arc<CheckpointBuffer>,
    metrics: Metrics,
    db: String,
    coll: String,
}

impl Watcher {
    /// Open the change stream, resuming after the last checkpoint if there is one.
    ///
    /// If the feed can no longer resume from the stored token, the checkpoint
    /// is cleared and the stream is opened once more at the current tail.
    ///
    /// # Errors
    /// Any other failure to read the checkpoint or open the stream.
    pub async fn new(
        feed: &dyn Feed,
        watched: &WatchedDb,
        handler: Arc<dyn Handler>,
        buffer: Arc<CheckpointBuffer>,
        metrics: Metrics,
        span: Span,
    ) -> Result<Self, Error> {
        let cursor = Self::open(feed, watched, &buffer)
            .instrument(span.clone())
            .await?;
        Ok(Self {
            cursor,
            processor: EventProcessor {
                handler,
                buffer,
                metrics,
                db: watched.db_name.clone(),
                coll: watched.coll_name.clone(),
            },
            span,
        })
    }

    async fn open(
        feed: &dyn Feed,
        watched: &WatchedDb,
        buffer: &CheckpointBuffer,
    ) -> Result<Box<dyn ChangeCursor>, Error> {
        let (db, coll) = (watched.db_name.as_str(), watched.coll_name.as_str());
        let token = buffer.get().await?;
        let mut options = WatchOptions {
            resume_after: (!token.is_empty()).then_some(token),
            batch_size: watched.batch_size,
        };
        debug!(db, coll, resume_after = ?options.resume_after, "Opening change stream");

        match feed.watch(db, coll, options.clone()).await {
            Ok(cursor) => Ok(cursor),
            Err(e) if e.requires_resync() => {
                warn!(db, coll, error = %e, "Resume token is not usable, reset resume token and retry");
                buffer.clear().await?;
                options.resume_after = None;
                Ok(feed.watch(db, coll, options).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Process events until `cancel` fires or the stream ends.
    ///
    /// A cancellation never interrupts an event that is already being
    /// published; it is observed between events.
    ///
    /// # Errors
    /// Returns [`Error::Feed`] when the change stream fails. Events already
    /// handled keep their checkpoints; the stream is not reopened here.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        let span = self.span.clone();
        let (db, coll) = (self.processor.db.clone(), self.processor.coll.clone());
        async {
            info!(db = %db, coll = %coll, "Started watching collection");
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Change stream watcher cancelled");
                        return Ok(());
                    }
                    next = self.cursor.next() => next,
                };
                match next {
                    Some(Ok(raw)) => {
                        // The cursor does not move while the event is handled.
                        let token = self.cursor.resume_token();
                        self.processor.process(raw, token).await;
                    }
                    Some(Err(e)) => {
                        error!(db = %db, coll = %coll, error = %e, "Change stream error");
                        return Err(Error::Feed(e));
                    }
                    None => {
                        info!(db = %db, coll = %coll, "Change stream ended");
                        return Ok(());
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Close the change stream cursor. The checkpoint buffer is left to its owner.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.cursor.close().await?;
        Ok(())
    }
}

impl EventProcessor {
    async fn process(&self, raw: Document, token: Option<String>) {
        let (db, coll) = (self.db.as_str(), self.coll.as_str());
        self.metrics.record_received(db, coll);

        let event = match ChangeEvent::from_document(raw) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_handle_failed(db, coll);
                error!(db, coll, error = %e, "Failed to decode change stream event");
                return;
            }
        };

        match event.to_json() {
            Ok(body) => self.metrics.record_received_bytes(db, coll, body.len()),
            // Only the size metric depends on this.
            Err(e) => error!(db, coll, error = %e, "Failed to marshal change stream event to json"),
        }

        // TODO: retry failed publishes instead of skipping the event's checkpoint.
        if let Err(e) = self.handler.handle(&event).await {
            self.metrics.record_handle_failed(db, coll);
            error!(db, coll, error = %e, operation = %event.operation_type, "Failed to handle change stream event");
            return;
        }
        self.metrics.record_handle_success(db, coll);

        let Some(token) = token else {
            warn!(db, coll, "No resume token after change stream event");
            return;
        };
        if let Err(e) = self.buffer.set(token).await {
            error!(db, coll, error = %e, "Failed to save resume token");
        }
    }
}
