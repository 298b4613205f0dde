//! Wires the feed, checkpoint buffer, watcher and publisher together for one collection.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Settings, StorageKind, WatchedDb};
use crate::handler::{self, EventHandler, Handler, PublishFormat};
use crate::metrics::Metrics;
use crate::mongo::{self, watcher, Feed, MongoFeed, Watcher};
use crate::persistent::{self, CheckpointBuffer, FileStorage, LogStorage, MongoStorage, Storage};
use crate::rabbitmq::{self, Publisher};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Watcher error: {0}")]
    Watcher(#[from] watcher::Error),
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongo::Error),
    #[error("RabbitMQ error: {0}")]
    RabbitMq(#[from] rabbitmq::Error),
    #[error("Checkpoint storage error: {0}")]
    Storage(#[from] persistent::Error),
    #[error("Publish handler error: {0}")]
    Handler(#[from] handler::Error),
}

const RETRY_DELAY: Duration = Duration::from_secs(5);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// A running MongoDB to RabbitMQ stream for a single collection.
///
/// Construct with [`Streamer::new`], drive with [`Streamer::stream`] and tear
/// down with [`Streamer::close`] once streaming returned.
pub struct Streamer {
    feed: MongoFeed,
    connection: Arc<lapin::Connection>,
    publisher: Arc<Publisher>,
    buffer: Arc<CheckpointBuffer>,
    watcher: Watcher,
    span: Span,
}

impl Streamer {
    /// Generic retry function with timeout for connection operations
    async fn retry_with_timeout<T, F, Fut, E>(
        operation: F,
        timeout: Duration,
        retry_delay: Duration,
        operation_name: &str,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start_time = std::time::Instant::now();

        loop {
            match operation().await {
                Ok(result) => {
                    info!("{} successful", operation_name);
                    return Ok(result);
                }
                Err(e) => {
                    error!(error = %e, "Failed {}", operation_name);

                    if start_time.elapsed() >= timeout {
                        error!("{} attempts timed out after {:?}", operation_name, timeout);
                        return Err(e);
                    }

                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn connect_to_mongo(settings: &Settings) -> Result<MongoFeed, Error> {
        let feed = Self::retry_with_timeout(
            || MongoFeed::connect(settings.connections()),
            CONNECTION_TIMEOUT,
            RETRY_DELAY,
            "MongoDB connection initialization",
        )
        .await?;
        Ok(feed)
    }

    async fn connect_to_rabbitmq(settings: &Settings) -> Result<Arc<lapin::Connection>, Error> {
        let rabbitmq_uri = settings.connections().rabbitmq_uri.clone();

        let connection = Self::retry_with_timeout(
            || async {
                lapin::Connection::connect(&rabbitmq_uri, lapin::ConnectionProperties::default())
                    .await
            },
            CONNECTION_TIMEOUT,
            RETRY_DELAY,
            "RabbitMQ connection initialization",
        )
        .await
        .map_err(rabbitmq::Error::from)?;

        Ok(Arc::new(connection))
    }

    async fn disconnect_rabbitmq(connection: &lapin::Connection) {
        if let Err(e) = connection.close(200, "OK").await {
            warn!(error = %e, "Failed to close RabbitMQ connection");
        }
    }

    /// Connect to MongoDB and RabbitMQ concurrently.
    async fn connect_clients(
        settings: &Settings,
    ) -> Result<(MongoFeed, Arc<lapin::Connection>), Error> {
        tokio::try_join!(
            Self::connect_to_mongo(settings),
            Self::connect_to_rabbitmq(settings)
        )
    }

    async fn storage(
        settings: &Settings,
        feed: &MongoFeed,
        span: &Span,
    ) -> Result<Arc<dyn Storage>, Error> {
        let checkpoint = settings.checkpoint();
        let storage: Arc<dyn Storage> = match checkpoint.storage {
            StorageKind::File => Arc::new(
                FileStorage::new(checkpoint.path.as_deref().unwrap_or_default()).await?,
            ),
            StorageKind::Log => Arc::new(LogStorage::new(span.clone())),
            StorageKind::Mongo => Arc::new(MongoStorage::new(
                feed.client(),
                checkpoint.tokens_db_name.as_deref().unwrap_or_default(),
                checkpoint.tokens_coll_name.as_deref().unwrap_or_default(),
                &settings.rabbitmq().stream_name,
            )),
        };
        Ok(storage)
    }

    /// Open the change stream with `buffer` as its checkpoint.
    ///
    /// The buffer is closed if the stream cannot be opened.
    async fn start_watcher(
        feed: &dyn Feed,
        watched: &WatchedDb,
        handler: Arc<dyn Handler>,
        buffer: Arc<CheckpointBuffer>,
        metrics: Metrics,
        span: Span,
    ) -> Result<Watcher, Error> {
        match Watcher::new(feed, watched, handler, buffer.clone(), metrics, span).await {
            Ok(watcher) => Ok(watcher),
            Err(e) => {
                if let Err(close) = buffer.close().await {
                    warn!(error = %close, "Failed to close checkpoint buffer");
                }
                Err(e.into())
            }
        }
    }

    /// Build everything between the two connections.
    ///
    /// Whatever was opened here is closed again on failure; the feed is left
    /// to the caller.
    async fn assemble(
        settings: &Settings,
        feed: &MongoFeed,
        connection: Arc<lapin::Connection>,
        metrics: Metrics,
        span: &Span,
    ) -> Result<(Arc<Publisher>, Arc<CheckpointBuffer>, Watcher), Error> {
        let publisher =
            Arc::new(Publisher::with_connection(settings.rabbitmq().clone(), connection).await?);

        let started = async {
            let handler = Arc::new(EventHandler::new(
                publisher.clone(),
                &settings.rabbitmq().publish_format,
                span.clone(),
            )?);
            let storage = Self::storage(settings, feed, span).await?;
            let checkpoint = settings.checkpoint();
            let buffer = Arc::new(CheckpointBuffer::new(
                checkpoint.capacity,
                checkpoint.flush_interval(),
                storage,
                span.clone(),
            ));
            let watcher = Self::start_watcher(
                feed,
                settings.watched(),
                handler,
                buffer.clone(),
                metrics,
                span.clone(),
            )
            .await?;
            Ok::<_, Error>((buffer, watcher))
        }
        .await;

        match started {
            Ok((buffer, watcher)) => Ok((publisher, buffer, watcher)),
            Err(e) => {
                if let Err(close) = publisher.close().await {
                    warn!(error = %close, "Failed to close RabbitMQ channel");
                }
                Err(e)
            }
        }
    }

    /// Connect to both ends and open the change stream.
    ///
    /// # Errors
    /// Fails on an unsupported publish format, when a connection cannot be
    /// established before the retry timeout, or when the change stream cannot
    /// be opened. Connections opened before the failure are closed again.
    pub async fn new(settings: &Settings, metrics: Metrics, span: Span) -> Result<Self, Error> {
        settings
            .rabbitmq()
            .publish_format
            .parse::<PublishFormat>()?;

        async {
            let (feed, connection) = Self::connect_clients(settings).await?;

            match Self::assemble(settings, &feed, connection.clone(), metrics, &span).await {
                Ok((publisher, buffer, watcher)) => Ok(Self {
                    feed,
                    connection,
                    publisher,
                    buffer,
                    watcher,
                    span: span.clone(),
                }),
                Err(e) => {
                    error!(error = %e, "Failed to start streamer");
                    Self::disconnect_rabbitmq(&connection).await;
                    feed.disconnect().await;
                    Err(e)
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Stream change events until `cancel` fires or the change stream ends.
    ///
    /// Runs the periodic checkpoint flush alongside the watcher.
    ///
    /// # Errors
    /// Returns [`Error::Watcher`] when the change stream failed. The streamer
    /// should then be closed; it does not reopen the stream itself.
    pub async fn stream(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        let flush_cancel = cancel.child_token();
        let flusher = tokio::spawn({
            let buffer = self.buffer.clone();
            let flush_cancel = flush_cancel.clone();
            async move { buffer.watch(flush_cancel).await }
        });

        self.span
            .in_scope(|| info!("starting change stream watcher"));
        let result = self.watcher.run(cancel).await;

        flush_cancel.cancel();
        if let Err(e) = flusher.await {
            self.span
                .in_scope(|| error!(error = %e, "checkpoint flush task panicked"));
        }
        result.map_err(Error::from)
    }

    /// Close the change stream, flush and close the checkpoint buffer, then
    /// disconnect from both ends.
    ///
    /// Every step runs; the first error is returned.
    pub async fn close(mut self) -> Result<(), Error> {
        let span = self.span.clone();
        async move {
            let watcher = self.watcher.close().await.map_err(Error::from);
            let buffer = self.buffer.close().await.map_err(Error::from);
            let publisher = self.publisher.close().await.map_err(Error::from);
            Self::disconnect_rabbitmq(&self.connection).await;
            self.feed.disconnect().await;

            let result = watcher.and(buffer).and(publisher);
            match &result {
                Ok(()) => info!("streamer closed"),
                Err(e) => error!(error = %e, "failed to close streamer cleanly"),
            }
            result
        }
        .instrument(span)
        .await
    }
}
