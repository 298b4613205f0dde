use async_trait::async_trait;
use futures_util::stream::StreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    change_stream::{event::ResumeToken, ChangeStream},
    options::{ClientOptions, Credential, ServerApi, ServerApiVersion},
    Client,
};
use tracing::debug;

use super::Error;
use crate::config::Connections;

/// How to open a change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Resume right after this token instead of at the current tail.
    pub resume_after: Option<String>,
    pub batch_size: Option<u32>,
}

/// An open change stream.
#[async_trait]
pub trait ChangeCursor: Send {
    /// Wait for the next raw change document. `None` once the stream ended.
    async fn next(&mut self) -> Option<Result<Document, Error>>;

    /// Token for the position right after the last returned document.
    fn resume_token(&self) -> Option<String>;

    /// Release the server side cursor. Safe to call more than once.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Source of change streams for a database/collection pair.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn watch(
        &self,
        db: &str,
        coll: &str,
        options: WatchOptions,
    ) -> Result<Box<dyn ChangeCursor>, Error>;
}

/// MongoDB connection used as the change feed.
///
/// No retries happen here; errors go back to the caller.
pub struct MongoFeed {
    client: Client,
}

impl MongoFeed {
    /// Connect to MongoDB and verify the connection with a `ping`.
    ///
    /// Credentials are applied only when both user and password are set.
    ///
    /// # Errors
    /// Returns [`Error::Connect`] if the URI is invalid or the server is unreachable.
    pub async fn connect(connections: &Connections) -> Result<Self, Error> {
        let mut options = ClientOptions::parse(&connections.mongo_uri)
            .await
            .map_err(Error::Connect)?;
        options.server_api = Some(ServerApi::builder().version(ServerApiVersion::V1).build());
        if let (Some(user), Some(password)) = (&connections.mongo_user, &connections.mongo_password) {
            options.credential = Some(
                Credential::builder()
                    .username(user.clone())
                    .password(password.clone())
                    .build(),
            );
        }

        let client = Client::with_options(options).map_err(Error::Connect)?;
        client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await
            .map_err(Error::Connect)?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn disconnect(self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl Feed for MongoFeed {
    async fn watch(
        &self,
        db: &str,
        coll: &str,
        options: WatchOptions,
    ) -> Result<Box<dyn ChangeCursor>, Error> {
        let collection = self.client.database(db).collection::<Document>(coll);

        let mut watch = collection.watch();
        if let Some(token) = options.resume_after.as_deref() {
            watch = watch.resume_after(parse_resume_token(token)?);
        }
        if let Some(batch_size) = options.batch_size {
            watch = watch.batch_size(batch_size);
        }

        let stream = watch.await.map_err(Error::from_watch)?;
        debug!(db, coll, resumed = options.resume_after.is_some(), "Opened change stream");
        Ok(Box::new(MongoCursor {
            stream: Some(stream.with_type::<Document>()),
        }))
    }
}

struct MongoCursor {
    stream: Option<ChangeStream<Document>>,
}

#[async_trait]
impl ChangeCursor for MongoCursor {
    async fn next(&mut self) -> Option<Result<Document, Error>> {
        let stream = self.stream.as_mut()?;
        stream.next().await.map(|r| r.map_err(Error::from))
    }

    fn resume_token(&self) -> Option<String> {
        let token = self.stream.as_ref()?.resume_token()?;
        format_resume_token(&token).ok()
    }

    async fn close(&mut self) -> Result<(), Error> {
        // Dropping the stream kills the server side cursor.
        self.stream.take();
        Ok(())
    }
}

/// Render a driver resume token as extended JSON text.
pub fn format_resume_token(token: &ResumeToken) -> Result<String, bson::ser::Error> {
    Ok(bson::to_bson(token)?.into_relaxed_extjson().to_string())
}

/// Parse extended JSON text produced by [`format_resume_token`].
pub fn parse_resume_token(token: &str) -> Result<ResumeToken, Error> {
    let json: serde_json::Value =
        serde_json::from_str(token).map_err(|e| Error::MalformedResumeToken(e.to_string()))?;
    let bson = Bson::try_from(json).map_err(|e| Error::MalformedResumeToken(e.to_string()))?;
    bson::from_bson(bson).map_err(|e| Error::MalformedResumeToken(e.to_string()))
}
