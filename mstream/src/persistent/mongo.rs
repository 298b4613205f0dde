use async_trait::async_trait;
use mongodb::{bson::doc, Client, Collection};
use serde::{Deserialize, Serialize};

use super::{Error, Storage};

/// Resume token slot kept in a MongoDB collection.
///
/// `MongoStorage` stores one document per stream, keyed by `stream_name`, so
/// several streamers can share a tokens collection without clobbering each
/// other.
pub struct MongoStorage {
    collection: Collection<ResumeTokenDbView>,
    stream_name: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct ResumeTokenDbView {
    stream_name: String,
    resume_token: String,
}

impl MongoStorage {
    /// Create a `MongoStorage` for `stream_name` in `db_name.coll_name`.
    ///
    /// # Arguments
    /// * `client` - MongoDB client instance.
    /// * `db_name` - Database holding the tokens collection.
    /// * `coll_name` - Tokens collection.
    /// * `stream_name` - Key identifying this streamer's token.
    pub fn new(client: &Client, db_name: &str, coll_name: &str, stream_name: &str) -> Self {
        let collection = client
            .database(db_name)
            .collection::<ResumeTokenDbView>(coll_name);
        Self {
            collection,
            stream_name: stream_name.to_string(),
        }
    }
}

#[async_trait]
impl Storage for MongoStorage {
    /// Store or update the token for this stream (upsert semantics).
    async fn write(&self, value: &str) -> Result<(), Error> {
        let filter = doc! {"stream_name": &self.stream_name};
        let update = doc! {"$set": {"resume_token": value}};

        self.collection
            .update_one(filter, update)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn read(&self) -> Result<String, Error> {
        let filter = doc! {"stream_name": &self.stream_name};
        let doc = self.collection.find_one(filter).await?;
        Ok(doc.map(|d| d.resume_token).unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.collection
            .delete_many(doc! {"stream_name": &self.stream_name})
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        // The client is shared with the feed and shut down by its owner.
        Ok(())
    }
}
