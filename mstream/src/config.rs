use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_CHECKPOINT_CAPACITY: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchedDb {
    pub db_name: String,
    pub coll_name: String,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Which backend holds the last acknowledged resume token.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Log,
    Mongo,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub storage: StorageKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub tokens_db_name: Option<String>,
    #[serde(default)]
    pub tokens_coll_name: Option<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Checkpoint {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RabbitMq {
    pub stream_name: String,
    #[serde(default = "default_publish_format")]
    pub publish_format: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Http {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Connections {
    pub mongo_uri: String,
    #[serde(default)]
    pub mongo_user: Option<String>,
    #[serde(default)]
    pub mongo_password: Option<String>,
    pub rabbitmq_uri: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(skip)]
    connections: Connections,
    watched: WatchedDb,
    checkpoint: Checkpoint,
    rabbitmq: RabbitMq,
    #[serde(default)]
    http: Http,
}

impl Settings {
    /// Combine connection secrets with the file based settings and validate the result.
    pub fn new(connections: Connections, settings: Settings) -> Result<Self, String> {
        let settings = Self {
            connections,
            ..settings
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), String> {
        if self.watched.db_name.is_empty() || self.watched.coll_name.is_empty() {
            return Err("watched database and collection names must not be empty".into());
        }
        if self.rabbitmq.stream_name.is_empty() {
            return Err("rabbitmq stream name must not be empty".into());
        }
        match self.checkpoint.storage {
            StorageKind::File if self.checkpoint.path.is_none() => {
                Err("file checkpoint storage requires `path`".into())
            }
            StorageKind::Mongo
                if self.checkpoint.tokens_db_name.is_none()
                    || self.checkpoint.tokens_coll_name.is_none() =>
            {
                Err("mongo checkpoint storage requires `tokens_db_name` and `tokens_coll_name`".into())
            }
            _ => Ok(()),
        }
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn watched(&self) -> &WatchedDb {
        &self.watched
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn rabbitmq(&self) -> &RabbitMq {
        &self.rabbitmq
    }

    pub fn http(&self) -> &Http {
        &self.http
    }
}

fn default_capacity() -> usize {
    DEFAULT_CHECKPOINT_CAPACITY
}

fn default_flush_interval_secs() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

fn default_publish_format() -> String {
    "json".to_string()
}

fn default_http_addr() -> String {
    DEFAULT_HTTP_ADDR.to_string()
}
