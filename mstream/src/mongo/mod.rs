pub mod client;
pub mod error;
pub mod watcher;
pub use client::{ChangeCursor, Feed, MongoFeed, WatchOptions};
pub use error::Error;
pub use watcher::Watcher;
