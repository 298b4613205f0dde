use mongodb::error::ErrorKind;
use thiserror::Error;

/// Server codes meaning the requested resume point is gone.
const INVALID_RESUME_TOKEN: i32 = 260;
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to connect to MongoDB: {0}")]
    Connect(#[source] mongodb::error::Error),
    #[error("Cannot resume change stream from the stored token: {0}")]
    MissingResumeToken(String),
    #[error("Stored resume token is malformed: {0}")]
    MalformedResumeToken(String),
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

impl Error {
    /// Sort a driver error raised while opening a change stream.
    pub fn from_watch(err: mongodb::error::Error) -> Self {
        match err.kind.as_ref() {
            ErrorKind::MissingResumeToken => Self::MissingResumeToken(err.to_string()),
            ErrorKind::Command(cmd)
                if cmd.code == INVALID_RESUME_TOKEN || cmd.code == CHANGE_STREAM_HISTORY_LOST =>
            {
                Self::MissingResumeToken(err.to_string())
            }
            _ => Self::Mongo(err),
        }
    }

    /// Whether the stream can only be reopened after dropping the stored token.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::MissingResumeToken(_) | Self::MalformedResumeToken(_)
        )
    }
}
