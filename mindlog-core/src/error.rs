//! # 错误类型
//!
//! One error enum for the whole engine. Wrapped library errors convert with
//! `?`; the string variants say which layer gave up.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// SQLite failure in the queue or record database
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Task payloads and backend rows
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection, TLS or timeout before a status code arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Attachment could not be decoded or re-encoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Queue or record store in an unexpected state
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record API or object storage answered with an error status
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No session, so nothing can be sent for the user
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// The host refused to arrange a background wake-up
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Abandoned because the engine is stopping
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

macro_rules! message_constructors {
    ($($name:ident => $variant:ident),+ $(,)?) => {
        impl SyncError {
            $(
                pub fn $name(msg: impl Into<String>) -> Self {
                    Self::$variant(msg.into())
                }
            )+
        }
    };
}

message_constructors! {
    storage => Storage,
    remote => Remote,
    media => Media,
    configuration => Configuration,
    invalid_input => InvalidInput,
    not_found => NotFound,
    unauthenticated => Unauthenticated,
    scheduler => Scheduler,
    cancelled => Cancelled,
    other => Other,
}

impl SyncError {
    /// Raised by the local persistence layer rather than a collaborator
    pub fn is_local_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Storage(_))
    }
}
