use thiserror::Error;

/// Errors surfaced by the content pipeline.
///
/// The enum is `Clone` so a single poll outcome can be handed to every
/// caller that joined the same in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentError {
    /// A required identity field was missing or blank after normalization.
    #[error("missing required identity field(s): {0}")]
    MissingIdentity(String),

    #[error("unsupported content kind: {0}")]
    UnsupportedKind(String),

    #[error("store error: {0}")]
    Store(String),

    /// The shared connection was closing or busy when a transaction started.
    #[error("store connection is closing: {0}")]
    StoreClosing(String),

    #[error("store deletion in progress")]
    StoreDeleting,

    /// The backend broke the completion protocol (e.g. no cron key).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("empty payload from {0}")]
    EmptyPayload(String),

    #[error("max attempts ({attempts}) reached without completion: {key}")]
    PollExhausted { key: String, attempts: u32 },

    /// A newer poll for the same resource took over.
    #[error("poll superseded: {0}")]
    Superseded(String),
}

impl ContentError {
    /// Whether the error is the transient "connection is closing" class.
    pub fn is_store_closing(&self) -> bool {
        matches!(self, ContentError::StoreClosing(_))
    }
}

impl From<rusqlite::Error> for ContentError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                ContentError::StoreClosing(err.to_string())
            }
            _ => ContentError::Store(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ContentError {
    fn from(err: serde_json::Error) -> Self {
        ContentError::Store(format!("invalid stored JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ContentError>;
