use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("cursor has no value, full sync required")]
    FullSyncRequired,

    #[error("Unsupported source type: {0}")]
    UnsupportedSourceType(String),

    /// No credential, or the credential has expired. Refreshing may fix it.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The provider rejected the credential. Re-authorization is needed.
    #[error("Authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("Connector is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: i64 },

    /// The provider has no such resource (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider no longer accepts a stored resume token.
    #[error("Resume token expired: {0}")]
    CursorExpired(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),
}

impl ConnectorError {
    /// Errors that end a sync run instead of being absorbed per sub-resource.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectorError::AuthRequired(_)
                | ConnectorError::AuthInvalid(_)
                | ConnectorError::Closed
                | ConnectorError::Cancelled
                | ConnectorError::InvalidConfiguration(_)
                | ConnectorError::InvalidCursor(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectorError::Cancelled)
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        ConnectorError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::SerializationError(err.to_string())
    }
}
