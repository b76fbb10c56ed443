use thiserror::Error;

/// Error type for catalog, value-store and maintenance operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A relationship target (tag, group owner, record id) does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Malformed retention policy, timestamp key or sample payload.
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The record store itself failed.
    #[error("Backend Error: {0}")]
    Backend(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    /// A queue consumer gave up waiting for admission.
    #[error("Timed out waiting for admission to queue {queue} (token {token})")]
    QueueTimeout { queue: String, token: u64 },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for failures of the backend (I/O, encoding, locking, corruption) as opposed to
    /// domain errors raised by the core itself.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Serialization(_)
                | StoreError::Backend(_)
                | StoreError::LockError(_)
                | StoreError::Corruption { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::BackgroundTaskError(err.to_string())
    }
}
