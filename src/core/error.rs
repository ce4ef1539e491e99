use thiserror::Error;

/// Failure reported by a [`CounterStore`](crate::store::CounterStore).
///
/// Backends map their native failures onto these variants so retry
/// classification never has to look at codes or message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Rate limited (429): {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Entity '{0}' not found")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors that know whether repeating the failed operation can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted(_)
            | Self::RateLimited(_)
            | Self::Unavailable(_)
            | Self::DeadlineExceeded(_)
            | Self::Internal(_)
            | Self::Network(_) => true,
            Self::NotFound(_) | Self::PermissionDenied(_) | Self::InvalidArgument(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl Retryable for TallyError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

impl<T> From<std::sync::PoisonError<T>> for TallyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
