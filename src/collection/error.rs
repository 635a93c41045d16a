use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectionErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Internal,
    Cancelled,
}

impl CollectionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionErrorCode::InvalidArgument => "collection/invalid-argument",
            CollectionErrorCode::NotFound => "collection/not-found",
            CollectionErrorCode::PermissionDenied => "collection/permission-denied",
            CollectionErrorCode::Unavailable => "collection/unavailable",
            CollectionErrorCode::DeadlineExceeded => "collection/deadline-exceeded",
            CollectionErrorCode::Internal => "collection/internal",
            CollectionErrorCode::Cancelled => "collection/cancelled",
        }
    }
}

/// Error raised by the live collection layer.
///
/// The same type travels on two channels: errors delivered to observers while
/// an upstream subscription is unhealthy ([`SourceError`]) and errors returned
/// from `add`/`update`/`remove` ([`WriteError`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionError {
    pub code: CollectionErrorCode,
    message: String,
}

/// Transport or availability failure on an upstream subscription.
pub type SourceError = CollectionError;

/// Failure of one specific mutation round-trip.
pub type WriteError = CollectionError;

impl CollectionError {
    pub fn new(code: CollectionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.code == CollectionErrorCode::NotFound
    }

    /// Returns whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            CollectionErrorCode::Unavailable
                | CollectionErrorCode::DeadlineExceeded
                | CollectionErrorCode::Internal
        )
    }
}

impl Display for CollectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for CollectionError {}

pub type CollectionResult<T> = Result<T, CollectionError>;

pub fn invalid_argument(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::InvalidArgument, message)
}

pub fn not_found(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::PermissionDenied, message)
}

pub fn unavailable(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::DeadlineExceeded, message)
}

pub fn cancelled(message: impl Into<String>) -> CollectionError {
    CollectionError::new(CollectionErrorCode::Cancelled, message)
}
