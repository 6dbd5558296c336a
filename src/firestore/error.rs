use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Maps a gRPC status number to an error code. Unrecognised values map to
    /// `Unknown`.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }

    pub fn rpc_code(&self) -> i32 {
        match self {
            FirestoreErrorCode::Cancelled => 1,
            FirestoreErrorCode::Unknown => 2,
            FirestoreErrorCode::InvalidArgument => 3,
            FirestoreErrorCode::DeadlineExceeded => 4,
            FirestoreErrorCode::NotFound => 5,
            FirestoreErrorCode::AlreadyExists => 6,
            FirestoreErrorCode::PermissionDenied => 7,
            FirestoreErrorCode::ResourceExhausted => 8,
            FirestoreErrorCode::FailedPrecondition => 9,
            FirestoreErrorCode::Aborted => 10,
            FirestoreErrorCode::OutOfRange => 11,
            FirestoreErrorCode::Unimplemented => 12,
            FirestoreErrorCode::Internal => 13,
            FirestoreErrorCode::Unavailable => 14,
            FirestoreErrorCode::DataLoss => 15,
            FirestoreErrorCode::Unauthenticated => 16,
        }
    }
}

/// Marks errors that need special handling by the components that catch them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorOrigin {
    General,
    StorageTransaction,
    PrimaryLeaseLost,
}

#[derive(Clone, Debug)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
    origin: ErrorOrigin,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            origin: ErrorOrigin::General,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when a storage transaction failed for a reason that may succeed on
    /// retry (contention, a closed connection, quota pressure).
    pub fn is_storage_transaction_failure(&self) -> bool {
        self.origin == ErrorOrigin::StorageTransaction
    }

    /// True when a readwrite-primary transaction found the lease held elsewhere.
    pub fn is_primary_lease_lost(&self) -> bool {
        self.origin == ErrorOrigin::PrimaryLeaseLost
    }
}

impl PartialEq for FirestoreError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

/// Errors that the backend will keep returning no matter how often the
/// request is retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    !matches!(
        code,
        FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
    )
}

/// Same as [`is_permanent_error`] except that `Aborted` is retried on the
/// write stream (the backend aborts commits under contention).
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn unknown(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unknown, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn unimplemented(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unimplemented, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn storage_transaction_failed(message: impl Into<String>) -> FirestoreError {
    FirestoreError {
        code: FirestoreErrorCode::Unavailable,
        message: message.into(),
        origin: ErrorOrigin::StorageTransaction,
    }
}

pub fn primary_lease_lost(message: impl Into<String>) -> FirestoreError {
    FirestoreError {
        code: FirestoreErrorCode::FailedPrecondition,
        message: message.into(),
        origin: ErrorOrigin::PrimaryLeaseLost,
    }
}

/// Builds an error from a status payload carried by the watch or write stream.
pub fn map_rpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| "stream error".to_string());
    FirestoreError::new(FirestoreErrorCode::from_rpc_code(code), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_errors() {
        assert!(is_permanent_error(FirestoreErrorCode::PermissionDenied));
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
        assert!(!is_permanent_error(FirestoreErrorCode::ResourceExhausted));
        assert!(!is_permanent_error(FirestoreErrorCode::Unauthenticated));
    }

    #[test]
    fn aborted_is_retryable_for_writes() {
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::InvalidArgument));
    }

    #[test]
    fn maps_rpc_codes() {
        let err = map_rpc_status(7, Some("denied".into()));
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(err.code_str(), "firestore/permission-denied");
        assert_eq!(FirestoreErrorCode::from_rpc_code(99), FirestoreErrorCode::Unknown);
        for code in 1..=16 {
            assert_eq!(FirestoreErrorCode::from_rpc_code(code).rpc_code(), code);
        }
    }

    #[test]
    fn storage_failures_are_flagged() {
        let err = storage_transaction_failed("aborted by contention");
        assert!(err.is_storage_transaction_failure());
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        assert!(!unavailable("network").is_storage_transaction_failure());
        assert!(primary_lease_lost("lease").is_primary_lease_lost());
    }
}
