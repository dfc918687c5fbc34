//! Error types for the convergence engine.
//!
//! Every concern (configuration, state, remote gateway, schema, polling,
//! lifecycle) has its own error enum. They all fold into [`ConvergeError`],
//! whose [`ConvergeError::class`] maps any error onto the engine's
//! taxonomy: not-found, conflict, unexpected state, timeout, schema
//! violation, cancellation and generic remote failure.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::lifecycle::LifecycleFailure;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Remote gateway errors.
    #[error("Remote API error: {0}")]
    Gateway(#[from] GatewayError),

    /// Attribute schema violations.
    #[error("Schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    /// State polling errors.
    #[error("Polling error: {0}")]
    Poll(#[from] PollError),

    /// Lifecycle sequencing errors.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The operation was cancelled before it finished.
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Why the operation stopped.
        reason: CancelReason,
    },

    /// A lifecycle operation failed; carries the phase and last known instance.
    #[error(transparent)]
    Operation(#[from] Box<LifecycleFailure>),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of an error in terms of how the engine treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The remote object does not exist.
    NotFound,
    /// The remote object is busy or referenced by another object.
    Conflict,
    /// The remote object reached a status nobody expected.
    UnexpectedState,
    /// A poll exceeded its time budget.
    Timeout,
    /// The caller supplied attributes that do not fit the schema.
    SchemaViolation,
    /// The caller cancelled the operation.
    Cancelled,
    /// The operation is not allowed for the instance as it stands.
    InvalidOperation,
    /// Any other failure.
    RemoteFailure,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// Resource type has no registered kind.
    #[error("Unknown resource type: {resource_type}")]
    UnknownResourceType {
        /// The unknown type name.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Filesystem error while reading or writing state.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors reported by a remote resource gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The object does not exist (404-equivalent).
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
    },

    /// The object is referenced or busy (409-equivalent).
    #[error("{resource_type} '{id}' is in use: {message}")]
    Conflict {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
        /// Message from the remote API.
        message: String,
    },

    /// Authentication failed.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Rate limited.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// A request could not be encoded from the given attributes.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the encoding issue.
        message: String,
    },

    /// Invalid response from the API.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The gateway does not implement the operation.
    #[error("{resource_type} does not support {operation}")]
    Unsupported {
        /// Resource type name.
        resource_type: String,
        /// Operation name.
        operation: String,
    },

    /// Any other remote failure.
    #[error("Request failed: {status} - {message}")]
    RemoteFailure {
        /// HTTP-equivalent status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },
}

/// Attribute values that do not fit the declared schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaViolation {
    /// Attribute is not declared in the schema.
    #[error("attribute '{attribute}' is not declared for {resource_type}")]
    Undeclared {
        /// Resource type name.
        resource_type: String,
        /// Offending attribute.
        attribute: String,
    },

    /// Attribute value has the wrong type.
    #[error("attribute '{attribute}' expects {expected}, got {found}")]
    TypeMismatch {
        /// Offending attribute.
        attribute: String,
        /// Declared type.
        expected: String,
        /// Type of the supplied value.
        found: String,
    },

    /// A required attribute is missing.
    #[error("required attribute '{attribute}' is missing")]
    MissingRequired {
        /// Missing attribute.
        attribute: String,
    },

    /// The caller supplied a value for an attribute only the remote system sets.
    #[error("attribute '{attribute}' is computed by the remote system and cannot be set")]
    ComputedSupplied {
        /// Offending attribute.
        attribute: String,
    },

    /// A value is well typed but its content is malformed.
    #[error("attribute '{attribute}' has invalid value '{value}': {message}")]
    InvalidValue {
        /// Offending attribute.
        attribute: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Errors from waiting on a remote status.
#[derive(Debug, Error)]
pub enum PollError {
    /// The poll exceeded its time budget.
    #[error("Timeout after {elapsed:?} waiting for status {target} (last seen: {last_status})")]
    Timeout {
        /// Target status.
        target: String,
        /// Last status observed.
        last_status: String,
        /// Time spent polling.
        elapsed: Duration,
    },

    /// The object reached a status that is neither pending nor the target.
    #[error("Unexpected status {status} while waiting for {target}")]
    UnexpectedState {
        /// Status observed.
        status: String,
        /// Target status.
        target: String,
    },

    /// The status query itself failed.
    #[error("Status query failed: {0}")]
    Query(#[from] GatewayError),

    /// The wait was cancelled.
    #[error("Wait cancelled: {0}")]
    Cancelled(CancelReason),
}

/// Errors sequencing lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The operation is not valid from the instance's current state.
    #[error("Cannot {operation} a resource in state {state}")]
    InvalidTransition {
        /// Requested operation.
        operation: String,
        /// Current lifecycle state.
        state: String,
    },

    /// The operation needs a remote identifier and the instance has none.
    #[error("Cannot {operation}: resource has no remote ID")]
    MissingId {
        /// Requested operation.
        operation: String,
    },

    /// Delete kept hitting conflicts until the retry budget ran out.
    #[error("Delete of '{id}' still conflicting after {attempts} attempts: {message}")]
    ConflictRetriesExhausted {
        /// Remote identifier.
        id: String,
        /// Number of delete attempts made.
        attempts: u32,
        /// Last conflict message.
        message: String,
    },

    /// No kind or gateway is registered for a resource type.
    #[error("No gateway registered for resource type {resource_type}")]
    UnregisteredType {
        /// Resource type name.
        resource_type: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Maps the error onto the engine's error taxonomy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Operation(failure) => failure.source.class(),
            Self::Gateway(err) | Self::Poll(PollError::Query(err)) => err.class(),
            Self::Schema(_) => ErrorClass::SchemaViolation,
            Self::Poll(PollError::Timeout { .. }) => ErrorClass::Timeout,
            Self::Poll(PollError::UnexpectedState { .. }) => ErrorClass::UnexpectedState,
            Self::Poll(PollError::Cancelled(_)) | Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::Lifecycle(LifecycleError::ConflictRetriesExhausted { .. }) => {
                ErrorClass::Conflict
            }
            Self::Lifecycle(
                LifecycleError::InvalidTransition { .. }
                | LifecycleError::MissingId { .. }
                | LifecycleError::UnregisteredType { .. },
            ) => ErrorClass::InvalidOperation,
            _ => ErrorClass::RemoteFailure,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Operation(failure) => failure.source.is_retryable(),
            Self::Gateway(err) | Self::Poll(PollError::Query(err)) => err.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Gateway(GatewayError::RateLimited { retry_after_secs }) => Some(*retry_after_secs),
            Self::Gateway(GatewayError::NetworkError { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl From<CancelReason> for ConvergeError {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl GatewayError {
    /// Creates a generic remote failure.
    #[must_use]
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteFailure {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource_type: resource_type.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(resource_type: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            resource_type: resource_type.into(),
            operation: operation.into(),
        }
    }

    /// Returns true for the remote 404-equivalent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for the remote 409-equivalent.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if repeating the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::NetworkError { .. } => true,
            Self::RemoteFailure { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Maps the gateway error onto the engine's error taxonomy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::InvalidRequest { .. } => ErrorClass::SchemaViolation,
            _ => ErrorClass::RemoteFailure,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::UnexpectedState => "unexpected state",
            Self::Timeout => "timeout",
            Self::SchemaViolation => "schema violation",
            Self::Cancelled => "cancelled",
            Self::InvalidOperation => "invalid operation",
            Self::RemoteFailure => "remote failure",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_classes() {
        assert_eq!(
            ConvergeError::from(GatewayError::not_found("network", "n1")).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            ConvergeError::from(GatewayError::conflict("firewall_policy", "p1", "in use")).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            ConvergeError::from(GatewayError::remote(500, "boom")).class(),
            ErrorClass::RemoteFailure
        );
    }

    #[test]
    fn test_poll_classes() {
        let timeout = ConvergeError::from(PollError::Timeout {
            target: String::from("ACTIVE"),
            last_status: String::from("BUILD"),
            elapsed: Duration::from_secs(600),
        });
        assert_eq!(timeout.class(), ErrorClass::Timeout);

        let unexpected = ConvergeError::from(PollError::UnexpectedState {
            status: String::from("ERROR"),
            target: String::from("ACTIVE"),
        });
        assert_eq!(unexpected.class(), ErrorClass::UnexpectedState);

        let query = ConvergeError::from(PollError::Query(GatewayError::not_found("compute", "x")));
        assert_eq!(query.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_exhausted_conflicts_classify_as_conflict() {
        let err = ConvergeError::from(LifecycleError::ConflictRetriesExhausted {
            id: String::from("p1"),
            attempts: 15,
            message: String::from("policy in use"),
        });
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_sequencing_errors_are_invalid_operations() {
        let transition = ConvergeError::from(LifecycleError::InvalidTransition {
            operation: String::from("update"),
            state: String::from("Deleted"),
        });
        assert_eq!(transition.class(), ErrorClass::InvalidOperation);
        assert!(!transition.is_retryable());

        let missing = ConvergeError::from(LifecycleError::MissingId {
            operation: String::from("delete"),
        });
        assert_eq!(missing.class(), ErrorClass::InvalidOperation);
        assert_eq!(missing.class().to_string(), "invalid operation");
    }

    #[test]
    fn test_retryable() {
        assert!(GatewayError::network("reset").is_retryable());
        assert!(GatewayError::remote(503, "unavailable").is_retryable());
        assert!(!GatewayError::remote(400, "bad").is_retryable());
        assert!(!GatewayError::conflict("router", "r", "busy").is_retryable());

        let limited = ConvergeError::from(GatewayError::RateLimited { retry_after_secs: 30 });
        assert_eq!(limited.retry_delay_secs(), Some(30));
    }
}
