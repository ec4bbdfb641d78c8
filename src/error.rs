use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Table,
    Column,
    Part,
    Mutation,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Database => write!(f, "database"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::Part => write!(f, "part"),
            ResourceType::Mutation => write!(f, "mutation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    IntegrityError,
    NotFound,
    PermissionDenied,
    ReadOnly,
    Prohibited,
    UnsupportedOperation,
    UnsupportedWithProjections,
    TypeMismatch,
    UnknownColumn,
    Conflict,
    LockTimeout,
    OutOfSpace,
    Timeout,
    Logical,
    Cancelled,
}

impl MutationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationErrorCode::Io => "io",
            MutationErrorCode::Encode => "encode",
            MutationErrorCode::Decode => "decode",
            MutationErrorCode::Validation => "validation",
            MutationErrorCode::InvalidConfig => "invalid_config",
            MutationErrorCode::IntegrityError => "integrity_error",
            MutationErrorCode::NotFound => "not_found",
            MutationErrorCode::PermissionDenied => "permission_denied",
            MutationErrorCode::ReadOnly => "read_only",
            MutationErrorCode::Prohibited => "prohibited",
            MutationErrorCode::UnsupportedOperation => "unsupported_operation",
            MutationErrorCode::UnsupportedWithProjections => "unsupported_with_projections",
            MutationErrorCode::TypeMismatch => "type_mismatch",
            MutationErrorCode::UnknownColumn => "unknown_column",
            MutationErrorCode::Conflict => "conflict",
            MutationErrorCode::LockTimeout => "lock_timeout",
            MutationErrorCode::OutOfSpace => "out_of_space",
            MutationErrorCode::Timeout => "timeout",
            MutationErrorCode::Logical => "logical",
            MutationErrorCode::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("table '{table}' is read-only")]
    ReadOnly { table: String },
    #[error("query is prohibited: {0}")]
    Prohibited(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error(
        "DELETE is not allowed for table '{table}' because it has projections and \
         lightweight_mutation_projection_mode is set to throw"
    )]
    UnsupportedWithProjections { table: String },
    #[error(
        "type mismatch: column '{column}' in table '{table}' expected {expected}, got {actual}"
    )]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("lock timeout: failed to acquire {mode} lock on '{table}' for query '{query_id}'")]
    LockTimeout {
        table: String,
        query_id: String,
        mode: &'static str,
    },
    #[error("out of space on disk '{disk}': requested {requested} bytes, {available} available")]
    OutOfSpace {
        disk: String,
        requested: u64,
        available: u64,
    },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("logical error: {0}")]
    Logical(String),
    #[error("mutation cancelled: {0}")]
    Cancelled(String),
}

impl MutationError {
    pub fn code(&self) -> MutationErrorCode {
        match self {
            MutationError::Io(_) => MutationErrorCode::Io,
            MutationError::Encode(_) => MutationErrorCode::Encode,
            MutationError::Decode(_) => MutationErrorCode::Decode,
            MutationError::Validation(_) => MutationErrorCode::Validation,
            MutationError::InvalidConfig { .. } => MutationErrorCode::InvalidConfig,
            MutationError::IntegrityError { .. } => MutationErrorCode::IntegrityError,
            MutationError::NotFound { .. } => MutationErrorCode::NotFound,
            MutationError::PermissionDenied(_) => MutationErrorCode::PermissionDenied,
            MutationError::ReadOnly { .. } => MutationErrorCode::ReadOnly,
            MutationError::Prohibited(_) => MutationErrorCode::Prohibited,
            MutationError::UnsupportedOperation(_) => MutationErrorCode::UnsupportedOperation,
            MutationError::UnsupportedWithProjections { .. } => {
                MutationErrorCode::UnsupportedWithProjections
            }
            MutationError::TypeMismatch { .. } => MutationErrorCode::TypeMismatch,
            MutationError::UnknownColumn { .. } => MutationErrorCode::UnknownColumn,
            MutationError::Conflict(_) => MutationErrorCode::Conflict,
            MutationError::LockTimeout { .. } => MutationErrorCode::LockTimeout,
            MutationError::OutOfSpace { .. } => MutationErrorCode::OutOfSpace,
            MutationError::Timeout(_) => MutationErrorCode::Timeout,
            MutationError::Logical(_) => MutationErrorCode::Logical,
            MutationError::Cancelled(_) => MutationErrorCode::Cancelled,
        }
    }

    /// `Cancelled` means "did not complete", not a failure to report to the end user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MutationError::Cancelled(_))
    }

    /// Errors detected before any task exists: nothing was acquired or written.
    pub fn is_validation_class(&self) -> bool {
        matches!(
            self.code(),
            MutationErrorCode::Validation
                | MutationErrorCode::TypeMismatch
                | MutationErrorCode::UnknownColumn
                | MutationErrorCode::NotFound
                | MutationErrorCode::PermissionDenied
                | MutationErrorCode::ReadOnly
                | MutationErrorCode::Prohibited
                | MutationErrorCode::UnsupportedOperation
                | MutationErrorCode::UnsupportedWithProjections
        )
    }

    pub fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        MutationError::NotFound {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        MutationError::Encode(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        MutationError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{MutationError, MutationErrorCode, ResourceType};

    #[test]
    fn codes_are_stable_snake_case() {
        let err = MutationError::UnsupportedWithProjections {
            table: "db.t".into(),
        };
        assert_eq!(err.code(), MutationErrorCode::UnsupportedWithProjections);
        assert_eq!(err.code().as_str(), "unsupported_with_projections");
        assert_eq!(
            MutationError::Cancelled("x".into()).code().as_str(),
            "cancelled"
        );
    }

    #[test]
    fn cancelled_is_not_validation_class() {
        let cancelled = MutationError::Cancelled("table dropped".into());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_validation_class());

        let missing = MutationError::not_found(ResourceType::Table, "db.t");
        assert!(missing.is_validation_class());
        assert_eq!(format!("{missing}"), "table 'db.t' not found");
    }
}
