//! Error types for driver linking
//!
//! `RepositoryError` covers the persistence collaborator; `LinkError` is what
//! the reconciler, lifecycle and discovery entry points surface to callers.

use thiserror::Error;

/// Errors raised by a link repository implementation
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Serialization failure, deadlock or unique-constraint race. Safe to retry.
    #[error("Transient repository failure: {0}")]
    Transient(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        // 40001 serialization_failure, 40P01 deadlock_detected, 23505 unique_violation
        let transient = e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| matches!(code.as_ref(), "40001" | "40P01" | "23505"));
        if transient {
            Self::Transient(e.to_string())
        } else {
            Self::Database(e)
        }
    }
}

/// Stable error codes exposed at the service boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Forbidden,
    Conflict,
    IntegrityViolation,
    RepositoryError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::IntegrityViolation => "INTEGRITY_VIOLATION",
            Self::RepositoryError => "REPOSITORY_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors surfaced by the linking entry points
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Driver {driver_id} is already confirmed to another user")]
    Conflict { driver_id: String },

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl LinkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::IntegrityViolation(_) => ErrorCode::IntegrityViolation,
            Self::Repository(_) => ErrorCode::RepositoryError,
        }
    }

    /// True when the operation may succeed if retried from scratch.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_transient())
    }

    /// Whether the boundary should show "this driver identity requires manual review".
    pub fn requires_manual_review(&self) -> bool {
        matches!(self.code(), ErrorCode::Conflict | ErrorCode::Forbidden)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
