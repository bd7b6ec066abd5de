// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for loopfleet-core.
//!
//! Registry backends report every failure through [`CoreError`] so callers
//! never depend on a particular storage engine.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the instance and execution registries.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance already exists (duplicate insert).
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Execution already exists (duplicate insert).
    ExecutionAlreadyExists {
        /// The execution ID that already exists.
        execution_id: String,
    },

    /// A stored value could not be decoded into the domain model.
    InvalidRecord {
        /// Table or collection holding the record.
        entity: &'static str,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::ExecutionAlreadyExists { .. } => "EXECUTION_ALREADY_EXISTS",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceAlreadyExists { instance_id } => {
                write!(f, "Instance '{}' already exists", instance_id)
            }
            Self::ExecutionAlreadyExists { execution_id } => {
                write!(f, "Execution '{}' already exists", execution_id)
            }
            Self::InvalidRecord { entity, details } => {
                write!(f, "Invalid {} record: {}", entity, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
