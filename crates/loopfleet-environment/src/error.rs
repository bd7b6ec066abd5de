// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for loopfleet-environment.

use thiserror::Error;

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Capacity ceiling reached and no instance could be handed out.
    ///
    /// Retryable: the caller should back off and try again later.
    #[error("Instance pool exhausted: {active} of {max} instances in use")]
    PoolExhausted {
        /// Instances counted against the ceiling.
        active: i64,
        /// Configured ceiling.
        max: i64,
    },

    /// The readiness probe never passed for a freshly provisioned instance.
    #[error("Instance {instance_id} did not become ready after {attempts} attempts")]
    ProvisioningTimeout {
        /// The instance that never became ready. Its record is left in place.
        instance_id: String,
        /// Number of probes made.
        attempts: u32,
    },

    /// An instance left `launching` (terminated or reconciled away) while its
    /// readiness wait was in progress.
    #[error("Instance {0} is no longer launching")]
    InstanceUnavailable(String),

    /// The remote command channel rejected a dispatch.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// An execution ran past its wall-clock budget.
    #[error("Execution timed out after {0}")]
    MonitoringTimeout(String),

    /// Provisioning API failure.
    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    /// Secret store failure.
    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    /// Registry operation failed.
    #[error("Core error: {0}")]
    Core(#[from] loopfleet_core::CoreError),

    /// Execution was not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Execution is not in a state that allows the requested operation.
    #[error("Execution {execution_id} is {status}, expected {expected}")]
    InvalidExecutionState {
        /// The execution.
        execution_id: String,
        /// Its current status.
        status: loopfleet_core::ExecutionStatus,
        /// The status the operation requires.
        expected: loopfleet_core::ExecutionStatus,
    },

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_message() {
        let err = Error::PoolExhausted { active: 5, max: 5 };
        assert_eq!(
            err.to_string(),
            "Instance pool exhausted: 5 of 5 instances in use"
        );
    }

    #[test]
    fn test_provider_error_converts() {
        let err: Error =
            crate::provider::ProviderError::CapacityUnavailable("us-east-1a".to_string()).into();
        assert!(matches!(err, Error::Provider(_)));
        assert!(err.to_string().contains("us-east-1a"));
    }
}
