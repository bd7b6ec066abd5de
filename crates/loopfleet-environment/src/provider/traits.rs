// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider trait definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use loopfleet_core::MarketType;
use thiserror::Error;

/// Errors from the provisioning API.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// No capacity for the requested offering. Triggers the spot to on-demand
    /// fallback.
    #[error("Insufficient capacity: {0}")]
    CapacityUnavailable(String),

    /// The provider does not know the instance.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// Any other API failure.
    #[error("Provider API error: {0}")]
    Api(String),
}

/// Errors from the remote command channel.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The channel refused the command (instance unreachable, invalid target).
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The call failed in transit.
    #[error("Command transport error: {0}")]
    Transport(String),
}

/// What to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Provider launch template holding image, size and network settings.
    pub launch_template_id: String,
    /// Maximum hourly price when launching on the spot market.
    pub max_price: String,
    /// Tags applied to the instance.
    pub tags: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Look up a tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Provider-reported instance state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderState {
    /// Booting.
    Pending,
    /// Running. Not necessarily healthy yet.
    Running,
    /// Stop requested.
    Stopping,
    /// Stopped.
    Stopped,
    /// Termination in progress.
    ShuttingDown,
    /// Gone.
    Terminated,
    /// Anything the provider reports that is not listed above.
    Other(String),
}

impl ProviderState {
    /// Parse the provider's state name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the instance can still serve work (or soon will).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::ShuttingDown => f.write_str("shutting-down"),
            Self::Terminated => f.write_str("terminated"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Result of describing one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescription {
    /// Provider instance id.
    pub instance_id: String,
    /// Lifecycle state.
    pub state: ProviderState,
    /// Instance-level health check passed.
    pub instance_check_ok: bool,
    /// System-level health check passed.
    pub system_check_ok: bool,
    /// Public network address, once assigned.
    pub address: Option<String>,
}

impl InstanceDescription {
    /// Ready means running with both health checks passing at the same time.
    pub fn is_ready(&self) -> bool {
        self.state == ProviderState::Running && self.instance_check_ok && self.system_check_ok
    }
}

/// Provisioning API.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch one instance on the given market. Returns the provider id.
    ///
    /// Must return [`ProviderError::CapacityUnavailable`] when the offering
    /// has no capacity, distinct from other failures.
    async fn launch(&self, spec: &LaunchSpec, market: MarketType) -> Result<String, ProviderError>;

    /// Describe an instance. `Ok(None)` means the provider no longer knows it.
    async fn describe(&self, instance_id: &str)
    -> Result<Option<InstanceDescription>, ProviderError>;

    /// Request termination.
    async fn terminate(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Options for one remote command.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Whether the channel may persist command output in its audit logs.
    /// Credential-bearing commands set this to false.
    pub log_output: bool,
    /// How long the remote side lets the command run.
    pub timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            log_output: true,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Remote shell command channel.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send a script to an instance. Returns a command id.
    async fn dispatch(
        &self,
        instance_id: &str,
        script: &str,
        options: &DispatchOptions,
    ) -> Result<String, CommandError>;

    /// Fetch standard output of a previously dispatched command.
    async fn fetch_result(&self, command_id: &str, instance_id: &str)
    -> Result<String, CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_all_checks() {
        let mut desc = InstanceDescription {
            instance_id: "i-1".to_string(),
            state: ProviderState::Running,
            instance_check_ok: true,
            system_check_ok: false,
            address: None,
        };
        assert!(!desc.is_ready());

        desc.system_check_ok = true;
        assert!(desc.is_ready());

        desc.state = ProviderState::Pending;
        assert!(!desc.is_ready());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(
            ProviderState::from_name("shutting-down"),
            ProviderState::ShuttingDown
        );
        assert_eq!(ProviderState::ShuttingDown.to_string(), "shutting-down");
        assert!(ProviderState::from_name("pending").is_live());
        assert!(!ProviderState::from_name("stopped").is_live());
        assert!(!ProviderState::from_name("rebooting").is_live());
    }
}
