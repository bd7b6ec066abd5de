// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for loopfleet-environment.
//!
//! Every setting has a default except the launch template, so a deployment
//! only needs `LOOPFLEET_LAUNCH_TEMPLATE_ID` to start.

use std::str::FromStr;
use std::time::Duration;

/// Provisioning and instance lifecycle settings.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Provider launch template used for every instance.
    pub launch_template_id: String,
    /// Capacity ceiling over `launching`, `available` and `busy` instances.
    pub max_instances: i64,
    /// Maximum hourly price bid for spot capacity.
    pub spot_max_price: String,
    /// Value of the `Project` tag on launched instances.
    pub project_tag: String,
    /// Interval between readiness probes.
    pub ready_poll_interval: Duration,
    /// Probes before giving up with a provisioning timeout.
    pub ready_max_attempts: u32,
    /// How long a `terminating` tombstone stays in the registry.
    pub termination_grace: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            launch_template_id: String::new(),
            max_instances: 5,
            spot_max_price: "0.05".to_string(),
            project_tag: "loopfleet".to_string(),
            ready_poll_interval: Duration::from_secs(5),
            ready_max_attempts: 60,
            termination_grace: Duration::from_secs(60),
        }
    }
}

/// Warm pool settings.
#[derive(Debug, Clone)]
pub struct WarmPoolConfig {
    /// Target number of warm, available instances.
    pub pool_size: usize,
    /// Warm instances older than this are rotated out.
    pub max_age: Duration,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Execution monitoring settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between progress reads.
    pub poll_interval: Duration,
    /// Wall-clock budget for one execution.
    pub budget: Duration,
    /// Delay between dispatching a progress read and fetching its output.
    pub read_settle: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            budget: Duration::from_secs(3600),
            read_settle: Duration::from_secs(2),
        }
    }
}

/// Layout of the pre-installed runner on each instance.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Entry point invoked with the execution id, work spec, key and provider.
    pub runner_script: String,
    /// Directory holding one `<execution_id>/progress.txt` per execution.
    pub executions_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            runner_script: "/opt/loopfleet/loop-runner.sh".to_string(),
            executions_dir: "/opt/loopfleet/executions".to_string(),
        }
    }
}

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry database URL.
    pub database_url: String,
    /// Provisioning settings.
    pub provisioning: ProvisioningConfig,
    /// Warm pool settings.
    pub warm_pool: WarmPoolConfig,
    /// Monitoring settings.
    pub monitor: MonitorConfig,
    /// Remote runner layout.
    pub remote: RemoteConfig,
    /// How often the maintenance worker runs `maintain()`.
    pub maintenance_interval: Duration,
    /// How often expired tombstones are swept.
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:.data/loopfleet.db?mode=rwc".to_string(),
            provisioning: ProvisioningConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            monitor: MonitorConfig::default(),
            remote: RemoteConfig::default(),
            maintenance_interval: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let launch_template_id = lookup("LOOPFLEET_LAUNCH_TEMPLATE_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingEnvVar("LOOPFLEET_LAUNCH_TEMPLATE_ID"))?;

        let max_instances: i64 = parse_or(&lookup, "LOOPFLEET_MAX_INSTANCES", 5)?;
        if max_instances < 1 {
            return Err(ConfigError::InvalidValue {
                name: "LOOPFLEET_MAX_INSTANCES",
                value: max_instances.to_string(),
            });
        }

        let spot_max_price = lookup("LOOPFLEET_SPOT_MAX_PRICE")
            .unwrap_or_else(|| defaults.provisioning.spot_max_price.clone());
        if !spot_max_price.parse::<f64>().is_ok_and(|p| p > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "LOOPFLEET_SPOT_MAX_PRICE",
                value: spot_max_price,
            });
        }

        let provisioning = ProvisioningConfig {
            launch_template_id,
            max_instances,
            spot_max_price,
            project_tag: lookup("LOOPFLEET_PROJECT_TAG")
                .unwrap_or_else(|| defaults.provisioning.project_tag.clone()),
            ready_poll_interval: nonzero_secs_or(&lookup, "LOOPFLEET_READY_POLL_SECS", 5)?,
            ready_max_attempts: nonzero_or(&lookup, "LOOPFLEET_READY_MAX_ATTEMPTS", 60u32)?,
            termination_grace: secs_or(&lookup, "LOOPFLEET_TERMINATION_GRACE_SECS", 60)?,
        };

        let warm_pool = WarmPoolConfig {
            pool_size: parse_or(&lookup, "LOOPFLEET_WARM_POOL_SIZE", 3)?,
            max_age: Duration::from_secs(
                parse_or::<u64, _>(&lookup, "LOOPFLEET_WARM_MAX_AGE_HOURS", 24)? * 3600,
            ),
        };

        let monitor = MonitorConfig {
            poll_interval: nonzero_secs_or(&lookup, "LOOPFLEET_MONITOR_POLL_SECS", 5)?,
            budget: nonzero_secs_or(&lookup, "LOOPFLEET_MONITOR_BUDGET_SECS", 3600)?,
            read_settle: secs_or(&lookup, "LOOPFLEET_READ_SETTLE_SECS", 2)?,
        };

        let remote = RemoteConfig {
            runner_script: lookup("LOOPFLEET_RUNNER_SCRIPT")
                .unwrap_or(defaults.remote.runner_script),
            executions_dir: lookup("LOOPFLEET_EXECUTIONS_DIR")
                .unwrap_or(defaults.remote.executions_dir),
        };

        Ok(Self {
            database_url: lookup("LOOPFLEET_DATABASE_URL").unwrap_or(defaults.database_url),
            provisioning,
            warm_pool,
            monitor,
            remote,
            maintenance_interval: nonzero_secs_or(
                &lookup,
                "LOOPFLEET_MAINTENANCE_INTERVAL_SECS",
                900,
            )?,
            sweep_interval: nonzero_secs_or(&lookup, "LOOPFLEET_SWEEP_INTERVAL_SECS", 30)?,
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default).map(Duration::from_secs)
}

/// Like [`parse_or`] but rejects zero, for counts and intervals a loop
/// depends on.
fn nonzero_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + ToString,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn nonzero_secs_or<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    nonzero_or(lookup, name, default).map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be used.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}
