// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider and command channel for testing.
//!
//! Both mocks record every call in order so tests can assert on sequencing
//! (for example that a rotation launched a replacement before terminating).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use loopfleet_core::MarketType;
use tokio::sync::Mutex;

use super::traits::*;

/// One call observed by [`MockProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A launch was refused for lack of capacity.
    CapacityRejected {
        /// Market that was refused.
        market: MarketType,
    },
    /// An instance was launched.
    Launch {
        /// New instance id.
        instance_id: String,
        /// Market it launched on.
        market: MarketType,
        /// Whether it carried the warm pool tag.
        warm: bool,
    },
    /// Termination was requested.
    Terminate {
        /// Terminated instance.
        instance_id: String,
    },
}

#[derive(Debug, Clone)]
struct MockInstance {
    state: ProviderState,
    describes_until_ready: u32,
    address: String,
}

#[derive(Debug, Default)]
struct ProviderLedger {
    instances: HashMap<String, MockInstance>,
    events: Vec<ProviderEvent>,
}

/// Mock provisioning API.
pub struct MockProvider {
    state: Arc<Mutex<ProviderLedger>>,
    next_id: AtomicU64,
    spot_shortages: AtomicU32,
    launch_failures: AtomicU32,
    fail_terminate: AtomicBool,
    /// Describe calls each new instance needs before it reports ready.
    pub ready_after: u32,
    /// If true, instances never pass their health checks.
    pub never_ready: bool,
    /// If true, every launch fails with an API error.
    pub fail_launch: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a mock whose instances are ready on the first describe.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderLedger::default())),
            next_id: AtomicU64::new(1),
            spot_shortages: AtomicU32::new(0),
            launch_failures: AtomicU32::new(0),
            fail_terminate: AtomicBool::new(false),
            ready_after: 0,
            never_ready: false,
            fail_launch: false,
        }
    }

    /// Create a mock that refuses the next `count` spot launches for lack of
    /// capacity.
    pub fn with_spot_shortage(count: u32) -> Self {
        let provider = Self::new();
        provider.spot_shortages.store(count, Ordering::SeqCst);
        provider
    }

    /// Create a mock whose next `count` launches fail with an API error.
    pub fn with_launch_failures(count: u32) -> Self {
        let provider = Self::new();
        provider.launch_failures.store(count, Ordering::SeqCst);
        provider
    }

    /// Create a mock whose instances never become ready.
    pub fn never_ready() -> Self {
        Self {
            never_ready: true,
            ..Self::new()
        }
    }

    /// Create a mock where every launch fails.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new()
        }
    }

    /// All observed calls, oldest first.
    pub async fn events(&self) -> Vec<ProviderEvent> {
        self.state.lock().await.events.clone()
    }

    /// Ids of launched instances, in launch order.
    pub async fn launched(&self) -> Vec<String> {
        self.events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                ProviderEvent::Launch { instance_id, .. } => Some(instance_id),
                _ => None,
            })
            .collect()
    }

    /// Ids of terminated instances, in request order.
    pub async fn terminated(&self) -> Vec<String> {
        self.events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                ProviderEvent::Terminate { instance_id } => Some(instance_id),
                _ => None,
            })
            .collect()
    }

    /// Toggle termination failures. A refused termination leaves the
    /// instance running and is not recorded as an event.
    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    /// Force the reported state of an instance.
    pub async fn set_state(&self, instance_id: &str, state: ProviderState) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Make the provider forget an instance entirely.
    pub async fn forget(&self, instance_id: &str) {
        self.state.lock().await.instances.remove(instance_id);
    }

    /// Register an instance that exists at the provider but was launched
    /// outside this mock (for restart scenarios).
    pub async fn adopt(&self, instance_id: &str, state: ProviderState) {
        self.state.lock().await.instances.insert(
            instance_id.to_string(),
            MockInstance {
                state,
                describes_until_ready: 0,
                address: "198.51.100.1".to_string(),
            },
        );
    }
}

#[async_trait]
impl Provisioner for MockProvider {
    async fn launch(&self, spec: &LaunchSpec, market: MarketType) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;

        if self.fail_launch {
            return Err(ProviderError::Api("mock launch failure".to_string()));
        }
        if self
            .launch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Api("mock launch failure".to_string()));
        }

        if market == MarketType::Spot && self.spot_shortages.load(Ordering::SeqCst) > 0 {
            self.spot_shortages.fetch_sub(1, Ordering::SeqCst);
            state.events.push(ProviderEvent::CapacityRejected { market });
            return Err(ProviderError::CapacityUnavailable(
                "InsufficientInstanceCapacity".to_string(),
            ));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("i-mock{:08x}", n);
        state.instances.insert(
            instance_id.clone(),
            MockInstance {
                state: ProviderState::Pending,
                describes_until_ready: self.ready_after,
                address: format!("203.0.113.{}", n % 250),
            },
        );
        state.events.push(ProviderEvent::Launch {
            instance_id: instance_id.clone(),
            market,
            warm: spec.tag("WarmPool") == Some("true"),
        });

        Ok(instance_id)
    }

    async fn describe(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, ProviderError> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Ok(None);
        };

        if instance.state == ProviderState::Pending && !self.never_ready {
            if instance.describes_until_ready == 0 {
                instance.state = ProviderState::Running;
            } else {
                instance.describes_until_ready -= 1;
            }
        }

        let healthy = instance.state == ProviderState::Running && !self.never_ready;
        Ok(Some(InstanceDescription {
            instance_id: instance_id.to_string(),
            state: instance.state.clone(),
            instance_check_ok: healthy,
            system_check_ok: healthy,
            address: (instance.state == ProviderState::Running)
                .then(|| instance.address.clone()),
        }))
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProviderError> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ProviderError::Api("mock terminate failure".to_string()));
        }
        let mut state = self.state.lock().await;
        state.events.push(ProviderEvent::Terminate {
            instance_id: instance_id.to_string(),
        });
        match state.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.state = ProviderState::ShuttingDown;
                Ok(())
            }
            None => Err(ProviderError::NotFound(instance_id.to_string())),
        }
    }
}

/// One dispatch observed by [`MockCommandChannel`].
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    /// Assigned command id.
    pub command_id: String,
    /// Target instance.
    pub instance_id: String,
    /// Script body as sent.
    pub script: String,
    /// Options the caller passed.
    pub options: DispatchOptions,
}

type Scripted = Result<String, CommandError>;

#[derive(Debug, Default)]
struct ChannelState {
    dispatches: Vec<DispatchRecord>,
    outputs: VecDeque<Scripted>,
    per_instance: HashMap<String, VecDeque<Scripted>>,
}

fn next_scripted(queue: &mut VecDeque<Scripted>) -> Option<Scripted> {
    // The last entry repeats so a script can end in a steady state.
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Mock remote command channel.
///
/// `fetch_result` returns scripted outputs in order, repeating the last one
/// once the script is exhausted. With nothing scripted it returns empty output.
#[derive(Default)]
pub struct MockCommandChannel {
    state: Arc<Mutex<ChannelState>>,
    next_id: AtomicU64,
    fail_dispatch: AtomicBool,
    stall_fetch: AtomicBool,
}

impl MockCommandChannel {
    /// Create a channel with no scripted output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel that rejects every dispatch.
    pub fn failing() -> Self {
        let channel = Self::new();
        channel.fail_dispatch.store(true, Ordering::SeqCst);
        channel
    }

    /// Toggle dispatch rejection.
    pub fn set_fail_dispatch(&self, fail: bool) {
        self.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    /// Create a channel whose result fetches never return.
    pub fn stalled() -> Self {
        let channel = Self::new();
        channel.stall_fetch.store(true, Ordering::SeqCst);
        channel
    }

    /// Append an output returned by any instance without its own script.
    pub async fn push_output(&self, output: impl Into<String>) {
        self.state.lock().await.outputs.push_back(Ok(output.into()));
    }

    /// Append a failed fetch returned by any instance without its own script.
    pub async fn push_error(&self, error: CommandError) {
        self.state.lock().await.outputs.push_back(Err(error));
    }

    /// Append an output for one instance only.
    pub async fn push_instance_output(&self, instance_id: &str, output: impl Into<String>) {
        self.state
            .lock()
            .await
            .per_instance
            .entry(instance_id.to_string())
            .or_default()
            .push_back(Ok(output.into()));
    }

    /// All dispatches, oldest first.
    pub async fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().await.dispatches.clone()
    }

    /// Dispatches made with output logging disabled.
    pub async fn unlogged_dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches()
            .await
            .into_iter()
            .filter(|d| !d.options.log_output)
            .collect()
    }
}

#[async_trait]
impl CommandChannel for MockCommandChannel {
    async fn dispatch(
        &self,
        instance_id: &str,
        script: &str,
        options: &DispatchOptions,
    ) -> Result<String, CommandError> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(CommandError::Rejected(format!(
                "instance {} is not reachable",
                instance_id
            )));
        }

        let command_id = format!("cmd-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.lock().await.dispatches.push(DispatchRecord {
            command_id: command_id.clone(),
            instance_id: instance_id.to_string(),
            script: script.to_string(),
            options: options.clone(),
        });
        Ok(command_id)
    }

    async fn fetch_result(
        &self,
        _command_id: &str,
        instance_id: &str,
    ) -> Result<String, CommandError> {
        if self.stall_fetch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().await;
        let scripted = match state.per_instance.get_mut(instance_id) {
            Some(queue) if !queue.is_empty() => next_scripted(queue),
            _ => next_scripted(&mut state.outputs),
        };
        scripted.unwrap_or_else(|| Ok(String::new()))
    }
}
