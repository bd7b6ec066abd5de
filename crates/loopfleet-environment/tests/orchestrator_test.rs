// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end orchestration tests over mocks.
//!
//! Monitoring sleeps between polls, so these run with paused time.

mod common;

use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::Utc;
use common::{CREDENTIAL, Fleet, new_execution, test_config};
use loopfleet_core::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, InstanceRecord, InstanceStatus,
    InstanceStore, MarketType,
};
use loopfleet_environment::Error;
use loopfleet_environment::orchestrator::{NewExecution, StartOutcome};
use loopfleet_environment::provider::{MockCommandChannel, MockProvider, ProviderState};
use serde_json::json;

fn dispatched(outcome: StartOutcome) -> (String, tokio::task::JoinHandle<ExecutionStatus>) {
    match outcome {
        StartOutcome::Dispatched {
            instance_id,
            monitor,
        } => (instance_id, monitor),
        StartOutcome::Failed { reason } => panic!("start failed: {}", reason),
    }
}

fn failed(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::Failed { reason } => reason,
        StartOutcome::Dispatched { instance_id, .. } => {
            panic!("expected failure, dispatched to {}", instance_id)
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_execution_runs_to_completion() {
    let fleet = Fleet::new(5, 0).await;
    fleet
        .channel
        .push_output("Loading prd.json\nPicking user story US-001")
        .await;
    fleet
        .channel
        .push_output("US-001 passes: true\nUS-002 passes: true\n<promise>COMPLETE</promise>")
        .await;

    let execution = fleet.submit().await;
    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert_eq!(execution.total_steps, 10);

    let outcome = fleet.orchestrator.start(&execution.execution_id).await.unwrap();
    let (instance_id, monitor) = dispatched(outcome);
    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Completed);

    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.current_step, 10);
    assert_eq!(record.instance_id.as_deref(), Some(instance_id.as_str()));
    assert!(record.progress.unwrap().contains("<promise>COMPLETE</promise>"));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    let instance = fleet.instance(&instance_id).await;
    assert_eq!(instance.status, InstanceStatus::Available);
    assert!(instance.current_execution_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_workload_dispatch_hides_credential() {
    let fleet = Fleet::new(5, 0).await;
    fleet.channel.push_output("<promise>COMPLETE</promise>").await;

    let execution = fleet.submit().await;
    let (instance_id, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());
    monitor.await.unwrap();

    let unlogged = fleet.channel.unlogged_dispatches().await;
    assert_eq!(unlogged.len(), 1);
    let workload = &unlogged[0];
    assert_eq!(workload.instance_id, instance_id);
    assert_eq!(workload.options.timeout, fleet.config.monitor.budget);
    assert!(!workload.script.contains(CREDENTIAL));
    assert!(!workload.script.contains("Add login form"));
    assert!(
        workload
            .script
            .contains(&general_purpose::STANDARD.encode(CREDENTIAL))
    );
    assert!(workload.script.contains(&execution.execution_id));

    // Progress reads keep output logging on.
    let dispatches = fleet.channel.dispatches().await;
    assert!(dispatches.len() > 1);
    assert!(dispatches[1..].iter().all(|d| d.options.log_output));
}

#[tokio::test(start_paused = true)]
async fn test_execution_times_out_after_budget() {
    let fleet = Fleet::new(5, 0).await;

    let execution = fleet.submit().await;
    let (instance_id, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());
    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Failed);

    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.progress.as_deref(),
        Some("Execution timed out after 1 hour")
    );
    // Step reflects the last poll, not the timeout.
    assert_eq!(record.current_step, 1);

    let instance = fleet.instance(&instance_id).await;
    assert_eq!(instance.status, InstanceStatus::Available);
    assert!(fleet.provider.terminated().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_budget_enforced_when_progress_reads_hang() {
    let fleet =
        Fleet::with_parts(MockProvider::new(), MockCommandChannel::stalled(), test_config(5, 0))
            .await;

    let execution = fleet.submit().await;
    let (instance_id, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    let status = tokio::time::timeout(std::time::Duration::from_secs(3 * 3600), monitor)
        .await
        .expect("monitor must finish within the budget")
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.progress.as_deref(),
        Some("Execution timed out after 1 hour")
    );
    assert_eq!(
        fleet.instance(&instance_id).await.status,
        InstanceStatus::Available
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_marker_fails_execution() {
    let fleet = Fleet::new(5, 0).await;
    fleet
        .channel
        .push_output("US-001 passes: true\n<promise>FAILED</promise>")
        .await;

    let execution = fleet.submit().await;
    let (instance_id, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());
    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Failed);

    let record = fleet.execution(&execution.execution_id).await;
    assert!(record.progress.unwrap().contains("<promise>FAILED</promise>"));
    assert_eq!(
        fleet.instance(&instance_id).await.status,
        InstanceStatus::Available
    );
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_written_while_running() {
    let fleet = Fleet::new(5, 0).await;
    fleet.channel.push_output("Loading prd.json").await;
    fleet
        .channel
        .push_output("US-001\nUS-002\nUS-001 passes: true")
        .await;
    fleet.channel.push_output("<promise>COMPLETE</promise>").await;

    let execution = fleet.submit().await;
    let (_, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    // First read: settle, then the step is written.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.current_step, 2);

    // Second read lands after one poll interval.
    tokio::time::sleep(std::time::Duration::from_secs(7)).await;
    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.current_step, 6);

    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_read_errors_are_retried() {
    let fleet = Fleet::new(5, 0).await;
    fleet
        .channel
        .push_error(loopfleet_environment::provider::CommandError::Transport(
            "throttled".to_string(),
        ))
        .await;
    fleet.channel.push_output("<promise>COMPLETE</promise>").await;

    let execution = fleet.submit().await;
    let (_, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_dispatch_failure_fails_execution_and_recycles() {
    let fleet =
        Fleet::with_parts(MockProvider::new(), MockCommandChannel::failing(), test_config(5, 0))
            .await;

    let execution = fleet.submit().await;
    let reason = failed(fleet.orchestrator.start(&execution.execution_id).await.unwrap());
    assert!(reason.starts_with("Error: Dispatch failed"), "{}", reason);

    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.progress.as_deref(), Some(reason.as_str()));
    assert!(record.completed_at.is_some());

    let instance_id = record.instance_id.unwrap();
    assert_eq!(
        fleet.instance(&instance_id).await.status,
        InstanceStatus::Available
    );
}

#[tokio::test]
async fn test_missing_secret_fails_before_dispatch() {
    let fleet = Fleet::new(5, 0).await;

    let execution = fleet
        .orchestrator
        .submit(NewExecution {
            credential_ref: "keys/unknown".to_string(),
            ..new_execution()
        })
        .await
        .unwrap();
    let reason = failed(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    assert!(reason.contains("Secret not found: keys/unknown"), "{}", reason);
    assert!(fleet.channel.dispatches().await.is_empty());
    assert_eq!(fleet.count(&[InstanceStatus::Available]).await, 1);
}

#[tokio::test]
async fn test_pool_exhausted_fails_execution() {
    let fleet = Fleet::new(1, 0).await;
    fleet.instances.acquire_instance("other").await.unwrap();

    let execution = fleet.submit().await;
    let reason = failed(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    assert_eq!(
        reason,
        "Error: Instance pool exhausted: 1 of 1 instances in use"
    );
    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.instance_id.is_none());
}

#[tokio::test]
async fn test_start_rejects_unknown_and_non_queued() {
    let fleet =
        Fleet::with_parts(MockProvider::new(), MockCommandChannel::failing(), test_config(5, 0))
            .await;

    let err = fleet.orchestrator.start("missing").await.unwrap_err();
    assert!(matches!(err, Error::ExecutionNotFound(_)));

    let execution = fleet.submit().await;
    failed(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    let err = fleet
        .orchestrator
        .start(&execution.execution_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidExecutionState {
            status: ExecutionStatus::Failed,
            expected: ExecutionStatus::Queued,
            ..
        }
    ));
    // Only the first start touched the provider.
    assert_eq!(fleet.provider.launched().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_external_failure_during_cold_launch_skips_dispatch() {
    let mut provider = MockProvider::new();
    provider.ready_after = 3;
    let fleet = Fleet::with_provider(provider, test_config(5, 0)).await;

    let execution = fleet.submit().await;
    let orchestrator = fleet.orchestrator.clone();
    let execution_id = execution.execution_id.clone();
    let start = tokio::spawn(async move { orchestrator.start(&execution_id).await });

    while fleet.execution(&execution.execution_id).await.status != ExecutionStatus::Running {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert!(
        fleet
            .registry
            .finish_execution_if_running(
                &execution.execution_id,
                ExecutionStatus::Failed,
                "Cancelled by user",
                None,
                Utc::now(),
            )
            .await
            .unwrap()
    );

    let reason = failed(start.await.unwrap().unwrap());
    assert!(reason.contains("expected running"), "{}", reason);

    assert!(fleet.channel.dispatches().await.is_empty());
    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.progress.as_deref(), Some("Cancelled by user"));
    assert!(record.instance_id.is_none());

    let launched = fleet.provider.launched().await;
    assert_eq!(launched.len(), 1);
    let instance = fleet.instance(&launched[0]).await;
    assert_eq!(instance.status, InstanceStatus::Available);
    assert!(instance.current_execution_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_external_failure_stops_monitor() {
    let fleet = Fleet::new(5, 0).await;

    let execution = fleet.submit().await;
    let (instance_id, monitor) =
        dispatched(fleet.orchestrator.start(&execution.execution_id).await.unwrap());

    assert!(
        fleet
            .registry
            .finish_execution_if_running(
                &execution.execution_id,
                ExecutionStatus::Failed,
                "Cancelled by user",
                None,
                Utc::now(),
            )
            .await
            .unwrap()
    );

    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Failed);
    let record = fleet.execution(&execution.execution_id).await;
    assert_eq!(record.progress.as_deref(), Some("Cancelled by user"));
    assert_eq!(
        fleet.instance(&instance_id).await.status,
        InstanceStatus::Available
    );
}

#[tokio::test(start_paused = true)]
async fn test_resume_reattaches_in_flight_work() {
    let fleet = Fleet::new(5, 0).await;
    let now = Utc::now();

    // A running execution on a busy instance.
    let busy = InstanceRecord::launching("i-busy", MarketType::Spot, false, now);
    fleet.registry.insert_instance(&busy).await.unwrap();
    fleet
        .registry
        .mark_instance_ready("i-busy", Some("10.0.0.1"), Some("exec-running"), now)
        .await
        .unwrap();
    let running = ExecutionRecord::queued(
        "exec-running",
        "workload-1",
        "keys/anthropic",
        "anthropic",
        json!({}),
        now,
    );
    fleet.registry.insert_execution(&running).await.unwrap();
    fleet
        .registry
        .start_execution_if_queued("exec-running", now)
        .await
        .unwrap();
    fleet
        .registry
        .assign_execution_instance("exec-running", "i-busy")
        .await
        .unwrap();
    fleet
        .channel
        .push_instance_output("i-busy", "<promise>COMPLETE</promise>")
        .await;

    // A running execution that never got an instance.
    let orphan = ExecutionRecord::queued(
        "exec-orphan",
        "workload-1",
        "keys/anthropic",
        "anthropic",
        json!({}),
        now,
    );
    fleet.registry.insert_execution(&orphan).await.unwrap();
    fleet
        .registry
        .start_execution_if_queued("exec-orphan", now)
        .await
        .unwrap();

    // A warm instance that was still booting.
    let booting = InstanceRecord::launching("i-booting", MarketType::Spot, true, now);
    fleet.registry.insert_instance(&booting).await.unwrap();
    fleet
        .provider
        .adopt("i-booting", ProviderState::Running)
        .await;

    let mut report = fleet.orchestrator.resume().await.unwrap();

    assert_eq!(report.failed, vec!["exec-orphan".to_string()]);
    let orphan = fleet.execution("exec-orphan").await;
    assert_eq!(orphan.status, ExecutionStatus::Failed);
    assert_eq!(
        orphan.progress.as_deref(),
        Some("Error: orchestration interrupted before an instance was assigned")
    );

    assert_eq!(report.monitors.len(), 1);
    let (execution_id, monitor) = report.monitors.remove(0);
    assert_eq!(execution_id, "exec-running");
    assert_eq!(monitor.await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(
        fleet.instance("i-busy").await.status,
        InstanceStatus::Available
    );

    assert_eq!(report.launching.len(), 1);
    for handle in report.launching {
        handle.await.unwrap();
    }
    let booted = fleet.instance("i-booting").await;
    assert_eq!(booted.status, InstanceStatus::Available);
    assert!(booted.is_warm);
}
