// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripts sent to instances over the command channel.
//!
//! The workload script carries the work spec and the credential
//! base64-encoded so neither appears in plaintext in the channel's command
//! history. It is always dispatched with output logging disabled.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::progress::NO_PROGRESS;
use crate::provider::{CommandChannel, CommandError, DispatchOptions};
use crate::secrets::SecretValue;

/// Quote a value for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the script that launches the runner for one execution.
pub fn workload_script(
    remote: &RemoteConfig,
    execution_id: &str,
    work_spec_json: &str,
    credential: &SecretValue,
    credential_provider: &str,
) -> String {
    let encoded_spec = general_purpose::STANDARD.encode(work_spec_json);
    let encoded_key = general_purpose::STANDARD.encode(credential.expose());

    format!(
        r#"#!/bin/bash
set -e

WORK_SPEC=$(echo "{encoded_spec}" | base64 -d)
API_KEY=$(echo "{encoded_key}" | base64 -d)

{runner} {execution_id} "$WORK_SPEC" "$API_KEY" {provider}
"#,
        runner = shell_quote(&remote.runner_script),
        execution_id = shell_quote(execution_id),
        provider = shell_quote(credential_provider),
    )
}

/// Options for the workload dispatch.
pub fn workload_options(budget: Duration) -> DispatchOptions {
    DispatchOptions {
        log_output: false,
        timeout: budget,
    }
}

/// Build the command that prints an execution's progress file.
pub fn progress_read_script(remote: &RemoteConfig, execution_id: &str) -> String {
    let path = format!(
        "{}/{}/progress.txt",
        remote.executions_dir.trim_end_matches('/'),
        execution_id
    );
    format!(
        "cat {} 2>&1 || echo \"{}\"",
        shell_quote(&path),
        NO_PROGRESS
    )
}

/// Read the latest progress snapshot from an instance.
///
/// Dispatches the read, waits `settle` for it to finish, then fetches its
/// output. Empty output is reported as [`NO_PROGRESS`].
pub async fn read_progress(
    channel: &dyn CommandChannel,
    remote: &RemoteConfig,
    settle: Duration,
    instance_id: &str,
    execution_id: &str,
) -> Result<String, CommandError> {
    let script = progress_read_script(remote, execution_id);
    let command_id = channel
        .dispatch(instance_id, &script, &DispatchOptions::default())
        .await?;

    tokio::time::sleep(settle).await;

    let output = channel.fetch_result(&command_id, instance_id).await?;
    debug!(
        instance_id = %instance_id,
        execution_id = %execution_id,
        bytes = output.len(),
        "Fetched progress snapshot"
    );

    if output.trim().is_empty() {
        Ok(NO_PROGRESS.to_string())
    } else {
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockCommandChannel;

    #[test]
    fn test_workload_script_hides_credential() {
        let remote = RemoteConfig::default();
        let secret = SecretValue::new("sk-ant-very-secret");
        let spec = r#"{"userStories":[{"id":"US-001","title":"Add login"}]}"#;

        let script = workload_script(&remote, "exec-42", spec, &secret, "anthropic");

        assert!(!script.contains("sk-ant-very-secret"));
        assert!(!script.contains("Add login"));
        assert!(script.contains(&general_purpose::STANDARD.encode("sk-ant-very-secret")));
        assert!(script.contains("'/opt/loopfleet/loop-runner.sh' 'exec-42'"));
        assert!(script.contains("'anthropic'"));
    }

    #[test]
    fn test_progress_read_script() {
        let remote = RemoteConfig {
            executions_dir: "/srv/runs/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            progress_read_script(&remote, "exec-1"),
            "cat '/srv/runs/exec-1/progress.txt' 2>&1 || echo \"No progress yet\""
        );
    }

    #[test]
    fn test_shell_quote_escapes_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_progress_empty_output() {
        let channel = MockCommandChannel::new();
        let remote = RemoteConfig::default();

        let progress = read_progress(&channel, &remote, Duration::from_secs(2), "i-1", "exec-1")
            .await
            .unwrap();
        assert_eq!(progress, NO_PROGRESS);

        let dispatches = channel.dispatches().await;
        assert_eq!(dispatches.len(), 1);
        assert!(dispatches[0].options.log_output);
        assert!(dispatches[0].script.contains("exec-1/progress.txt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_progress_returns_output() {
        let channel = MockCommandChannel::new();
        channel.push_output("US-001 passes: true").await;

        let progress = read_progress(
            &channel,
            &RemoteConfig::default(),
            Duration::from_secs(2),
            "i-1",
            "exec-1",
        )
        .await
        .unwrap();
        assert_eq!(progress, "US-001 passes: true");
    }
}
