//! OS image updates, reboot scheduling, and rollback orchestration.
//!
//! The host image is managed by rpm-ostree; this adapter rebases the
//! channel, gates reboots on maintenance windows, and triggers a rollback
//! when the booted deployment is unhealthy. A rollback target is
//! attempted at most once per distinct booted checksum so a rollback that
//! itself fails cannot loop.

pub mod maintenance;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use super::{AdapterError, AdapterOutcome, command_ok, command_stdout, run_command};
use crate::api::{Event, UpdatePolicy};
use crate::policy::UpdatesAdapter;
use crate::state::UpdateStatusSource;

const STABILISATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pluggable clock, injected for deterministic scheduling tests.
pub type NowFn = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Parsed rpm-ostree status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    /// Channel of the booted deployment's origin.
    pub channel: String,
    /// Host state (`idle`, `staged`, `reboot_required`, ...).
    pub state: String,
    /// Whether a staged deployment awaits a reboot.
    pub reboot_required: bool,
    /// Whether the booted deployment looks unhealthy.
    pub needs_rollback: bool,
    /// Checksum of the deployment a rollback would land on.
    pub rollback_target: String,
    /// Checksum of the booted deployment.
    pub booted_checksum: String,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.channel.is_empty() {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{} ({})", self.state, self.channel)
        }
    }
}

/// Orchestrates rpm-ostree operations.
pub struct UpdatesManager {
    rpm_ostree: String,
    systemctl: String,
    reboot_command: Vec<String>,
    now: NowFn,
    last_rollback_attempt: Mutex<String>,
}

impl Default for UpdatesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdatesManager {
    /// Creates a manager driving the real host commands.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rpm_ostree: "rpm-ostree".to_string(),
            systemctl: "systemctl".to_string(),
            reboot_command: vec!["systemctl".to_string(), "reboot".to_string()],
            now: Box::new(Utc::now),
            last_rollback_attempt: Mutex::new(String::new()),
        }
    }

    /// Overrides the rpm-ostree binary, for tests.
    #[must_use]
    pub fn with_rpm_ostree(mut self, program: impl Into<String>) -> Self {
        self.rpm_ostree = program.into();
        self
    }

    /// Overrides the systemctl binary, for tests.
    #[must_use]
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    /// Overrides the command used to trigger reboots.
    #[must_use]
    pub fn with_reboot_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.reboot_command = command;
        }
        self
    }

    /// Overrides the time source, for deterministic tests.
    #[must_use]
    pub fn with_now(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    /// Queries the current host update status.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when rpm-ostree is missing, fails, or
    /// produces unparseable output.
    pub async fn status(&self) -> Result<Status, AdapterError> {
        let output = command_stdout(&self.rpm_ostree, &["status", "--json"]).await?;
        let payload: serde_json::Value =
            serde_json::from_str(&output).map_err(|e| AdapterError::OutputParse {
                program: self.rpm_ostree.clone(),
                detail: e.to_string(),
            })?;
        Ok(parse_status(&payload))
    }

    /// Enforces the update policy: channel rebase, then reboot gating.
    pub async fn apply(&self, policy: &UpdatePolicy) -> AdapterOutcome {
        let mut status = match self.status().await {
            Ok(status) => status,
            Err(err) => return AdapterOutcome::failure(Vec::new(), err),
        };

        let windows = match maintenance::parse_windows(&policy.maintenance_windows) {
            Ok(windows) => windows,
            Err(err) => {
                let event = Event::new(
                    "update.reboot.failure",
                    serde_json::json!({"error": err.to_string()}),
                );
                return AdapterOutcome::failure(vec![event], err);
            },
        };

        let mut events = Vec::new();

        if !policy.channel.is_empty() && status.channel != policy.channel {
            if let Err(err) = self.rebase(&policy.channel).await {
                events.push(Event::new(
                    "update.apply.failure",
                    serde_json::json!({"channel": policy.channel, "error": err.to_string()}),
                ));
                return AdapterOutcome::failure(events, err);
            }
            events.push(Event::new(
                "update.apply.success",
                serde_json::json!({"channel": policy.channel}),
            ));
            if let Ok(fresh) = self.status().await {
                status = fresh;
            }
        }

        if policy.reboot_required && status.reboot_required {
            let now = (self.now)();
            if maintenance::allows(&windows, now) {
                if let Err(err) = self.trigger_reboot().await {
                    events.push(Event::new(
                        "update.reboot.failure",
                        serde_json::json!({"error": err.to_string()}),
                    ));
                    return AdapterOutcome::failure(events, err);
                }
                events.push(Event::new(
                    "update.reboot.triggered",
                    serde_json::json!({"time": now.to_rfc3339_opts(SecondsFormat::Secs, true)}),
                ));
            } else if let Some(next) = maintenance::next_window(&windows, now) {
                events.push(Event::new(
                    "update.reboot.deferred",
                    serde_json::json!({
                        "scheduled_for": next.to_rfc3339_opts(SecondsFormat::Secs, true)
                    }),
                ));
            } else {
                events.push(Event::new(
                    "update.reboot.deferred",
                    serde_json::json!({"reason": "no_window"}),
                ));
            }
        }

        AdapterOutcome::success(events)
    }

    /// Triggers a rollback when the booted deployment is unhealthy.
    ///
    /// Invoked from the state loop so a broken host rolls itself back
    /// even while reporting is failing.
    pub async fn ensure_rollback(&self) -> AdapterOutcome {
        let status = match self.status().await {
            Ok(status) => status,
            Err(err) => return AdapterOutcome::failure(Vec::new(), err),
        };

        let mut needs_rollback = status.needs_rollback;
        if !needs_rollback {
            match self.rollback_requested().await {
                Ok(pending) => needs_rollback = pending,
                Err(err) => warn!(error = %err, "rollback target detection failed"),
            }
        }

        if !needs_rollback {
            self.set_last_rollback_attempt(String::new());
            return AdapterOutcome::success(Vec::new());
        }

        let identifier = if status.booted_checksum.is_empty() {
            status.channel.clone()
        } else {
            status.booted_checksum.clone()
        };
        {
            let mut last = self
                .last_rollback_attempt
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !identifier.is_empty() && identifier == *last {
                return AdapterOutcome::success(Vec::new());
            }
            *last = identifier;
        }

        if let Err(err) = command_ok(&self.rpm_ostree, &["rollback"]).await {
            let event = Event::new(
                "update.rollback.failure",
                serde_json::json!({"error": err.to_string()}),
            );
            return AdapterOutcome::failure(vec![event], err);
        }

        let payload = if status.rollback_target.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::json!({"target": status.rollback_target})
        };
        AdapterOutcome::success(vec![Event::new("update.rollback.triggered", payload)])
    }

    /// Polls status until the host reads `idle` or `reboot_required`.
    ///
    /// # Errors
    ///
    /// Returns the status error or [`AdapterError::Timeout`] when the
    /// deadline passes first.
    pub async fn wait_for_stabilisation(&self, timeout: Duration) -> Result<(), AdapterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if status.state == "idle" || status.state == "reboot_required" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AdapterError::Timeout {
                    context: "updates did not stabilise before timeout".to_string(),
                });
            }
            tokio::time::sleep(STABILISATION_POLL_INTERVAL).await;
        }
    }

    async fn rebase(&self, channel: &str) -> Result<(), AdapterError> {
        command_ok(&self.rpm_ostree, &["rebase", channel]).await
    }

    async fn trigger_reboot(&self) -> Result<(), AdapterError> {
        let Some((program, args)) = self.reboot_command.split_first() else {
            return Err(AdapterError::InvalidPolicy {
                detail: "no reboot command configured".to_string(),
            });
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command_ok(program, &args).await
    }

    /// Probes whether the host explicitly requested a rollback.
    ///
    /// `systemctl is-active` exits 3 for an inactive unit, which is a
    /// normal answer, not an error. A missing systemctl is treated as
    /// "not requested".
    async fn rollback_requested(&self) -> Result<bool, AdapterError> {
        let output =
            match run_command(&self.systemctl, &["is-active", "--quiet", "rollback.target"]).await {
                Ok(output) => output,
                Err(AdapterError::CommandMissing { .. }) => return Ok(false),
                Err(err) => return Err(err),
            };
        if output.status.success() {
            return Ok(true);
        }
        if output.status.code() == Some(3) {
            return Ok(false);
        }
        Err(AdapterError::CommandFailed {
            program: self.systemctl.clone(),
            detail: format!(
                "is-active rollback.target exited {:?}",
                output.status.code()
            ),
        })
    }

    fn set_last_rollback_attempt(&self, value: String) {
        *self
            .last_rollback_attempt
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = value;
    }
}

#[async_trait]
impl UpdatesAdapter for UpdatesManager {
    async fn apply_updates(&self, policy: &UpdatePolicy) -> AdapterOutcome {
        self.apply(policy).await
    }
}

#[async_trait]
impl UpdateStatusSource for UpdatesManager {
    async fn update_status(&self) -> Result<Status, AdapterError> {
        self.status().await
    }
}

/// Extracts the channel from a deployment origin string.
fn extract_channel(origin: &str) -> String {
    if origin.is_empty() {
        return String::new();
    }
    origin
        .split_whitespace()
        .find(|part| part.contains(':'))
        .unwrap_or(origin)
        .to_string()
}

fn string_value<'a>(map: &'a serde_json::Value, key: &str) -> &'a str {
    map.get(key).and_then(serde_json::Value::as_str).unwrap_or("")
}

/// Parses the `rpm-ostree status --json` payload.
fn parse_status(payload: &serde_json::Value) -> Status {
    let mut status = Status {
        state: "idle".to_string(),
        ..Status::default()
    };

    if let Some(reboot) = payload.get("reboot-required").and_then(serde_json::Value::as_bool) {
        status.reboot_required = reboot;
        if reboot {
            status.state = "reboot_required".to_string();
        }
    }

    let deployments = payload
        .get("deployments")
        .and_then(serde_json::Value::as_array);

    if let Some(deployments) = deployments {
        for dep in deployments {
            let booted = dep
                .get("booted")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);

            let origin = string_value(dep, "origin");
            if !origin.is_empty() && status.channel.is_empty() {
                status.channel = extract_channel(origin);
            }

            let checksum = string_value(dep, "checksum");
            if !checksum.is_empty() {
                if booted {
                    status.booted_checksum = checksum.to_string();
                } else if status.rollback_target.is_empty() {
                    status.rollback_target = checksum.to_string();
                }
            }

            if dep
                .get("staged")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
            {
                status.state = "staged".to_string();
            }

            if booted {
                let state = string_value(dep, "state");
                if !state.is_empty() {
                    status.state = state.to_lowercase();
                }
                if deployment_needs_rollback(dep) {
                    status.needs_rollback = true;
                }
            }
        }
    }

    if let Some(transaction) = payload.get("transaction") {
        let kind = string_value(transaction, "kind");
        if !kind.is_empty() {
            status.state = kind.to_lowercase();
        }
        if string_value(transaction, "state").to_lowercase().contains("fail") {
            status.needs_rollback = true;
        }
    }

    if status.needs_rollback && status.rollback_target.is_empty() {
        if let Some(deployments) = deployments {
            for dep in deployments {
                if dep
                    .get("booted")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false)
                {
                    continue;
                }
                let checksum = string_value(dep, "checksum");
                if !checksum.is_empty() && checksum != status.booted_checksum {
                    status.rollback_target = checksum.to_string();
                    break;
                }
            }
        }
    }

    if status.state.is_empty() {
        status.state = "idle".to_string();
    }
    status
}

fn deployment_needs_rollback(dep: &serde_json::Value) -> bool {
    if dep
        .get("unbootable")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return true;
    }
    if dep
        .get("rollback")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return true;
    }
    let state = string_value(dep, "state").to_lowercase();
    if state.contains("rollback") || state.contains("error") {
        return true;
    }
    if string_value(dep, "health").to_lowercase().contains("degraded") {
        return true;
    }
    if let Some(meta) = dep.get("metadata") {
        if let Some(success) = meta
            .get("ostree.boot-success")
            .and_then(serde_json::Value::as_bool)
        {
            if !success {
                return true;
            }
        }
        if string_value(meta, "health").to_lowercase().contains("degraded") {
            return true;
        }
    }
    false
}
