//! Security service reconciliation: SELinux, SSH, and USBGuard.
//!
//! Unlike the other adapters, the controls here are independent of each
//! other, so a failing control emits its failure event and reconciliation
//! moves on to the next one.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{AdapterError, AdapterOutcome, command_ok};
use crate::api::{Event, SecurityPolicy};
use crate::fs_safe;
use crate::policy::SecurityAdapter;

const DEFAULT_SELINUX_ENFORCE_PATH: &str = "/sys/fs/selinux/enforce";
const DEFAULT_SSH_DROPIN_PATH: &str = "/etc/ssh/sshd_config.d/orchard.conf";
const DEFAULT_USBGUARD_RULES_PATH: &str = "/etc/usbguard/rules.conf";

/// Reconciles security controls.
pub struct SecurityManager {
    selinux_enforce_path: PathBuf,
    ssh_dropin_path: PathBuf,
    usbguard_rules_path: PathBuf,
    setenforce: String,
    systemctl: String,
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityManager {
    /// Creates a manager driving the real host paths and commands.
    #[must_use]
    pub fn new() -> Self {
        Self {
            selinux_enforce_path: PathBuf::from(DEFAULT_SELINUX_ENFORCE_PATH),
            ssh_dropin_path: PathBuf::from(DEFAULT_SSH_DROPIN_PATH),
            usbguard_rules_path: PathBuf::from(DEFAULT_USBGUARD_RULES_PATH),
            setenforce: "setenforce".to_string(),
            systemctl: "systemctl".to_string(),
        }
    }

    /// Overrides the SELinux enforce node, for tests.
    #[must_use]
    pub fn with_selinux_enforce_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.selinux_enforce_path = path.into();
        self
    }

    /// Overrides the sshd drop-in path, for tests.
    #[must_use]
    pub fn with_ssh_dropin_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_dropin_path = path.into();
        self
    }

    /// Overrides the USBGuard rules path, for tests.
    #[must_use]
    pub fn with_usbguard_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.usbguard_rules_path = path.into();
        self
    }

    /// Overrides the setenforce binary, for tests.
    #[must_use]
    pub fn with_setenforce(mut self, program: impl Into<String>) -> Self {
        self.setenforce = program.into();
        self
    }

    /// Overrides the systemctl binary, for tests.
    #[must_use]
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    /// Enforces all security controls, emitting one event per control.
    pub async fn apply(&self, policy: &SecurityPolicy) -> AdapterOutcome {
        let mut events = Vec::new();

        match self.ensure_selinux(policy.selinux_enforce).await {
            Ok(()) => {
                let state = if policy.selinux_enforce {
                    "enforcing"
                } else {
                    "permissive"
                };
                events.push(Event::new(
                    "security.selinux.success",
                    serde_json::json!({"state": state}),
                ));
            },
            Err(err) => {
                error!(error = %err, "failed to configure selinux");
                events.push(Event::new(
                    "security.selinux.failure",
                    serde_json::json!({"error": err.to_string()}),
                ));
            },
        }

        match self.configure_ssh(policy.allow_root_login) {
            Ok(()) => {
                let mode = if policy.allow_root_login {
                    "enabled"
                } else {
                    "disabled"
                };
                events.push(Event::new(
                    "security.ssh.config.success",
                    serde_json::json!({"root_login": mode}),
                ));
            },
            Err(err) => {
                error!(error = %err, "failed to configure ssh");
                events.push(Event::new(
                    "security.ssh.config.failure",
                    serde_json::json!({"error": err.to_string()}),
                ));
            },
        }

        match self.toggle_service("sshd", policy.ssh_enabled).await {
            Ok(()) => {
                let state = if policy.ssh_enabled { "enabled" } else { "disabled" };
                events.push(Event::new(
                    "security.ssh.success",
                    serde_json::json!({"state": state}),
                ));
            },
            Err(err) => {
                error!(error = %err, "failed to toggle ssh");
                events.push(Event::new(
                    "security.ssh.failure",
                    serde_json::json!({"error": err.to_string()}),
                ));
            },
        }

        if policy.usbguard {
            match self.write_usbguard_rules(&policy.usbguard_rules) {
                Ok(()) => events.push(Event::new(
                    "security.usbguard.rules",
                    serde_json::json!({"count": policy.usbguard_rules.len()}),
                )),
                Err(err) => {
                    error!(error = %err, "failed to apply usbguard rules");
                    events.push(Event::new(
                        "security.usbguard.failure",
                        serde_json::json!({"error": err.to_string()}),
                    ));
                },
            }
        } else if let Err(err) = fs_safe::remove_if_exists(&self.usbguard_rules_path) {
            warn!(error = %err, "failed to remove usbguard rules");
        }

        match self.toggle_service("usbguard", policy.usbguard).await {
            Ok(()) => {
                let state = if policy.usbguard { "enabled" } else { "disabled" };
                events.push(Event::new(
                    "security.usbguard.success",
                    serde_json::json!({"state": state}),
                ));
            },
            Err(err) => {
                error!(error = %err, "failed to toggle usbguard");
                events.push(Event::new(
                    "security.usbguard.failure",
                    serde_json::json!({"error": err.to_string()}),
                ));
            },
        }

        AdapterOutcome::success(events)
    }

    async fn ensure_selinux(&self, enforce: bool) -> Result<(), AdapterError> {
        let current = std::fs::read(&self.selinux_enforce_path)
            .map_err(|e| AdapterError::io("read selinux enforce", e))?;
        let desired = if enforce { b'1' } else { b'0' };
        if current.first() == Some(&desired) {
            return Ok(());
        }
        let mode = if enforce { "1" } else { "0" };
        command_ok(&self.setenforce, &[mode]).await
    }

    async fn toggle_service(&self, service: &str, enable: bool) -> Result<(), AdapterError> {
        let verb = if enable { "enable" } else { "disable" };
        command_ok(&self.systemctl, &[verb, "--now", service]).await
    }

    fn configure_ssh(&self, allow_root: bool) -> Result<(), AdapterError> {
        let mode = if allow_root { "yes" } else { "no" };
        let content = format!("# Managed by the orchard device agent\nPermitRootLogin {mode}\n");
        fs_safe::atomic_write_mode(&self.ssh_dropin_path, content.as_bytes(), 0o644, 0o755)?;
        Ok(())
    }

    fn write_usbguard_rules(&self, rules: &[String]) -> Result<(), AdapterError> {
        let mut content = String::from("# Managed by the orchard device agent\n");
        if !rules.is_empty() {
            content.push_str(&rules.join("\n"));
            content.push('\n');
        }
        fs_safe::atomic_write_mode(&self.usbguard_rules_path, content.as_bytes(), 0o600, 0o750)?;
        Ok(())
    }
}

#[async_trait]
impl SecurityAdapter for SecurityManager {
    async fn apply_security(&self, policy: &SecurityPolicy) -> AdapterOutcome {
        self.apply(policy).await
    }
}
