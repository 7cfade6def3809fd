//! Flatpak application reconciliation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::error;

use super::{AdapterError, AdapterOutcome, command_ok, command_stdout};
use crate::api::{AppDefinition, AppsPolicy, Event, InstalledApp};
use crate::policy::AppsAdapter;
use crate::state::AppInventory;

/// Reconciles installed Flatpaks against the required set.
pub struct AppsManager {
    program: String,
}

impl Default for AppsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AppsManager {
    /// Creates a manager driving the system `flatpak` binary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "flatpak".to_string(),
        }
    }

    /// Overrides the flatpak binary, for tests.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Lists installed applications.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when the inventory command is missing or
    /// fails.
    pub async fn list_installed(&self) -> Result<Vec<InstalledApp>, AdapterError> {
        let output = command_stdout(
            &self.program,
            &["list", "--app", "--columns=application,branch,commit"],
        )
        .await?;
        Ok(parse_installed(&output))
    }

    /// Enforces the required application set.
    ///
    /// Per-item failures become events and reconciliation continues; only
    /// an unreadable inventory aborts.
    pub async fn apply(&self, policy: &AppsPolicy) -> AdapterOutcome {
        let installed = match self.list_installed().await {
            Ok(installed) => installed,
            Err(err) => return AdapterOutcome::failure(Vec::new(), err),
        };

        let (to_install, to_remove) = plan(&policy.required, &installed);
        let mut events = Vec::new();

        for def in to_install {
            match self.install(def).await {
                Ok(()) => events.push(Event::new(
                    "app.install.success",
                    serde_json::json!({"app": def.id}),
                )),
                Err(err) => {
                    error!(app = %def.id, error = %err, "failed to install app");
                    events.push(Event::new(
                        "app.install.failure",
                        serde_json::json!({"app": def.id, "error": err.to_string()}),
                    ));
                },
            }
        }

        for id in to_remove {
            match self.remove(&id).await {
                Ok(()) => events.push(Event::new(
                    "app.remove.success",
                    serde_json::json!({"app": id}),
                )),
                Err(err) => {
                    error!(app = %id, error = %err, "failed to remove app");
                    events.push(Event::new(
                        "app.remove.failure",
                        serde_json::json!({"app": id, "error": err.to_string()}),
                    ));
                },
            }
        }

        AdapterOutcome::success(events)
    }

    async fn install(&self, def: &AppDefinition) -> Result<(), AdapterError> {
        if def.id.is_empty() {
            return Err(AdapterError::InvalidPolicy {
                detail: "app id missing".to_string(),
            });
        }
        let mut args = vec!["install", "-y"];
        if !def.source.is_empty() {
            args.push(&def.source);
        }
        args.push(&def.id);
        command_ok(&self.program, &args).await
    }

    async fn remove(&self, id: &str) -> Result<(), AdapterError> {
        command_ok(&self.program, &["uninstall", "-y", id]).await
    }
}

#[async_trait]
impl AppsAdapter for AppsManager {
    async fn apply_apps(&self, policy: &AppsPolicy) -> AdapterOutcome {
        self.apply(policy).await
    }
}

#[async_trait]
impl AppInventory for AppsManager {
    async fn installed_apps(&self) -> Result<Vec<InstalledApp>, AdapterError> {
        self.list_installed().await
    }
}

/// Parses `flatpak list` output (tab- or space-separated columns).
fn parse_installed(output: &str) -> Vec<InstalledApp> {
    let mut apps = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            parts = line.split_whitespace().collect();
        }
        if parts.len() >= 3 {
            apps.push(InstalledApp {
                id: parts[0].to_string(),
                branch: parts[1].to_string(),
                version: parts[2].to_string(),
            });
        }
    }
    apps
}

/// Splits the required set against the inventory into installs and
/// removals.
fn plan<'a>(
    required: &'a [AppDefinition],
    installed: &[InstalledApp],
) -> (Vec<&'a AppDefinition>, Vec<String>) {
    let desired: BTreeMap<&str, &AppDefinition> =
        required.iter().map(|def| (def.id.as_str(), def)).collect();
    let present: BTreeMap<&str, &InstalledApp> =
        installed.iter().map(|app| (app.id.as_str(), app)).collect();

    let to_install = desired
        .iter()
        .filter(|(id, _)| !present.contains_key(*id))
        .map(|(_, def)| *def)
        .collect();
    let to_remove = present
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .map(|id| (*id).to_string())
        .collect();
    (to_install, to_remove)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn def(id: &str) -> AppDefinition {
        AppDefinition {
            id: id.to_string(),
            branch: "stable".to_string(),
            source: String::new(),
        }
    }

    fn app(id: &str) -> InstalledApp {
        InstalledApp {
            id: id.to_string(),
            branch: "stable".to_string(),
            version: "abc123".to_string(),
        }
    }

    #[test]
    fn parses_tab_separated_inventory() {
        let output = "org.example.Editor\tstable\tdeadbeef\norg.example.Term\tbeta\tcafe\n";
        let apps = parse_installed(output);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].id, "org.example.Editor");
        assert_eq!(apps[0].branch, "stable");
        assert_eq!(apps[0].version, "deadbeef");
    }

    #[test]
    fn parses_space_separated_inventory() {
        let output = "org.example.Editor   stable   deadbeef\n\n";
        let apps = parse_installed(output);
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].version, "deadbeef");
    }

    #[test]
    fn short_lines_are_skipped() {
        let apps = parse_installed("incomplete line\n");
        assert!(apps.is_empty());
    }

    #[test]
    fn plan_installs_missing_and_removes_extra() {
        let required = [def("org.example.Editor"), def("org.example.New")];
        let installed = [app("org.example.Editor"), app("org.example.Old")];

        let (to_install, to_remove) = plan(&required, &installed);

        let install_ids: Vec<&str> = to_install.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(install_ids, ["org.example.New"]);
        assert_eq!(to_remove, ["org.example.Old"]);
    }

    #[test]
    fn plan_is_empty_when_converged() {
        let required = [def("org.example.Editor")];
        let installed = [app("org.example.Editor")];

        let (to_install, to_remove) = plan(&required, &installed);
        assert!(to_install.is_empty());
        assert!(to_remove.is_empty());
    }

    /// Writes a fake flatpak that serves a fixed inventory and logs
    /// mutating invocations.
    fn fake_flatpak(dir: &std::path::Path, inventory: &str) -> String {
        let log = dir.join("calls.log");
        let script = dir.join("flatpak");
        let body = format!(
            "#!/bin/sh\nif [ \"$1\" = list ]; then\n  printf '{inventory}'\nelse\n  echo \"$@\" >> {}\nfi\n",
            log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[tokio::test]
    async fn apply_installs_and_removes_via_commands() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_flatpak(dir.path(), "org.example.Old\\tstable\\tc0ffee\\n");
        let manager = AppsManager::new().with_program(program);

        let policy = AppsPolicy {
            required: vec![def("org.example.New")],
        };
        let outcome = manager.apply(&policy).await;
        outcome.result.unwrap();

        let types: Vec<&str> = outcome.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["app.install.success", "app.remove.success"]);

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(log.contains("install -y org.example.New"));
        assert!(log.contains("uninstall -y org.example.Old"));
    }

    #[tokio::test]
    async fn missing_inventory_command_aborts() {
        let manager = AppsManager::new().with_program("/nonexistent/flatpak");
        let outcome = manager.apply(&AppsPolicy::default()).await;
        assert!(outcome.events.is_empty());
        assert!(outcome.result.is_err());
    }
}
