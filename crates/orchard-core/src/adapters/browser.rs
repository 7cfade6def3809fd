//! Managed browser configuration.
//!
//! The policy is materialized as a Chromium managed-policy JSON file; the
//! browser picks it up on its own.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{AdapterError, AdapterOutcome};
use crate::api::{BrowserPolicy, Event};
use crate::fs_safe;
use crate::policy::BrowserAdapter;

const DEFAULT_POLICY_PATH: &str = "/etc/chromium/policies/managed/orchard.json";

/// Writes the managed browser policy file.
pub struct BrowserManager {
    path: PathBuf,
}

impl Default for BrowserManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserManager {
    /// Creates a manager writing to the default managed-policy path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_POLICY_PATH),
        }
    }

    /// Overrides the managed-policy path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Materializes the policy file and reports the update.
    pub fn apply(&self, policy: &BrowserPolicy) -> AdapterOutcome {
        let document = build_browser_policy(policy);
        if let Err(err) = fs_safe::atomic_write_json(&self.path, &document) {
            return AdapterOutcome::failure(Vec::new(), AdapterError::Fs(err));
        }
        let event = Event::new(
            "browser.policy.updated",
            serde_json::json!({"path": self.path.display().to_string()}),
        );
        AdapterOutcome::success(vec![event])
    }
}

#[async_trait]
impl BrowserAdapter for BrowserManager {
    async fn apply_browser(&self, policy: &BrowserPolicy) -> AdapterOutcome {
        self.apply(policy)
    }
}

/// Translates the policy into Chromium's managed-policy schema.
fn build_browser_policy(policy: &BrowserPolicy) -> serde_json::Value {
    let mut doc = serde_json::Map::new();

    let homepage = policy.homepage.trim();
    if !homepage.is_empty() {
        doc.insert("HomepageLocation".into(), homepage.into());
        doc.insert("HomepageIsNewTabPage".into(), false.into());
        doc.insert("RestoreOnStartup".into(), 4.into());
        doc.insert(
            "RestoreOnStartupURLs".into(),
            serde_json::json!([homepage]),
        );
    }

    // The forcelist is always present so removing the last extension
    // actually clears it on the host.
    doc.insert(
        "ExtensionInstallForcelist".into(),
        serde_json::json!(policy.extensions),
    );

    let devtools_availability = if policy.allow_dev_tools { 1 } else { 2 };
    doc.insert(
        "DeveloperToolsAvailability".into(),
        devtools_availability.into(),
    );

    let bookmarks: Vec<serde_json::Value> = policy
        .managed_bookmarks
        .iter()
        .filter(|bm| !bm.name.is_empty() && !bm.url.is_empty())
        .map(|bm| {
            serde_json::json!({
                "toplevel_name": "Managed",
                "name": bm.name,
                "url": bm.url,
            })
        })
        .collect();
    if !bookmarks.is_empty() {
        doc.insert("ManagedBookmarks".into(), serde_json::Value::Array(bookmarks));
    }

    serde_json::Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Bookmark;

    #[test]
    fn homepage_pins_startup_urls() {
        let policy = BrowserPolicy {
            homepage: " https://intranet.example.com ".to_string(),
            ..BrowserPolicy::default()
        };
        let doc = build_browser_policy(&policy);

        assert_eq!(doc["HomepageLocation"], "https://intranet.example.com");
        assert_eq!(doc["HomepageIsNewTabPage"], false);
        assert_eq!(doc["RestoreOnStartup"], 4);
        assert_eq!(
            doc["RestoreOnStartupURLs"],
            serde_json::json!(["https://intranet.example.com"])
        );
    }

    #[test]
    fn empty_homepage_leaves_startup_unset() {
        let doc = build_browser_policy(&BrowserPolicy::default());
        assert!(doc.get("HomepageLocation").is_none());
        assert!(doc.get("RestoreOnStartup").is_none());
    }

    #[test]
    fn forcelist_is_always_present() {
        let doc = build_browser_policy(&BrowserPolicy::default());
        assert_eq!(doc["ExtensionInstallForcelist"], serde_json::json!([]));

        let policy = BrowserPolicy {
            extensions: vec!["abcdefg".to_string()],
            ..BrowserPolicy::default()
        };
        let doc = build_browser_policy(&policy);
        assert_eq!(
            doc["ExtensionInstallForcelist"],
            serde_json::json!(["abcdefg"])
        );
    }

    #[test]
    fn devtools_switch_maps_to_availability() {
        let mut policy = BrowserPolicy::default();
        assert_eq!(build_browser_policy(&policy)["DeveloperToolsAvailability"], 2);
        policy.allow_dev_tools = true;
        assert_eq!(build_browser_policy(&policy)["DeveloperToolsAvailability"], 1);
    }

    #[test]
    fn incomplete_bookmarks_are_dropped() {
        let policy = BrowserPolicy {
            managed_bookmarks: vec![
                Bookmark {
                    name: "Wiki".to_string(),
                    url: "https://wiki.example.com".to_string(),
                },
                Bookmark {
                    name: String::new(),
                    url: "https://nameless.example.com".to_string(),
                },
            ],
            ..BrowserPolicy::default()
        };
        let doc = build_browser_policy(&policy);

        let bookmarks = doc["ManagedBookmarks"].as_array().unwrap();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0]["name"], "Wiki");
        assert_eq!(bookmarks[0]["toplevel_name"], "Managed");
    }

    #[tokio::test]
    async fn apply_writes_file_and_emits_single_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("managed").join("orchard.json");
        let manager = BrowserManager::new().with_path(&path);

        let outcome = manager.apply(&BrowserPolicy::default());
        outcome.result.unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_type, "browser.policy.updated");

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["DeveloperToolsAvailability"], 2);
    }
}
