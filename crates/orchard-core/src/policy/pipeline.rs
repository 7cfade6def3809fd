//! The policy reconciliation pipeline.
//!
//! `apply` verifies the envelope, persists it to the cache, then fans out
//! to the five subsystem adapters in a fixed order, aggregating their
//! events. A failing adapter stops the fan-out; earlier adapters are not
//! rolled back, because the next successful reconciliation converges the
//! host anyway.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::error;

use crate::adapters::{AdapterError, AdapterOutcome};
use crate::api::{
    AppsPolicy, BrowserPolicy, Event, NetworkPolicy, PolicyEnvelope, SecurityPolicy, UpdatePolicy,
};
use crate::fs_safe::{self, FsError};
use crate::policy::verifier::{Verifier, VerifierError};

/// Errors from policy application and cache access.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The envelope signature did not verify.
    #[error("verify policy: {0}")]
    Verify(#[from] VerifierError),

    /// The verified envelope could not be persisted to the cache.
    #[error("persist policy cache: {0}")]
    Cache(#[from] FsError),

    /// The cached envelope exists but does not decode.
    #[error("decode cached policy: {0}")]
    CacheDecode(#[source] serde_json::Error),

    /// A subsystem adapter failed; enforcement stopped there.
    #[error("{subsystem} reconciliation failed: {source}")]
    Adapter {
        /// Which adapter failed.
        subsystem: &'static str,
        /// The adapter's error.
        #[source]
        source: AdapterError,
    },
}

/// Applies the required-application set.
#[async_trait]
pub trait AppsAdapter: Send + Sync {
    /// Reconciles the host inventory against the required set.
    async fn apply_apps(&self, policy: &AppsPolicy) -> AdapterOutcome;
}

/// Applies managed browser configuration.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Materializes the managed browser policy file.
    async fn apply_browser(&self, policy: &BrowserPolicy) -> AdapterOutcome;
}

/// Applies OS update policy.
#[async_trait]
pub trait UpdatesAdapter: Send + Sync {
    /// Enforces channel and reboot scheduling.
    async fn apply_updates(&self, policy: &UpdatePolicy) -> AdapterOutcome;
}

/// Applies managed network profiles.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Writes managed profiles and removes orphans.
    async fn apply_network(&self, policy: &NetworkPolicy) -> AdapterOutcome;
}

/// Applies security service controls.
#[async_trait]
pub trait SecurityAdapter: Send + Sync {
    /// Reconciles SELinux, SSH, and USBGuard state.
    async fn apply_security(&self, policy: &SecurityPolicy) -> AdapterOutcome;
}

/// Coordinates verification, caching, and adapter fan-out.
pub struct PolicyManager {
    cache_path: PathBuf,
    verifier: Option<Verifier>,
    apps: Arc<dyn AppsAdapter>,
    browser: Arc<dyn BrowserAdapter>,
    updates: Arc<dyn UpdatesAdapter>,
    network: Arc<dyn NetworkAdapter>,
    security: Arc<dyn SecurityAdapter>,
    last_version: Mutex<Option<String>>,
}

impl PolicyManager {
    /// Creates a pipeline over the given adapters.
    ///
    /// Pass `None` for `verifier` only in tests; production always pins a
    /// key.
    pub fn new(
        cache_path: impl Into<PathBuf>,
        verifier: Option<Verifier>,
        apps: Arc<dyn AppsAdapter>,
        browser: Arc<dyn BrowserAdapter>,
        updates: Arc<dyn UpdatesAdapter>,
        network: Arc<dyn NetworkAdapter>,
        security: Arc<dyn SecurityAdapter>,
    ) -> Self {
        Self {
            cache_path: cache_path.into(),
            verifier,
            apps,
            browser,
            updates,
            network,
            security,
            last_version: Mutex::new(None),
        }
    }

    /// Verifies and enforces a policy envelope.
    ///
    /// Returns the events generated so far together with the overall
    /// result; the caller is responsible for enqueueing the events, so an
    /// in-flight crash loses at most the failing adapter's events.
    pub async fn apply(&self, envelope: &PolicyEnvelope) -> (Vec<Event>, Result<(), PolicyError>) {
        if let Some(verifier) = &self.verifier {
            if let Err(err) = verifier.verify(envelope) {
                return (Vec::new(), Err(PolicyError::Verify(err)));
            }
        }
        if let Err(err) = fs_safe::atomic_write_json(&self.cache_path, envelope) {
            return (Vec::new(), Err(PolicyError::Cache(err)));
        }

        let mut events = Vec::new();

        let outcome = self.apps.apply_apps(&envelope.policy.apps).await;
        events.extend(outcome.events);
        if let Err(source) = outcome.result {
            error!(error = %source, "app reconciliation failed");
            return (events, Err(PolicyError::Adapter {
                subsystem: "apps",
                source,
            }));
        }

        let outcome = self.browser.apply_browser(&envelope.policy.browser).await;
        events.extend(outcome.events);
        if let Err(source) = outcome.result {
            error!(error = %source, "browser enforcement failed");
            return (events, Err(PolicyError::Adapter {
                subsystem: "browser",
                source,
            }));
        }

        let outcome = self.updates.apply_updates(&envelope.policy.updates).await;
        events.extend(outcome.events);
        if let Err(source) = outcome.result {
            error!(error = %source, "update apply failed");
            return (events, Err(PolicyError::Adapter {
                subsystem: "updates",
                source,
            }));
        }

        let outcome = self.network.apply_network(&envelope.policy.network).await;
        events.extend(outcome.events);
        if let Err(source) = outcome.result {
            error!(error = %source, "network enforcement failed");
            return (events, Err(PolicyError::Adapter {
                subsystem: "network",
                source,
            }));
        }

        let outcome = self.security.apply_security(&envelope.policy.security).await;
        events.extend(outcome.events);
        if let Err(source) = outcome.result {
            error!(error = %source, "security enforcement failed");
            return (events, Err(PolicyError::Adapter {
                subsystem: "security",
                source,
            }));
        }

        *self.last_version.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(envelope.version.clone());
        events.push(Event::new(
            "policy.apply.success",
            serde_json::json!({"version": envelope.version}),
        ));
        (events, Ok(()))
    }

    /// Returns the last persisted envelope, `None` when no cache exists.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the cache cannot be read or decoded.
    pub fn cached_policy(&self) -> Result<Option<PolicyEnvelope>, PolicyError> {
        let Some(data) = fs_safe::read_optional(&self.cache_path).map_err(PolicyError::Cache)?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(PolicyError::CacheDecode)
    }

    /// Returns the version of the last successfully applied policy.
    #[must_use]
    pub fn last_version(&self) -> Option<String> {
        self.last_version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
