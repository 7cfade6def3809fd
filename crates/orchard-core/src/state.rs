//! Device-state collection.
//!
//! The collector assembles one [`DeviceState`] snapshot per state-loop
//! tick. Every probe is best-effort: a host command that fails produces a
//! warning and a partially filled snapshot rather than an error, because
//! a degraded host is exactly the one whose heartbeat matters most.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::adapters::AdapterError;
use crate::adapters::updates::Status;
use crate::api::{DeviceState, InstalledApp};

const DEFAULT_BATTERY_PATHS: [&str; 2] = [
    "/sys/class/power_supply/BAT0/capacity",
    "/sys/class/power_supply/BAT1/capacity",
];

/// Host application inventory, as seen by the state collector.
#[async_trait]
pub trait AppInventory: Send + Sync {
    /// Lists installed applications.
    async fn installed_apps(&self) -> Result<Vec<InstalledApp>, AdapterError>;
}

/// Host update status, as seen by the state collector.
#[async_trait]
pub trait UpdateStatusSource: Send + Sync {
    /// Queries the current update status.
    async fn update_status(&self) -> Result<Status, AdapterError>;
}

/// Gathers device state for reporting.
pub struct Collector {
    apps: Arc<dyn AppInventory>,
    updates: Arc<dyn UpdateStatusSource>,
    root_path: PathBuf,
    battery_paths: Vec<PathBuf>,
    last_error: Mutex<String>,
}

impl Collector {
    /// Creates a collector over the given host probes.
    pub fn new(apps: Arc<dyn AppInventory>, updates: Arc<dyn UpdateStatusSource>) -> Self {
        Self {
            apps,
            updates,
            root_path: PathBuf::from("/"),
            battery_paths: DEFAULT_BATTERY_PATHS.iter().map(PathBuf::from).collect(),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Overrides the filesystem measured for disk usage, for tests.
    #[must_use]
    pub fn with_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_path = path.into();
        self
    }

    /// Overrides the battery capacity nodes, for tests.
    #[must_use]
    pub fn with_battery_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.battery_paths = paths;
        self
    }

    /// Records the last operational error for the next heartbeat.
    ///
    /// Written by any failing loop and read at snapshot time; a racy read
    /// is fine because the field exists only for human diagnosis.
    pub fn set_last_error(&self, message: impl Into<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = message.into();
    }

    /// Clears the sticky last error after a successful tick.
    pub fn clear_last_error(&self) {
        self.set_last_error(String::new());
    }

    /// Returns the sticky last error, empty when healthy.
    #[must_use]
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Collects the current device state.
    pub async fn snapshot(&self) -> DeviceState {
        let mut state = DeviceState {
            timestamp: Utc::now(),
            last_error: self.last_error(),
            ..DeviceState::default()
        };

        match self.apps.installed_apps().await {
            Ok(installed) => state.installed_apps = installed,
            Err(err) => warn!(error = %err, "failed to list apps"),
        }

        match disk_usage(&self.root_path) {
            Ok((total, free)) => {
                state.disk_total_bytes = total;
                state.disk_free_bytes = free;
            },
            Err(err) => warn!(error = %err, "disk usage lookup failed"),
        }

        match self.updates.update_status().await {
            Ok(status) => {
                state.update_status = if status.reboot_required {
                    "reboot_required".to_string()
                } else {
                    status.state
                };
            },
            Err(err) => warn!(error = %err, "update status failed"),
        }

        if let Some(percent) = battery_percent(&self.battery_paths) {
            state.battery_percent = percent;
        }

        state
    }
}

/// Returns `(total, free)` bytes for the filesystem holding `path`.
fn disk_usage(path: &std::path::Path) -> Result<(u64, u64), AdapterError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| AdapterError::io("statvfs", std::io::Error::from(e)))?;
    let block_size = u64::from(stat.fragment_size());
    let total = u64::from(stat.blocks()) * block_size;
    let free = u64::from(stat.blocks_available()) * block_size;
    Ok((total, free))
}

/// Reads the first readable battery capacity node.
fn battery_percent(paths: &[PathBuf]) -> Option<f64> {
    for path in paths {
        let Ok(data) = std::fs::read_to_string(path) else {
            continue;
        };
        match data.trim().parse::<f64>() {
            Ok(value) => return Some(value),
            Err(_) => return None,
        }
    }
    None
}
