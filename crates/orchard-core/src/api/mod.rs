//! Wire types shared with the control plane.
//!
//! These mirror the backend's JSON contract exactly; every field carries a
//! serde default so older servers that omit fields still decode.

mod client;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use client::{ApiError, Client};

/// Hardware facts submitted during enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollDeviceRequest {
    /// Chassis serial number, empty when unavailable.
    #[serde(default)]
    pub serial: String,
    /// Product model string.
    #[serde(default)]
    pub model: String,
    /// CPU model name.
    #[serde(default)]
    pub cpu_model: String,
    /// Logical CPU count.
    #[serde(default)]
    pub cpu_count: u32,
    /// Total RAM in bytes.
    #[serde(default)]
    pub total_ram_bytes: u64,
    /// Whether a TPM device is present.
    #[serde(default)]
    pub has_tpm: bool,
    /// Optional pre-shared enrollment key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pre_shared_key: String,
}

/// Returned after successful enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollDeviceResponse {
    /// Durable device identifier.
    #[serde(default)]
    pub device_id: String,
    /// Bearer token for all subsequent requests.
    #[serde(default)]
    pub device_token: String,
    /// Initial policy for the device, possibly empty.
    #[serde(default)]
    pub policy: PolicyEnvelope,
}

/// Signed container around a policy document.
///
/// The signature covers the canonical serialization of `policy` only; the
/// envelope itself is not signed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyEnvelope {
    /// Monotonically advancing policy version.
    #[serde(default)]
    pub version: String,
    /// Base64-encoded Ed25519 signature over the canonical policy bytes.
    #[serde(default)]
    pub signature: String,
    /// The policy document itself.
    #[serde(default)]
    pub policy: PolicyDocument,
    /// Replacement device token, present only when the server rotates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_token: Option<String>,
}

/// The five sub-policies enforced by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Required application set.
    #[serde(default)]
    pub apps: AppsPolicy,
    /// OS image channel and reboot scheduling.
    #[serde(default)]
    pub updates: UpdatePolicy,
    /// Managed browser configuration.
    #[serde(default)]
    pub browser: BrowserPolicy,
    /// Managed network profiles.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Security service controls.
    #[serde(default)]
    pub security: SecurityPolicy,
}

/// Required application set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppsPolicy {
    /// Applications that must be installed.
    #[serde(default)]
    pub required: Vec<AppDefinition>,
}

/// One required application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    /// Application identifier.
    #[serde(default)]
    pub id: String,
    /// Branch to install from.
    #[serde(default)]
    pub branch: String,
    /// Optional remote/source name.
    #[serde(default)]
    pub source: String,
}

/// OS update policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Desired image channel; empty leaves the channel unchanged.
    #[serde(default)]
    pub channel: String,
    /// Whether pending deployments should be rebooted into.
    #[serde(default)]
    pub reboot_required: bool,
    /// Maintenance window expressions (`"[DAYSPEC] HH:MM-HH:MM"`).
    #[serde(default)]
    pub maintenance_windows: Vec<String>,
}

/// Managed browser configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserPolicy {
    /// Homepage and forced startup URL.
    #[serde(default)]
    pub homepage: String,
    /// Force-installed extension identifiers.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Whether developer tools stay available.
    #[serde(default)]
    pub allow_dev_tools: bool,
    /// Bookmarks pinned under the managed folder.
    #[serde(default)]
    pub managed_bookmarks: Vec<Bookmark>,
}

/// A managed bookmark entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Target URL.
    #[serde(default)]
    pub url: String,
}

/// Managed network profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Managed Wi-Fi networks.
    #[serde(default)]
    pub wifi: Vec<WifiNetwork>,
    /// Managed VPN profiles.
    #[serde(default)]
    pub vpns: Vec<VpnProfile>,
    /// DNS servers forced onto every VPN profile.
    #[serde(default)]
    pub vpn_dns: Vec<String>,
}

/// One managed Wi-Fi network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    /// Network SSID.
    #[serde(default)]
    pub ssid: String,
    /// Pre-shared passphrase for PSK networks.
    #[serde(default)]
    pub passphrase: String,
    /// Key management scheme (defaults to `wpa-psk`).
    #[serde(default)]
    pub security: String,
    /// Whether the SSID is hidden.
    #[serde(default)]
    pub hidden: bool,
    /// Whether the connection is metered.
    #[serde(default)]
    pub metered: bool,
    /// Extra 802.1x settings for EAP networks.
    #[serde(default)]
    pub eap: std::collections::BTreeMap<String, String>,
}

/// One managed VPN profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnProfile {
    /// Profile name.
    #[serde(default)]
    pub name: String,
    /// NetworkManager VPN service type.
    #[serde(default)]
    pub service_type: String,
    /// VPN data section key/values.
    #[serde(default)]
    pub data: std::collections::BTreeMap<String, String>,
    /// VPN secrets section key/values.
    #[serde(default)]
    pub secrets: std::collections::BTreeMap<String, String>,
    /// Whether the profile auto-connects.
    #[serde(default)]
    pub auto_connect: bool,
}

/// Security service controls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Whether SELinux runs in enforcing mode.
    #[serde(default)]
    pub selinux_enforce: bool,
    /// Whether the SSH service is enabled.
    #[serde(default)]
    pub ssh_enabled: bool,
    /// Whether USBGuard is enabled.
    #[serde(default)]
    pub usbguard: bool,
    /// USBGuard rule lines written when enabled.
    #[serde(default)]
    pub usbguard_rules: Vec<String>,
    /// Whether root may log in over SSH.
    #[serde(default)]
    pub allow_root_login: bool,
}

/// Request body for the policy pull endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullPolicyRequest {
    /// Version the device currently runs; the server answers 304 when it
    /// is still current.
    #[serde(default)]
    pub current_version: String,
}

/// Request body for state reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStateRequest {
    /// Device identifier.
    #[serde(default)]
    pub device_id: String,
    /// The snapshot being reported.
    #[serde(default)]
    pub state: DeviceState,
}

/// One device-state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Snapshot time (UTC).
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    /// Installed application inventory.
    #[serde(default)]
    pub installed_apps: Vec<InstalledApp>,
    /// Host update state, `reboot_required` when a deployment is staged.
    #[serde(default)]
    pub update_status: String,
    /// Total disk bytes on the root filesystem.
    #[serde(default)]
    pub disk_total_bytes: u64,
    /// Free disk bytes on the root filesystem.
    #[serde(default)]
    pub disk_free_bytes: u64,
    /// Battery charge percentage, zero on battery-less hosts.
    #[serde(default)]
    pub battery_percent: f64,
    /// Sticky last operational error, empty when healthy.
    #[serde(default)]
    pub last_error: String,
}

/// One installed application as reported by the host inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstalledApp {
    /// Application identifier.
    #[serde(default)]
    pub id: String,
    /// Installed version (commit).
    #[serde(default)]
    pub version: String,
    /// Installed branch.
    #[serde(default)]
    pub branch: String,
}

/// An event emitted by a reconciler or loop, never mutated after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Queue-unique identifier.
    #[serde(default)]
    pub id: String,
    /// Dotted event type (`policy.apply.success`, `login.failure`, ...).
    #[serde(default, rename = "type")]
    pub event_type: String,
    /// Wall-clock creation time (UTC).
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    /// Free-form payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates an event stamped with a fresh id and the current UTC time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Request body for event batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportEventsRequest {
    /// Device identifier.
    #[serde(default)]
    pub device_id: String,
    /// Events in insertion order.
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Request body for boot attestation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestBootRequest {
    /// Device identifier.
    #[serde(default)]
    pub device_id: String,
    /// Attestation evidence for the current boot.
    #[serde(default)]
    pub evidence: AttestationEvidence,
}

/// TPM attestation material, byte fields base64-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationEvidence {
    /// Base64 of the 32-byte random nonce.
    #[serde(default)]
    pub nonce: String,
    /// Base64 of the attestation key public blob.
    #[serde(default)]
    pub ak_public: String,
    /// Quotes over the PCR banks.
    #[serde(default)]
    pub quotes: Vec<AttestationQuote>,
    /// PCR index → hex digest.
    #[serde(default)]
    pub pcrs: std::collections::BTreeMap<String, String>,
}

/// A single TPM quote and its signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationQuote {
    /// TPM specification version.
    #[serde(default)]
    pub version: String,
    /// Base64 of the quote blob.
    #[serde(default)]
    pub quote: String,
    /// Base64 of the quote signature.
    #[serde(default)]
    pub signature: String,
}
