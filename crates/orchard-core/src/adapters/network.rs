//! Managed NetworkManager profiles.
//!
//! One keyfile per Wi-Fi SSID and per VPN name, written into the managed
//! connections directory. Files in that directory that no longer match
//! any policy entry are removed so stale profiles cannot linger.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{AdapterError, AdapterOutcome};
use crate::api::{Event, NetworkPolicy, VpnProfile, WifiNetwork};
use crate::fs_safe;
use crate::policy::NetworkAdapter;

const DEFAULT_CONNECTIONS_DIR: &str = "/etc/NetworkManager/system-connections";
const KEYFILE_EXTENSION: &str = "nmconnection";

/// Writes managed network keyfiles.
pub struct NetworkManager {
    output_dir: PathBuf,
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager {
    /// Creates a manager writing into the default connections directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_CONNECTIONS_DIR),
        }
    }

    /// Overrides the managed connections directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Enforces Wi-Fi and VPN profiles, then sweeps orphans.
    pub fn apply(&self, policy: &NetworkPolicy) -> AdapterOutcome {
        if let Err(err) = fs_safe::ensure_dir(&self.output_dir, 0o700) {
            return AdapterOutcome::failure(Vec::new(), AdapterError::Fs(err));
        }

        let mut events = Vec::new();
        let mut managed: HashSet<PathBuf> = HashSet::new();

        for wifi in &policy.wifi {
            let path = self.profile_path(&wifi.ssid);
            match fs_safe::atomic_write_mode(&path, render_wifi_keyfile(wifi).as_bytes(), 0o600, 0o700)
            {
                Ok(()) => {
                    info!(ssid = %wifi.ssid, path = %path.display(), "updated wifi profile");
                    events.push(Event::new(
                        "network.profile.success",
                        serde_json::json!({"ssid": wifi.ssid}),
                    ));
                    managed.insert(path);
                },
                Err(err) => {
                    error!(ssid = %wifi.ssid, error = %err, "failed to write wifi profile");
                    events.push(Event::new(
                        "network.profile.failure",
                        serde_json::json!({"ssid": wifi.ssid, "error": err.to_string()}),
                    ));
                },
            }
        }

        for vpn in &policy.vpns {
            let path = self.profile_path(&vpn.name);
            let keyfile = render_vpn_keyfile(vpn, &policy.vpn_dns);
            match fs_safe::atomic_write_mode(&path, keyfile.as_bytes(), 0o600, 0o700) {
                Ok(()) => {
                    info!(name = %vpn.name, path = %path.display(), "updated vpn profile");
                    events.push(Event::new(
                        "network.vpn.success",
                        serde_json::json!({"name": vpn.name}),
                    ));
                    managed.insert(path);
                },
                Err(err) => {
                    error!(name = %vpn.name, error = %err, "failed to write vpn profile");
                    events.push(Event::new(
                        "network.vpn.failure",
                        serde_json::json!({"name": vpn.name, "error": err.to_string()}),
                    ));
                },
            }
        }

        self.sweep_orphans(&managed);
        AdapterOutcome::success(events)
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{KEYFILE_EXTENSION}", sanitize_name(name)))
    }

    fn sweep_orphans(&self, managed: &HashSet<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(&self.output_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            if path.extension().is_none_or(|ext| ext != KEYFILE_EXTENSION) {
                continue;
            }
            if managed.contains(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed stale network profile"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove stale network profile");
                },
            }
        }
    }
}

#[async_trait]
impl NetworkAdapter for NetworkManager {
    async fn apply_network(&self, policy: &NetworkPolicy) -> AdapterOutcome {
        self.apply(policy)
    }
}

/// Makes a profile name safe for use as a filename.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '=' => '_',
            other => other,
        })
        .collect()
}

fn render_wifi_keyfile(wifi: &WifiNetwork) -> String {
    let security = if wifi.security.is_empty() {
        "wpa-psk".to_string()
    } else {
        wifi.security.to_lowercase()
    };
    let is_eap = security.contains("eap");

    let mut out = String::new();
    out.push_str("[connection]\n");
    let _ = writeln!(out, "id={}", wifi.ssid);
    out.push_str("type=wifi\ninterface-name=\npermissions=\n");
    if wifi.metered {
        out.push_str("metered=2\n");
    }
    if wifi.hidden {
        out.push_str("autoconnect=false\n");
    }
    out.push('\n');

    out.push_str("[wifi]\n");
    let _ = writeln!(out, "ssid={}", wifi.ssid);
    out.push_str("mode=infrastructure\n");
    let _ = writeln!(out, "hidden={}\n", wifi.hidden);

    out.push_str("[wifi-security]\n");
    let _ = writeln!(out, "key-mgmt={security}");
    if is_eap {
        out.push_str("auth-alg=open\n");
        for (key, value) in &wifi.eap {
            if key.to_lowercase().starts_with("password") {
                continue;
            }
            let _ = writeln!(out, "{}={value}", key.to_lowercase());
        }
    } else if !wifi.passphrase.is_empty() {
        let _ = writeln!(out, "psk={}", wifi.passphrase);
    }

    if !wifi.eap.is_empty() {
        out.push_str("\n[802-1x]\n");
        for (key, value) in &wifi.eap {
            let _ = writeln!(out, "{}={value}", key.to_lowercase());
        }
    }

    out.push_str("\n[ipv4]\nmethod=auto\n\n[ipv6]\nmethod=auto\n");
    out
}

fn render_vpn_keyfile(vpn: &VpnProfile, dns: &[String]) -> String {
    let service_type = if vpn.service_type.is_empty() {
        "org.freedesktop.NetworkManager.openvpn"
    } else {
        &vpn.service_type
    };

    let mut out = String::new();
    out.push_str("[connection]\n");
    let _ = writeln!(out, "id={}", vpn.name);
    out.push_str("type=vpn\ninterface-name=\npermissions=\n");
    if vpn.auto_connect {
        out.push_str("autoconnect=true\n");
    }
    out.push('\n');

    out.push_str("[vpn]\n");
    let _ = writeln!(out, "service-type={service_type}");
    for (key, value) in &vpn.data {
        let _ = writeln!(out, "{key}={value}");
    }

    if !vpn.secrets.is_empty() {
        out.push_str("\n[vpn-secrets]\n");
        for (key, value) in &vpn.secrets {
            let _ = writeln!(out, "{key}={value}");
        }
    }

    out.push_str("\n[ipv4]\nmethod=auto\n");
    if !dns.is_empty() {
        let _ = writeln!(out, "dns={}", dns.join(";"));
        out.push_str("ignore-auto-dns=true\n");
    }
    out.push_str("\n[ipv6]\nmethod=auto\n");
    if !dns.is_empty() {
        let _ = writeln!(out, "dns={}", dns.join(";"));
        out.push_str("ignore-auto-dns=true\n");
    }
    out
}
