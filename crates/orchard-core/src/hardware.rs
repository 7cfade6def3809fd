//! Best-effort hardware facts for enrollment.
//!
//! Everything here reads sysfs/procfs nodes that may be absent on a given
//! host; missing facts degrade to empty values rather than failing
//! enrollment.

use std::path::Path;

/// Immutable device facts exchanged for an identity at enrollment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareFacts {
    /// Chassis serial number.
    pub serial: String,
    /// Product model string.
    pub model: String,
    /// CPU model name.
    pub cpu_model: String,
    /// Logical CPU count.
    pub cpu_count: u32,
    /// Total RAM in bytes.
    pub total_ram_bytes: u64,
    /// Whether a TPM device node is present.
    pub has_tpm: bool,
}

/// Collects hardware facts from the host.
#[must_use]
pub fn collect_facts() -> HardwareFacts {
    HardwareFacts {
        serial: read_first_line(Path::new("/sys/class/dmi/id/product_serial")),
        model: read_first_line(Path::new("/sys/class/dmi/id/product_name")),
        cpu_model: cpu_model_name(Path::new("/proc/cpuinfo")),
        cpu_count: cpu_count(),
        total_ram_bytes: total_ram_bytes(Path::new("/proc/meminfo")),
        has_tpm: tpm_present(),
    }
}

/// Whether a TPM character device is exposed by the kernel.
#[must_use]
pub fn tpm_present() -> bool {
    Path::new("/dev/tpmrm0").exists() || Path::new("/dev/tpm0").exists()
}

fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

fn read_first_line(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|data| data.lines().next().map(|line| line.trim().to_string()))
        .unwrap_or_default()
}

fn cpu_model_name(cpuinfo: &Path) -> String {
    let Ok(data) = std::fs::read_to_string(cpuinfo) else {
        return std::env::consts::ARCH.to_string();
    };
    for line in data.lines() {
        if line.to_lowercase().starts_with("model name") {
            if let Some((_, value)) = line.split_once(':') {
                return value.trim().to_string();
            }
        }
    }
    std::env::consts::ARCH.to_string()
}

fn total_ram_bytes(meminfo: &Path) -> u64 {
    let Ok(data) = std::fs::read_to_string(meminfo) else {
        return 0;
    };
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kib * 1024;
        }
    }
    0
}
