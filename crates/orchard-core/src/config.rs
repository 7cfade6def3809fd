//! Agent configuration.
//!
//! The configuration file is a JSON document (the strict subset of YAML
//! that equals JSON, so `.yaml` deployments stay valid). It is loaded once
//! at startup, validated, and never reloaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Path that was being read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("parse config: {0}")]
    Parse(#[source] serde_json::Error),

    /// A required string field is missing or empty.
    #[error("{field} is required")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A required interval is zero or unset.
    #[error("intervals.{field} must be greater than zero")]
    ZeroInterval {
        /// Name of the offending interval.
        field: &'static str,
    },
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the control plane.
    #[serde(default)]
    pub backend_url: String,

    /// Path of the credential store (device id + token + cached policy).
    #[serde(default)]
    pub device_token_path: PathBuf,

    /// Path of the verified-policy cache.
    #[serde(default)]
    pub policy_cache_path: PathBuf,

    /// Path of the durable event queue.
    #[serde(default)]
    pub event_queue_path: PathBuf,

    /// Path of the durable state-snapshot queue.
    #[serde(default)]
    pub state_queue_path: PathBuf,

    /// Path of the pinned Ed25519 policy signing key (PEM or raw bytes).
    #[serde(default)]
    pub policy_public_key: PathBuf,

    /// Enrollment settings.
    #[serde(default)]
    pub enrollment: Enrollment,

    /// Loop intervals and retry tuning.
    #[serde(default)]
    pub intervals: Intervals,

    /// Logging settings.
    #[serde(default)]
    pub logging: Logging,
}

/// Enrollment-specific settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Enrollment {
    /// Optional pre-shared key presented to the enroll endpoint.
    #[serde(default)]
    pub pre_shared_key: String,

    /// Optional out-of-band enrollment handoff file, consumed once.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// Intervals for the background loops.
///
/// Each value accepts a humantime string (`"5m"`, `"150s"`) or a bare
/// number of seconds (fractions allowed).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Intervals {
    /// How often policy is pulled from the control plane.
    #[serde(default, with = "flexible_duration")]
    pub policy_poll: Duration,

    /// How often a device-state snapshot is reported.
    #[serde(default, with = "flexible_duration")]
    pub state_report: Duration,

    /// How often the event queue is flushed.
    #[serde(default, with = "flexible_duration")]
    pub event_flush: Duration,

    /// Initial backoff after a failed loop tick.
    #[serde(default, with = "flexible_duration")]
    pub retry_backoff: Duration,

    /// Upper bound on the exponential backoff.
    #[serde(default, with = "flexible_duration")]
    pub retry_max_delay: Duration,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Logging {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default)]
    pub level: String,
}

impl Config {
    /// Loads configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(ConfigError::Parse)
    }

    /// Validates that all required fields are present.
    ///
    /// # Errors
    ///
    /// Returns the first missing field or zero interval found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, bool); 6] = [
            ("backend_url", self.backend_url.is_empty()),
            ("device_token_path", self.device_token_path.as_os_str().is_empty()),
            ("policy_cache_path", self.policy_cache_path.as_os_str().is_empty()),
            ("event_queue_path", self.event_queue_path.as_os_str().is_empty()),
            ("state_queue_path", self.state_queue_path.as_os_str().is_empty()),
            ("policy_public_key", self.policy_public_key.as_os_str().is_empty()),
        ];
        for (field, missing) in required {
            if missing {
                return Err(ConfigError::MissingField { field });
            }
        }

        let intervals: [(&'static str, Duration); 3] = [
            ("policy_poll", self.intervals.policy_poll),
            ("state_report", self.intervals.state_report),
            ("event_flush", self.intervals.event_flush),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval { field });
            }
        }
        Ok(())
    }
}

/// Serde adapter accepting either a humantime string or a number of
/// seconds.
pub(crate) mod flexible_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
            Raw::Seconds(secs) => {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(serde::de::Error::custom(format!(
                        "invalid duration seconds: {secs}"
                    )));
                }
                Ok(Duration::from_secs_f64(secs))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "backend_url": "https://control.example.com",
            "device_token_path": "/var/lib/orchard/credentials.json",
            "policy_cache_path": "/var/lib/orchard/policy.json",
            "event_queue_path": "/var/lib/orchard/events.json",
            "state_queue_path": "/var/lib/orchard/state.json",
            "policy_public_key": "/etc/orchard/policy.pub",
            "intervals": {
                "policy_poll": "5m",
                "state_report": "10m",
                "event_flush": "1m",
                "retry_backoff": "5s",
                "retry_max_delay": "2m"
            },
            "logging": {"level": "info"}
        })
    }

    #[test]
    fn parses_complete_config() {
        let cfg: Config = serde_json::from_value(minimal_json()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.intervals.policy_poll, Duration::from_secs(300));
        assert_eq!(cfg.intervals.retry_max_delay, Duration::from_secs(120));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn duration_accepts_seconds_string() {
        let cfg: Intervals =
            serde_json::from_value(serde_json::json!({"policy_poll": "150s"})).unwrap();
        assert_eq!(cfg.policy_poll, Duration::from_secs(150));
    }

    #[test]
    fn duration_accepts_fractional_number_of_seconds() {
        let cfg: Intervals =
            serde_json::from_value(serde_json::json!({"policy_poll": 1.5})).unwrap();
        assert_eq!(cfg.policy_poll, Duration::from_millis(1500));
    }

    #[test]
    fn duration_rejects_negative_number() {
        let result: Result<Intervals, _> =
            serde_json::from_value(serde_json::json!({"policy_poll": -3}));
        assert!(result.is_err());
    }

    #[test]
    fn validate_requires_state_queue_path() {
        let mut json = minimal_json();
        json["state_queue_path"] = serde_json::json!("");
        let cfg: Config = serde_json::from_value(json).unwrap();

        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "state_queue_path"
            }
        ));
    }

    #[test]
    fn validate_rejects_zero_event_flush() {
        let mut json = minimal_json();
        json["intervals"]["event_flush"] = serde_json::json!(0);
        let cfg: Config = serde_json::from_value(json).unwrap();

        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroInterval {
                field: "event_flush"
            }
        ));
    }

    #[test]
    fn retry_intervals_may_be_omitted() {
        let mut json = minimal_json();
        json["intervals"]
            .as_object_mut()
            .unwrap()
            .remove("retry_backoff");
        json["intervals"]
            .as_object_mut()
            .unwrap()
            .remove("retry_max_delay");
        let cfg: Config = serde_json::from_value(json).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.intervals.retry_backoff.is_zero());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, serde_json::to_vec(&minimal_json()).unwrap()).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.backend_url, "https://control.example.com");
    }

    #[test]
    fn load_missing_file_errors() {
        let err = Config::load("/nonexistent/agent.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
