//! Local login auditing from the systemd journal.
//!
//! Polling model: each tick reads journal entries newer than the last
//! observed timestamp (or five minutes back on the first call), classifies
//! PAM/sshd messages into login events, and advances the cursor.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use tracing::debug;

use crate::adapters::{AdapterError, command_stdout};
use crate::api::Event;

const FIRST_POLL_LOOKBACK_MINUTES: i64 = 5;
const MAX_ENTRIES_PER_POLL: &str = "--lines=500";

static SUCCESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"session opened for user ([^\s(]+)").expect("success pattern should compile")
});

static FAILURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:authentication failure;[^\n]*user=(\S+)|Failed password for (?:invalid user )?(\S+))")
        .expect("failure pattern should compile")
});

/// Tails the host journal and emits classified login events.
pub struct LoginWatcher {
    journalctl: String,
    cursor: Mutex<Option<DateTime<Utc>>>,
}

impl Default for LoginWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginWatcher {
    /// Creates a watcher driving the system journalctl.
    #[must_use]
    pub fn new() -> Self {
        Self {
            journalctl: "journalctl".to_string(),
            cursor: Mutex::new(None),
        }
    }

    /// Overrides the journalctl binary, for tests.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.journalctl = program.into();
        self
    }

    /// Reads journal entries since the previous poll and emits login
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when the journal cannot be read.
    pub async fn collect(&self) -> Result<Vec<Event>, AdapterError> {
        let since = {
            let cursor = self
                .cursor
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cursor.unwrap_or_else(|| {
                Utc::now() - ChronoDuration::minutes(FIRST_POLL_LOOKBACK_MINUTES)
            })
        };

        let since_arg = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let output = command_stdout(
            &self.journalctl,
            &["--since", &since_arg, MAX_ENTRIES_PER_POLL, "--output=json"],
        )
        .await?;

        let mut events = Vec::new();
        let mut latest = since;
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry = match parse_journal_entry(line) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(detail) => {
                    debug!(error = %detail, "failed to parse journal entry");
                    continue;
                },
            };
            if entry.timestamp > latest {
                latest = entry.timestamp;
            }

            let mut payload = serde_json::Map::new();
            payload.insert("user".into(), entry.user.into());
            payload.insert("service".into(), entry.service.into());
            for (key, value) in entry.metadata {
                payload.insert(key, value.into());
            }
            events.push(Event::new(entry.event_type, serde_json::Value::Object(payload)));
        }

        if latest > since {
            let mut cursor = self
                .cursor
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if cursor.is_none_or(|current| latest > current) {
                *cursor = Some(latest);
            }
        }
        Ok(events)
    }
}

struct JournalEvent {
    timestamp: DateTime<Utc>,
    event_type: &'static str,
    user: String,
    service: String,
    metadata: BTreeMap<String, String>,
}

fn parse_journal_entry(line: &str) -> Result<Option<JournalEvent>, String> {
    let raw: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let timestamp = parse_timestamp(raw.get("__REALTIME_TIMESTAMP"))?;

    let message = raw
        .get("MESSAGE")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    if message.is_empty() {
        return Ok(None);
    }
    let Some((event_type, user, mut metadata)) = classify_message(message) else {
        return Ok(None);
    };

    let service = first_string(&raw, &["SYSLOG_IDENTIFIER", "_SYSTEMD_UNIT", "UNIT"])
        .unwrap_or("unknown")
        .to_string();
    if let Some(host) = first_string(&raw, &["_HOSTNAME"]) {
        metadata.insert("host".to_string(), host.to_string());
    }

    Ok(Some(JournalEvent {
        timestamp,
        event_type,
        user,
        service,
        metadata,
    }))
}

/// Journal timestamps are microseconds since the epoch, encoded as a
/// string or a bare number.
fn parse_timestamp(raw: Option<&serde_json::Value>) -> Result<DateTime<Utc>, String> {
    let micros = match raw {
        Some(serde_json::Value::String(s)) if !s.is_empty() => {
            s.parse::<i64>().map_err(|e| e.to_string())?
        },
        #[allow(clippy::cast_possible_truncation)]
        Some(serde_json::Value::Number(n)) => {
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).ok_or("timestamp out of range")?
        },
        _ => return Err("timestamp missing".to_string()),
    };
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| "timestamp out of range".to_string())
}

/// Classifies a journal message into a login event.
///
/// Returns the event type, the user, and failure metadata (`reason` plus
/// any `key=value` tokens from the message, minus `user` itself).
fn classify_message(message: &str) -> Option<(&'static str, String, BTreeMap<String, String>)> {
    if let Some(captures) = SUCCESS_PATTERN.captures(message) {
        let user = sanitize_user(captures.get(1).map_or("", |m| m.as_str()));
        return Some(("login.success", user, BTreeMap::new()));
    }
    if let Some(captures) = FAILURE_PATTERN.captures(message) {
        let user = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map_or("", |m| m.as_str());
        let mut metadata = extract_key_value_pairs(message);
        metadata.remove("user");
        metadata.insert("reason".to_string(), failure_reason(message).to_string());
        return Some(("login.failure", sanitize_user(user), metadata));
    }
    None
}

fn failure_reason(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("invalid user") {
        return "invalid_user";
    }
    if lower.contains("password") {
        return "bad_password";
    }
    "unknown"
}

/// Pulls `key=value` tokens out of a message, dropping empty values.
fn extract_key_value_pairs(message: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for part in message.split(' ') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim_matches(';').trim();
        let value = value.trim().trim_matches(';');
        if key.is_empty() || value.is_empty() {
            continue;
        }
        pairs.insert(key.to_string(), value.to_string());
    }
    pairs
}

fn sanitize_user(user: &str) -> String {
    let trimmed = user.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

fn first_string<'a>(raw: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| raw.get(key).and_then(serde_json::Value::as_str))
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn session_open_classifies_as_success() {
        let (event_type, user, metadata) =
            classify_message("pam_unix(gdm-password:session): session opened for user alice(uid=1000)")
                .unwrap();
        assert_eq!(event_type, "login.success");
        assert_eq!(user, "alice");
        assert!(metadata.is_empty());
    }

    #[test]
    fn auth_failure_extracts_user_and_metadata() {
        let message = "pam_unix(gdm-password:auth): authentication failure; logname= uid=0 \
                       euid=0 tty=:0 ruser= rhost=192.168.1.1 user=bob";
        let (event_type, user, metadata) = classify_message(message).unwrap();

        assert_eq!(event_type, "login.failure");
        assert_eq!(user, "bob");
        assert_eq!(metadata["reason"], "bad_password");
        assert_eq!(metadata["rhost"], "192.168.1.1");
        // The user key itself is not duplicated into metadata.
        assert!(!metadata.contains_key("user"));
        // Empty values like logname= are dropped.
        assert!(!metadata.contains_key("logname"));
    }

    #[test]
    fn failed_password_for_invalid_user() {
        let (event_type, user, metadata) =
            classify_message("Failed password for invalid user mallory from 10.0.0.5 port 2222 ssh2")
                .unwrap();
        assert_eq!(event_type, "login.failure");
        assert_eq!(user, "mallory");
        assert_eq!(metadata["reason"], "invalid_user");
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        assert!(classify_message("Started Session 3 of User alice.").is_none());
    }

    #[test]
    fn timestamp_parses_string_and_number() {
        let from_string =
            parse_timestamp(Some(&serde_json::json!("1700000000000000"))).unwrap();
        let from_number = parse_timestamp(Some(&serde_json::json!(1_700_000_000_000_000_i64))).unwrap();
        assert_eq!(from_string, from_number);
        assert_eq!(from_string.timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_timestamp_is_an_error() {
        assert!(parse_timestamp(None).is_err());
        assert!(parse_timestamp(Some(&serde_json::json!(""))).is_err());
    }

    #[test]
    fn journal_entry_builds_event_with_service_and_host() {
        let line = serde_json::json!({
            "__REALTIME_TIMESTAMP": "1700000000000000",
            "MESSAGE": "pam_unix(sshd:session): session opened for user alice(uid=1000)",
            "SYSLOG_IDENTIFIER": "sshd",
            "_HOSTNAME": "kiosk-7"
        })
        .to_string();

        let entry = parse_journal_entry(&line).unwrap().unwrap();
        assert_eq!(entry.event_type, "login.success");
        assert_eq!(entry.user, "alice");
        assert_eq!(entry.service, "sshd");
        assert_eq!(entry.metadata["host"], "kiosk-7");
    }

    #[test]
    fn non_login_entry_is_skipped() {
        let line = serde_json::json!({
            "__REALTIME_TIMESTAMP": "1700000000000000",
            "MESSAGE": "Reached target Multi-User System."
        })
        .to_string();
        assert!(parse_journal_entry(&line).unwrap().is_none());
    }

    fn fake_journalctl(dir: &std::path::Path, entries: &[serde_json::Value]) -> String {
        let data_file = dir.join("journal.ndjson");
        let body: String = entries
            .iter()
            .map(|e| format!("{e}\n"))
            .collect();
        std::fs::write(&data_file, body).unwrap();
        let script = dir.join("journalctl");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat {}\n", data_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[tokio::test]
    async fn collect_emits_events_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            serde_json::json!({
                "__REALTIME_TIMESTAMP": "1700000000000000",
                "MESSAGE": "pam_unix(sshd:session): session opened for user alice(uid=1000)",
                "SYSLOG_IDENTIFIER": "sshd"
            }),
            serde_json::json!({
                "__REALTIME_TIMESTAMP": "1700000060000000",
                "MESSAGE": "Failed password for bob from 10.0.0.9 port 22 ssh2",
                "SYSLOG_IDENTIFIER": "sshd"
            }),
        ];
        let watcher = LoginWatcher::new().with_program(fake_journalctl(dir.path(), &entries));

        let events = watcher.collect().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "login.success");
        assert_eq!(events[1].event_type, "login.failure");
        assert_eq!(events[1].payload["user"], "bob");

        let cursor = watcher.cursor.lock().unwrap().unwrap();
        assert_eq!(cursor, Utc.timestamp_micros(1_700_000_060_000_000).unwrap());
    }

    #[tokio::test]
    async fn missing_journalctl_is_an_error() {
        let watcher = LoginWatcher::new().with_program("/nonexistent/journalctl");
        assert!(watcher.collect().await.is_err());
    }
}
