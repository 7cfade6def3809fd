//! Host-facing reconcilers.
//!
//! Each adapter maps one sub-policy onto host state and reports what it
//! did as events. Adapters are idempotent: the control plane is the source
//! of truth and re-applying the same policy converges to the same host
//! state.

pub mod apps;
pub mod browser;
pub mod network;
pub mod security;
pub mod updates;

use std::process::Output;

use tokio::process::Command;

use crate::api::Event;
use crate::fs_safe::FsError;

/// Errors from host-facing reconcilers.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The required host command is not installed.
    #[error("{program} not available")]
    CommandMissing {
        /// The missing program.
        program: String,
    },

    /// A host command ran but exited unsuccessfully.
    #[error("{program} failed: {detail}")]
    CommandFailed {
        /// The failing program.
        program: String,
        /// Trimmed stderr/stdout of the failure.
        detail: String,
    },

    /// A host command produced output the adapter cannot interpret.
    #[error("parse {program} output: {detail}")]
    OutputParse {
        /// The program whose output failed to parse.
        program: String,
        /// What was wrong with it.
        detail: String,
    },

    /// A policy element cannot be enforced as written.
    #[error("invalid policy: {detail}")]
    InvalidPolicy {
        /// What was wrong with it.
        detail: String,
    },

    /// A bounded wait on the host expired.
    #[error("{context}")]
    Timeout {
        /// What was being waited for.
        context: String,
    },

    /// Plain filesystem I/O outside the atomic-write discipline.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A managed file could not be written atomically.
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl AdapterError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The result of applying one sub-policy: the events generated so far and
/// whether enforcement ran to completion.
///
/// Events are populated even when `result` is an error, so a failure
/// partway through still reports the items that did reconcile.
#[derive(Debug)]
pub struct AdapterOutcome {
    /// Events generated by this application, in order.
    pub events: Vec<Event>,
    /// Overall success or the failure that stopped enforcement.
    pub result: Result<(), AdapterError>,
}

impl AdapterOutcome {
    /// An outcome that ran to completion.
    #[must_use]
    pub fn success(events: Vec<Event>) -> Self {
        Self {
            events,
            result: Ok(()),
        }
    }

    /// An outcome that stopped at `error` after generating `events`.
    #[must_use]
    pub fn failure(events: Vec<Event>, error: AdapterError) -> Self {
        Self {
            events,
            result: Err(error),
        }
    }
}

/// Runs a host command to completion, capturing output.
///
/// The child is killed if the future is dropped, so a cancelled loop tick
/// does not leave stray processes behind. A missing binary maps to
/// [`AdapterError::CommandMissing`].
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<Output, AdapterError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdapterError::CommandMissing {
                    program: program.to_string(),
                }
            } else {
                AdapterError::io(format!("spawn {program}"), e)
            }
        })?;
    Ok(output)
}

/// Runs a host command and returns its stdout, failing on a non-zero
/// exit.
pub(crate) async fn command_stdout(program: &str, args: &[&str]) -> Result<String, AdapterError> {
    let output = run_command(program, args).await?;
    if !output.status.success() {
        return Err(AdapterError::CommandFailed {
            program: program.to_string(),
            detail: combined_detail(&output),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a host command for its side effect, failing on a non-zero exit.
pub(crate) async fn command_ok(program: &str, args: &[&str]) -> Result<(), AdapterError> {
    let output = run_command(program, args).await?;
    if !output.status.success() {
        return Err(AdapterError::CommandFailed {
            program: program.to_string(),
            detail: combined_detail(&output),
        });
    }
    Ok(())
}

fn combined_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let detail = detail.trim();
    if detail.is_empty() {
        format!("exit status {:?}", output.status.code())
    } else {
        detail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_maps_to_command_missing() {
        let err = run_command("orchard-no-such-binary", &[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::CommandMissing { .. }));
    }

    #[tokio::test]
    async fn failing_command_carries_detail() {
        let err = command_ok("sh", &["-c", "echo boom >&2; exit 7"])
            .await
            .unwrap_err();
        match err {
            AdapterError::CommandFailed { program, detail } => {
                assert_eq!(program, "sh");
                assert_eq!(detail, "boom");
            },
            other => panic!("expected CommandFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn stdout_is_captured() {
        let out = command_stdout("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
