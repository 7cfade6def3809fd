//! Device enrollment and credential persistence.
//!
//! Enrollment runs once, before any loop exists, and resolves in this
//! order: an existing credential file, an out-of-band handoff file, and
//! finally the enroll endpoint fed with hardware facts. The credential
//! file also carries the last persisted policy envelope so the store and
//! the cache rotate together.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{ApiError, Client, EnrollDeviceRequest, PolicyEnvelope};
use crate::config::Config;
use crate::fs_safe::{self, FsError};
use crate::hardware;

const ENROLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from enrollment and credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    /// The credential or handoff file could not be read or written.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// A stored file exists but does not decode.
    #[error("decode {what}: {source}")]
    Decode {
        /// Which file was malformed.
        what: &'static str,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The handoff file is present but lacks an id or token.
    #[error("enrollment handoff missing credentials")]
    IncompleteHandoff,

    /// The enroll endpoint rejected the request or was unreachable.
    #[error("enroll device: {0}")]
    Api(#[from] ApiError),

    /// The enroll endpoint did not answer within the enrollment timeout.
    #[error("enroll device: timed out after {ENROLL_TIMEOUT:?}")]
    Timeout,
}

/// The durable device identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Device identifier issued by the control plane.
    #[serde(default)]
    pub device_id: String,
    /// Bearer token for authenticated requests.
    #[serde(default)]
    pub device_token: String,
    /// Version of the last persisted policy.
    #[serde(default)]
    pub policy_version: String,
}

/// On-disk layout of the credential file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default)]
    credentials: Credentials,
    #[serde(default)]
    policy: PolicyEnvelope,
}

/// On-disk layout of the enrollment handoff file.
#[derive(Debug, Deserialize)]
struct HandoffFile {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_token: String,
    #[serde(default)]
    policy: PolicyEnvelope,
}

/// Handles enrollment and credential persistence.
pub struct EnrollManager {
    client: Client,
    credentials_path: PathBuf,
    handoff_path: Option<PathBuf>,
    pre_shared_key: String,
}

impl EnrollManager {
    /// Creates a manager from configuration.
    pub fn new(config: &Config, client: Client) -> Self {
        Self {
            client,
            credentials_path: config.device_token_path.clone(),
            handoff_path: config.enrollment.config_path.clone(),
            pre_shared_key: config.enrollment.pre_shared_key.clone(),
        }
    }

    /// Ensures the device holds credentials, enrolling if necessary.
    ///
    /// Returns the credentials plus the initial policy envelope (which
    /// may be empty when no policy has ever been stored).
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError`] when no credential source yields a usable
    /// identity.
    pub async fn ensure_enrollment(&self) -> Result<(Credentials, PolicyEnvelope), EnrollError> {
        if let Some(stored) = self.load_credentials()? {
            if !stored.credentials.device_token.is_empty() {
                return Ok((stored.credentials, stored.policy));
            }
        }

        if let Some(handoff) = self.load_handoff()? {
            let credentials = Credentials {
                device_id: handoff.device_id,
                device_token: handoff.device_token,
                policy_version: handoff.policy.version.clone(),
            };
            self.persist(&credentials, &handoff.policy)?;
            self.clear_handoff()?;
            info!(device_id = %credentials.device_id, "adopted enrollment handoff");
            return Ok((credentials, handoff.policy));
        }

        let facts = hardware::collect_facts();
        let request = EnrollDeviceRequest {
            serial: facts.serial,
            model: facts.model,
            cpu_model: facts.cpu_model,
            cpu_count: facts.cpu_count,
            total_ram_bytes: facts.total_ram_bytes,
            has_tpm: facts.has_tpm,
            pre_shared_key: self.pre_shared_key.clone(),
        };
        let response = tokio::time::timeout(ENROLL_TIMEOUT, self.client.enroll_device(&request))
            .await
            .map_err(|_| EnrollError::Timeout)??;

        let credentials = Credentials {
            device_id: response.device_id,
            device_token: response.device_token,
            policy_version: response.policy.version.clone(),
        };
        self.persist(&credentials, &response.policy)?;
        info!(device_id = %credentials.device_id, "device enrolled");
        Ok((credentials, response.policy))
    }

    /// Persists credentials and the matching policy envelope in one
    /// atomic write.
    ///
    /// Token rotation goes through here so the stored token and the
    /// stored envelope can never diverge.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError::Fs`] when the write fails.
    pub fn persist(
        &self,
        credentials: &Credentials,
        envelope: &PolicyEnvelope,
    ) -> Result<(), EnrollError> {
        let stored = StoredCredentials {
            credentials: credentials.clone(),
            policy: envelope.clone(),
        };
        fs_safe::atomic_write_json(&self.credentials_path, &stored)?;
        Ok(())
    }

    fn load_credentials(&self) -> Result<Option<StoredCredentials>, EnrollError> {
        let Some(data) = fs_safe::read_optional(&self.credentials_path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| EnrollError::Decode {
                what: "credentials",
                source,
            })
    }

    fn load_handoff(&self) -> Result<Option<HandoffFile>, EnrollError> {
        let Some(path) = &self.handoff_path else {
            return Ok(None);
        };
        let Some(data) = fs_safe::read_optional(path)? else {
            return Ok(None);
        };
        let handoff: HandoffFile =
            serde_json::from_slice(&data).map_err(|source| EnrollError::Decode {
                what: "enrollment handoff",
                source,
            })?;
        if handoff.device_id.is_empty() || handoff.device_token.is_empty() {
            return Err(EnrollError::IncompleteHandoff);
        }
        Ok(Some(handoff))
    }

    fn clear_handoff(&self) -> Result<(), EnrollError> {
        if let Some(path) = &self.handoff_path {
            fs_safe::remove_if_exists(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path, handoff: Option<PathBuf>) -> Config {
        Config {
            backend_url: "http://127.0.0.1:9".to_string(),
            device_token_path: dir.join("credentials.json"),
            enrollment: crate::config::Enrollment {
                pre_shared_key: String::new(),
                config_path: handoff,
            },
            ..Config::default()
        }
    }

    fn manager_in(dir: &std::path::Path, handoff: Option<PathBuf>) -> EnrollManager {
        let config = config_in(dir, handoff);
        let client = Client::new(&config.backend_url).unwrap();
        EnrollManager::new(&config, client)
    }

    fn envelope(version: &str) -> PolicyEnvelope {
        PolicyEnvelope {
            version: version.to_string(),
            ..PolicyEnvelope::default()
        }
    }

    #[tokio::test]
    async fn existing_credentials_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), None);

        let credentials = Credentials {
            device_id: "d1".to_string(),
            device_token: "t1".to_string(),
            policy_version: "v1".to_string(),
        };
        manager.persist(&credentials, &envelope("v1")).unwrap();

        // The backend URL is unreachable, so success proves no network
        // call happened.
        let (loaded, policy) = manager.ensure_enrollment().await.unwrap();
        assert_eq!(loaded, credentials);
        assert_eq!(policy.version, "v1");
    }

    #[tokio::test]
    async fn handoff_is_adopted_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let handoff_path = dir.path().join("handoff.json");
        std::fs::write(
            &handoff_path,
            serde_json::json!({
                "device_id": "d1",
                "device_token": "t1",
                "policy": {"version": "v1", "signature": "", "policy": {}}
            })
            .to_string(),
        )
        .unwrap();

        let manager = manager_in(dir.path(), Some(handoff_path.clone()));
        let (credentials, policy) = manager.ensure_enrollment().await.unwrap();

        assert_eq!(credentials.device_id, "d1");
        assert_eq!(credentials.device_token, "t1");
        assert_eq!(credentials.policy_version, "v1");
        assert_eq!(policy.version, "v1");
        assert!(!handoff_path.exists(), "handoff must be consumed");

        // The credential file now answers by itself.
        let (again, _) = manager.ensure_enrollment().await.unwrap();
        assert_eq!(again, credentials);
    }

    #[tokio::test]
    async fn incomplete_handoff_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handoff_path = dir.path().join("handoff.json");
        std::fs::write(
            &handoff_path,
            serde_json::json!({"device_id": "d1", "device_token": ""}).to_string(),
        )
        .unwrap();

        let manager = manager_in(dir.path(), Some(handoff_path));
        let err = manager.ensure_enrollment().await.unwrap_err();
        assert!(matches!(err, EnrollError::IncompleteHandoff));
    }

    #[tokio::test]
    async fn empty_token_in_store_falls_through_to_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let handoff_path = dir.path().join("handoff.json");
        std::fs::write(
            &handoff_path,
            serde_json::json!({
                "device_id": "d2",
                "device_token": "t2",
                "policy": {"version": "v2", "signature": "", "policy": {}}
            })
            .to_string(),
        )
        .unwrap();

        let manager = manager_in(dir.path(), Some(handoff_path));
        manager
            .persist(&Credentials::default(), &PolicyEnvelope::default())
            .unwrap();

        let (credentials, _) = manager.ensure_enrollment().await.unwrap();
        assert_eq!(credentials.device_id, "d2");
    }

    #[tokio::test]
    async fn rotation_overwrites_token_and_policy_together() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), None);

        let mut credentials = Credentials {
            device_id: "d1".to_string(),
            device_token: "t1".to_string(),
            policy_version: "v1".to_string(),
        };
        manager.persist(&credentials, &envelope("v1")).unwrap();

        credentials.device_token = "t2".to_string();
        credentials.policy_version = "v2".to_string();
        manager.persist(&credentials, &envelope("v2")).unwrap();

        let (loaded, policy) = manager.ensure_enrollment().await.unwrap();
        assert_eq!(loaded.device_token, "t2");
        assert_eq!(loaded.policy_version, "v2");
        assert_eq!(policy.version, "v2");
    }

    #[tokio::test]
    async fn credential_file_is_owner_only() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), None);
        manager
            .persist(
                &Credentials {
                    device_token: "secret".to_string(),
                    ..Credentials::default()
                },
                &PolicyEnvelope::default(),
            )
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("credentials.json"))
            .unwrap()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
