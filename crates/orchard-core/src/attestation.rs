//! TPM-backed boot attestation.
//!
//! The orchestrator rate-limits quote capture to a minimum interval and
//! deduplicates submissions by a digest over the PCR values, so unchanged
//! evidence is never resubmitted. The TPM itself sits behind a trait; the
//! default host provider drives the tpm2-tools CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::adapters::{AdapterError, command_ok, command_stdout};
use crate::api::{ApiError, AttestBootRequest, AttestationEvidence, AttestationQuote, Client, Event};
use crate::hardware;

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60 * 60);
const NONCE_LEN: usize = 32;

/// Errors from attestation.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    /// The TPM provider failed to produce evidence.
    #[error("tpm: {0}")]
    Tpm(#[from] AdapterError),

    /// The control plane rejected or never received the evidence.
    #[error("submit attestation: {0}")]
    Api(#[from] ApiError),
}

/// One quote over a PCR bank.
#[derive(Debug, Clone)]
pub struct QuoteBlob {
    /// TPM specification version.
    pub version: String,
    /// Raw quote message.
    pub quote: Vec<u8>,
    /// Raw quote signature.
    pub signature: Vec<u8>,
}

/// Evidence captured from the TPM for one nonce.
#[derive(Debug, Clone, Default)]
pub struct TpmEvidence {
    /// Attestation key public blob.
    pub ak_public: Vec<u8>,
    /// Quotes over the PCR banks.
    pub quotes: Vec<QuoteBlob>,
    /// PCR index → hex digest.
    pub pcrs: BTreeMap<String, String>,
}

/// Host TPM access used by the orchestrator.
#[async_trait]
pub trait TpmProvider: Send + Sync {
    /// Whether a TPM device is present at all.
    fn is_present(&self) -> bool;

    /// Creates an attestation key and quotes the platform state against
    /// `nonce`.
    async fn quote(&self, nonce: &[u8]) -> Result<TpmEvidence, AdapterError>;
}

#[derive(Debug, Default)]
struct DedupState {
    last_digest: String,
    last_attempt: Option<DateTime<Utc>>,
}

/// Pluggable clock for interval gating.
pub type NowFn = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Orchestrates deduplicated quote capture and submission.
pub struct AttestationManager {
    tpm: Arc<dyn TpmProvider>,
    min_interval: Duration,
    now: NowFn,
    state: Mutex<DedupState>,
}

impl AttestationManager {
    /// Creates a manager over the given TPM provider.
    pub fn new(tpm: Arc<dyn TpmProvider>) -> Self {
        Self {
            tpm,
            min_interval: DEFAULT_MIN_INTERVAL,
            now: Box::new(Utc::now),
            state: Mutex::new(DedupState::default()),
        }
    }

    /// Overrides the minimum interval between attestation attempts.
    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Overrides the time source, for deterministic tests.
    #[must_use]
    pub fn with_now(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    /// Captures and submits boot evidence if due.
    ///
    /// Returns empty without error when no TPM is present, the minimum
    /// interval has not elapsed, or the PCR digest is unchanged since the
    /// last submission.
    pub async fn attest(
        &self,
        client: &Client,
        token: &str,
        device_id: &str,
    ) -> (Vec<Event>, Result<(), AttestError>) {
        if !self.tpm.is_present() {
            return (Vec::new(), Ok(()));
        }
        let now = (self.now)();
        if !self.ready(now) {
            return (Vec::new(), Ok(()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let evidence = match self.tpm.quote(&nonce).await {
            Ok(evidence) => evidence,
            Err(err) => {
                let event = Event::new(
                    "attestation.boot.failure",
                    serde_json::json!({"error": err.to_string()}),
                );
                return (vec![event], Err(AttestError::Tpm(err)));
            },
        };

        let digest = pcr_digest(&evidence.pcrs);
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if digest == state.last_digest {
                // Unchanged evidence; remember the attempt so the
                // interval gate still applies.
                state.last_attempt = Some(now);
                return (Vec::new(), Ok(()));
            }
        }

        let request = AttestBootRequest {
            device_id: device_id.to_string(),
            evidence: AttestationEvidence {
                nonce: BASE64.encode(nonce),
                ak_public: BASE64.encode(&evidence.ak_public),
                quotes: evidence
                    .quotes
                    .iter()
                    .map(|q| AttestationQuote {
                        version: q.version.clone(),
                        quote: BASE64.encode(&q.quote),
                        signature: BASE64.encode(&q.signature),
                    })
                    .collect(),
                pcrs: evidence.pcrs.clone(),
            },
        };

        if let Err(err) = client.attest_boot(token, &request).await {
            let event = Event::new(
                "attestation.boot.failure",
                serde_json::json!({"error": err.to_string()}),
            );
            return (vec![event], Err(AttestError::Api(err)));
        }

        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.last_digest = digest;
            state.last_attempt = Some(now);
        }

        let event = Event::new(
            "attestation.boot.success",
            serde_json::json!({
                "nonce": request.evidence.nonce,
                "quote_count": request.evidence.quotes.len(),
            }),
        );
        (vec![event], Ok(()))
    }

    fn ready(&self, now: DateTime<Utc>) -> bool {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(last) = state.last_attempt else {
            return true;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.min_interval
    }
}

/// Deterministic digest over PCR values: sorted `key=value;` segments,
/// SHA-256, hex-encoded. Empty input digests to the empty string.
#[must_use]
pub fn pcr_digest(pcrs: &BTreeMap<String, String>) -> String {
    if pcrs.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    for (key, value) in pcrs {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

/// TPM provider backed by the tpm2-tools CLI.
pub struct HostTpm;

#[async_trait]
impl TpmProvider for HostTpm {
    fn is_present(&self) -> bool {
        hardware::tpm_present()
    }

    async fn quote(&self, nonce: &[u8]) -> Result<TpmEvidence, AdapterError> {
        let dir = tempfile::tempdir().map_err(|e| AdapterError::io("create tpm workdir", e))?;
        let ek = path_str(dir.path(), "ek.ctx");
        let ak = path_str(dir.path(), "ak.ctx");
        let ak_pub = path_str(dir.path(), "ak.pub");
        let quote_msg = path_str(dir.path(), "quote.msg");
        let quote_sig = path_str(dir.path(), "quote.sig");

        command_ok("tpm2_createek", &["-c", &ek, "-G", "ecc", "-u", &path_str(dir.path(), "ek.pub")])
            .await?;
        command_ok(
            "tpm2_createak",
            &["-C", &ek, "-c", &ak, "-G", "ecc", "-g", "sha256", "-s", "ecdsa", "-u", &ak_pub],
        )
        .await?;
        command_ok(
            "tpm2_quote",
            &[
                "-c",
                &ak,
                "-l",
                "sha256:0,1,2,3,4,5,6,7",
                "-q",
                &hex::encode(nonce),
                "-m",
                &quote_msg,
                "-s",
                &quote_sig,
                "-g",
                "sha256",
            ],
        )
        .await?;
        let pcr_output = command_stdout("tpm2_pcrread", &["sha256"]).await?;

        let read = |name: &str, path: &str| {
            std::fs::read(path).map_err(|e| AdapterError::io(format!("read {name}"), e))
        };
        Ok(TpmEvidence {
            ak_public: read("ak.pub", &ak_pub)?,
            quotes: vec![QuoteBlob {
                version: "2.0".to_string(),
                quote: read("quote.msg", &quote_msg)?,
                signature: read("quote.sig", &quote_sig)?,
            }],
            pcrs: parse_pcrread_output(&pcr_output),
        })
    }
}

fn path_str(dir: &Path, name: &str) -> String {
    dir.join(name).display().to_string()
}

/// Parses `tpm2_pcrread sha256` output lines of the form
/// `  0 : 0x0123...`.
fn parse_pcrread_output(output: &str) -> BTreeMap<String, String> {
    let mut pcrs = BTreeMap::new();
    for line in output.lines() {
        let Some((index, value)) = line.split_once(':') else {
            continue;
        };
        let index = index.trim();
        if index.parse::<u32>().is_err() {
            continue;
        }
        let value = value.trim().trim_start_matches("0x");
        if value.is_empty() {
            continue;
        }
        pcrs.insert(index.to_string(), value.to_lowercase());
    }
    pcrs
}
