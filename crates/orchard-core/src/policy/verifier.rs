//! Signature verification for policy envelopes.
//!
//! The control plane signs the canonical serialization of the policy
//! document (not the envelope) with a pinned Ed25519 key. The agent loads
//! the public half from a PEM `PUBLIC KEY` block or a raw 32-byte file and
//! refuses any other encoding. Verification runs before any reconciler
//! sees the policy.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};

use crate::api::{PolicyDocument, PolicyEnvelope};

/// DER prefix of an Ed25519 subject-public-key-info structure
/// (RFC 8410): SEQUENCE, algorithm id 1.3.101.112, BIT STRING header.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Errors from key loading and signature verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    /// The key file could not be read.
    #[error("read public key {path}: {source}")]
    ReadKey {
        /// Path that was being read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The key file is neither a PEM public-key block nor 32 raw bytes.
    #[error("unsupported public key encoding")]
    UnsupportedKeyEncoding,

    /// The PEM block decodes to something other than an Ed25519 key.
    #[error("public key is not an Ed25519 key")]
    WrongKeyAlgorithm,

    /// The key bytes do not form a valid curve point.
    #[error("invalid public key material")]
    InvalidKey,

    /// The envelope carries no signature.
    #[error("policy signature missing")]
    MissingSignature,

    /// The signature is not valid base64.
    #[error("decode signature: {0}")]
    DecodeSignature(#[source] base64::DecodeError),

    /// The decoded signature has the wrong length.
    #[error("malformed signature: expected 64 bytes, got {len}")]
    MalformedSignature {
        /// Actual decoded length.
        len: usize,
    },

    /// The policy document could not be canonically serialized.
    #[error("serialize policy for verification: {0}")]
    Canonicalize(#[source] serde_json::Error),

    /// The signature does not match the canonical policy bytes.
    #[error("invalid policy signature")]
    BadSignature,
}

/// Returns the canonical byte serialization of a policy document.
///
/// Field order is fixed by the struct definition, so the same document
/// always serializes to the same bytes on both ends of the wire.
///
/// # Errors
///
/// Returns [`VerifierError::Canonicalize`] if serialization fails.
pub fn canonical_policy_bytes(policy: &PolicyDocument) -> Result<Vec<u8>, VerifierError> {
    serde_json::to_vec(policy).map_err(VerifierError::Canonicalize)
}

/// Validates policy signatures against a pinned Ed25519 public key.
#[derive(Debug, Clone)]
pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    /// Loads the pinned key from a file containing either a PEM
    /// `PUBLIC KEY` block or exactly 32 raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] if the file cannot be read or does not
    /// contain a usable Ed25519 key.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VerifierError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| VerifierError::ReadKey {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(&data)
    }

    /// Parses the pinned key from raw file contents.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] for unsupported encodings or invalid key
    /// material.
    pub fn from_bytes(data: &[u8]) -> Result<Self, VerifierError> {
        match decode_pem_public_key(data) {
            PemBlock::Der(der) => {
                if der.len() != ED25519_SPKI_PREFIX.len() + 32
                    || der[..ED25519_SPKI_PREFIX.len()] != ED25519_SPKI_PREFIX
                {
                    return Err(VerifierError::WrongKeyAlgorithm);
                }
                Self::from_raw(&der[ED25519_SPKI_PREFIX.len()..])
            },
            PemBlock::Invalid => Err(VerifierError::UnsupportedKeyEncoding),
            PemBlock::NotPem if data.len() == 32 => Self::from_raw(data),
            PemBlock::NotPem => Err(VerifierError::UnsupportedKeyEncoding),
        }
    }

    fn from_raw(raw: &[u8]) -> Result<Self, VerifierError> {
        let bytes: [u8; 32] = raw.try_into().map_err(|_| VerifierError::InvalidKey)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| VerifierError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Checks the envelope signature against the pinned key.
    ///
    /// # Errors
    ///
    /// Returns a distinct [`VerifierError`] variant for a missing
    /// signature, an undecodable signature, a malformed signature, and a
    /// signature mismatch.
    pub fn verify(&self, envelope: &PolicyEnvelope) -> Result<(), VerifierError> {
        if envelope.signature.is_empty() {
            return Err(VerifierError::MissingSignature);
        }
        let payload = canonical_policy_bytes(&envelope.policy)?;
        let raw = BASE64
            .decode(&envelope.signature)
            .map_err(VerifierError::DecodeSignature)?;
        let signature = Signature::from_slice(&raw)
            .map_err(|_| VerifierError::MalformedSignature { len: raw.len() })?;
        self.key
            .verify(&payload, &signature)
            .map_err(|_| VerifierError::BadSignature)
    }
}

enum PemBlock {
    /// Input carries no PEM armor at all.
    NotPem,
    /// PEM armor present but the block is empty or does not decode.
    Invalid,
    /// Decoded DER body of a `PUBLIC KEY` block.
    Der(Vec<u8>),
}

fn decode_pem_public_key(data: &[u8]) -> PemBlock {
    let Ok(text) = std::str::from_utf8(data) else {
        return PemBlock::NotPem;
    };
    if !text.contains("-----BEGIN") {
        return PemBlock::NotPem;
    }
    let body: String = text
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("-----BEGIN PUBLIC KEY-----"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END"))
        .collect();
    if body.is_empty() {
        return PemBlock::Invalid;
    }
    match BASE64.decode(body.as_bytes()) {
        Ok(der) => PemBlock::Der(der),
        Err(_) => PemBlock::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    use super::*;
    use crate::api::{AppDefinition, AppsPolicy};

    fn sample_policy() -> PolicyDocument {
        PolicyDocument {
            apps: AppsPolicy {
                required: vec![AppDefinition {
                    id: "org.example.Editor".to_string(),
                    branch: "stable".to_string(),
                    source: String::new(),
                }],
            },
            ..PolicyDocument::default()
        }
    }

    fn signed_envelope(signing_key: &SigningKey) -> PolicyEnvelope {
        let policy = sample_policy();
        let payload = canonical_policy_bytes(&policy).unwrap();
        let signature = signing_key.sign(&payload);
        PolicyEnvelope {
            version: "v1".to_string(),
            signature: BASE64.encode(signature.to_bytes()),
            policy,
            rotated_token: None,
        }
    }

    fn pem_for(key: &VerifyingKey) -> String {
        let mut der = ED25519_SPKI_PREFIX.to_vec();
        der.extend_from_slice(key.as_bytes());
        format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            BASE64.encode(der)
        )
    }

    #[test]
    fn valid_signature_verifies() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        verifier.verify(&signed_envelope(&signing_key)).unwrap();
    }

    #[test]
    fn pem_key_round_trips() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pem = pem_for(&signing_key.verifying_key());

        let verifier = Verifier::from_bytes(pem.as_bytes()).unwrap();
        verifier.verify(&signed_envelope(&signing_key)).unwrap();
    }

    #[test]
    fn flipped_signature_byte_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        let mut envelope = signed_envelope(&signing_key);
        let mut raw = BASE64.decode(&envelope.signature).unwrap();
        raw[0] ^= 0x01;
        envelope.signature = BASE64.encode(raw);

        assert!(matches!(
            verifier.verify(&envelope).unwrap_err(),
            VerifierError::BadSignature
        ));
    }

    #[test]
    fn tampered_policy_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        let mut envelope = signed_envelope(&signing_key);
        envelope.policy.apps.required[0].id = "org.example.Tampered".to_string();

        assert!(matches!(
            verifier.verify(&envelope).unwrap_err(),
            VerifierError::BadSignature
        ));
    }

    #[test]
    fn missing_signature_is_distinct() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        let mut envelope = signed_envelope(&signing_key);
        envelope.signature = String::new();

        assert!(matches!(
            verifier.verify(&envelope).unwrap_err(),
            VerifierError::MissingSignature
        ));
    }

    #[test]
    fn unparseable_signature_is_distinct() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        let mut envelope = signed_envelope(&signing_key);
        envelope.signature = "not base64 !!".to_string();

        assert!(matches!(
            verifier.verify(&envelope).unwrap_err(),
            VerifierError::DecodeSignature(_)
        ));
    }

    #[test]
    fn truncated_signature_is_distinct() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Verifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        let mut envelope = signed_envelope(&signing_key);
        envelope.signature = BASE64.encode([0u8; 16]);

        assert!(matches!(
            verifier.verify(&envelope).unwrap_err(),
            VerifierError::MalformedSignature { len: 16 }
        ));
    }

    #[test]
    fn wrong_length_raw_key_is_rejected() {
        assert!(matches!(
            Verifier::from_bytes(&[0u8; 33]).unwrap_err(),
            VerifierError::UnsupportedKeyEncoding
        ));
    }

    #[test]
    fn non_ed25519_pem_is_rejected() {
        // An RSA-ish SPKI prefix; only the algorithm identifier matters.
        let der = vec![0x30, 0x82, 0x01, 0x22, 0x30, 0x0d, 0x06, 0x09];
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            BASE64.encode(der)
        );
        assert!(matches!(
            Verifier::from_bytes(pem.as_bytes()).unwrap_err(),
            VerifierError::WrongKeyAlgorithm
        ));
    }

    #[test]
    fn from_file_reads_key_material() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.pub");
        std::fs::write(&path, signing_key.verifying_key().as_bytes()).unwrap();

        let verifier = Verifier::from_file(&path).unwrap();
        verifier.verify(&signed_envelope(&signing_key)).unwrap();
    }
}
