//! HTTP client for the control plane.
//!
//! Four JSON endpoints with bearer-token auth on all but enroll. A `304
//! Not Modified` on the policy endpoint is not an error; any status >= 400
//! surfaces as [`ApiError::Status`] carrying the body.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    AttestBootRequest, EnrollDeviceRequest, EnrollDeviceResponse, PolicyEnvelope,
    PullPolicyRequest, ReportEventsRequest, ReportStateRequest,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from control-plane requests.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The configured base URL could not be parsed or extended.
    #[error("invalid backend url: {url}")]
    InvalidBaseUrl {
        /// The offending URL.
        url: String,
    },

    /// The request failed at the transport layer (DNS, TCP, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error status.
    #[error("api error {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated by the server.
        body: String,
    },
}

/// Control-plane client.
#[derive(Debug, Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    /// Creates a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidBaseUrl`] if the URL does not parse and
    /// [`ApiError::Transport`] if the underlying client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        if base_url.is_empty() {
            return Err(ApiError::InvalidBaseUrl {
                url: base_url.to_string(),
            });
        }
        let base = Url::parse(base_url).map_err(|_| ApiError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { base, http })
    }

    fn endpoint(&self, parts: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ApiError::InvalidBaseUrl {
                    url: self.base.to_string(),
                })?;
            segments.pop_if_empty();
            segments.extend(parts);
        }
        Ok(url)
    }

    async fn post_json<B, T>(
        &self,
        parts: &[&str],
        token: Option<&str>,
        body: &B,
    ) -> Result<Option<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(parts)?;
        let mut request = self.http.post(url).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(response.json().await?))
    }

    async fn post_ack<B>(&self, parts: &[&str], token: &str, body: &B) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        self.post_json::<B, serde_json::Value>(parts, Some(token), body)
            .await
            .map(|_| ())
    }

    /// Exchanges hardware facts for a device identity.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or error status.
    pub async fn enroll_device(
        &self,
        request: &EnrollDeviceRequest,
    ) -> Result<EnrollDeviceResponse, ApiError> {
        self.post_json(&["api", "v1", "devices", "enroll"], None, request)
            .await?
            .ok_or_else(|| ApiError::Status {
                status: 304,
                body: "unexpected 304 from enroll".to_string(),
            })
    }

    /// Pulls the latest policy envelope.
    ///
    /// Returns `Ok(None)` when the server answers `304 Not Modified` for
    /// `current_version`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or error status.
    pub async fn pull_policy(
        &self,
        token: &str,
        current_version: &str,
    ) -> Result<Option<PolicyEnvelope>, ApiError> {
        let body = PullPolicyRequest {
            current_version: current_version.to_string(),
        };
        self.post_json(&["api", "v1", "devices", "policy"], Some(token), &body)
            .await
    }

    /// Reports one device-state snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or error status.
    pub async fn report_state(
        &self,
        token: &str,
        request: &ReportStateRequest,
    ) -> Result<(), ApiError> {
        self.post_ack(&["api", "v1", "devices", "state"], token, request)
            .await
    }

    /// Delivers a batch of queued events.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or error status.
    pub async fn report_events(
        &self,
        token: &str,
        request: &ReportEventsRequest,
    ) -> Result<(), ApiError> {
        self.post_ack(&["api", "v1", "devices", "events"], token, request)
            .await
    }

    /// Submits TPM attestation evidence for the current boot.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or error status.
    pub async fn attest_boot(
        &self,
        token: &str,
        request: &AttestBootRequest,
    ) -> Result<(), ApiError> {
        self.post_ack(&["api", "v1", "devices", "attest"], token, request)
            .await
    }
}
