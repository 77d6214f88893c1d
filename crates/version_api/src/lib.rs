//! HTTP client for a school's mobile-version API, hiding the remote's
//! content-negotiation quirk: the primary request carries the structured
//! JSON:API media type for both `Accept` and `Content-Type`, and a 415
//! answer triggers exactly one retry with a relaxed `Accept` header and no
//! explicit `Content-Type`.

use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use shared::{
    domain::{Platform, VersionRecord},
    protocol::{
        VersionListResponse, VersionUpsertAttributes, VersionUpsertEnvelope,
        JSON_API_ACCEPT_FALLBACK, JSON_API_MEDIA_TYPE,
    },
};
use thiserror::Error;
use throttle::RateLimiter;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum VersionApiError {
    /// Raised before any network access when the caller has not resolved a
    /// school and app type.
    #[error("select a school and an app type first")]
    MissingSelection,
    /// Raised before any network access when a required submission field is
    /// absent or empty.
    #[error("missing required version field: {0}")]
    MissingField(&'static str),
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("failed to encode version payload: {0}")]
    Encode(#[source] serde_json::Error),
    /// Wire or remote failure on a write. Writes are never retried
    /// automatically; upserts are not idempotent from this side.
    #[error("{0}")]
    Submit(String),
}

/// Result of a version list fetch. Handled remote failures surface here as a
/// formatted message next to an empty list instead of an `Err`, so a list
/// view never gets trapped by a flaky backend.
#[derive(Debug, Default, Clone)]
pub struct FetchOutcome {
    pub versions: Vec<VersionRecord>,
    pub error: Option<String>,
}

/// Operator input for a version upsert. `platform` and `is_active` are
/// optional so an incomplete form can be rejected locally before any
/// network call.
#[derive(Debug, Clone)]
pub struct VersionSubmission {
    pub version: String,
    pub platform: Option<Platform>,
    pub is_active: Option<bool>,
}

enum FetchFailure {
    UnsupportedMediaType,
    Status { status: u16, message: String },
    Transport(String),
}

impl FetchFailure {
    fn formatted(&self) -> String {
        match self {
            FetchFailure::UnsupportedMediaType => {
                "Request failed (status 415): unsupported media type".to_string()
            }
            FetchFailure::Status { status, message } => {
                format!("Request failed (status {status}): {message}")
            }
            FetchFailure::Transport(message) => format!("Request failed: {message}"),
        }
    }
}

pub struct VersionApiClient {
    http: Client,
    limiter: RateLimiter,
}

impl VersionApiClient {
    pub fn new(limiter: RateLimiter) -> Result<Self, VersionApiError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(VersionApiError::ClientBuild)?;
        Ok(Self { http, limiter })
    }

    /// Fetches the version list for one school, platform, and app type.
    ///
    /// Only precondition violations surface as `Err`; every handled remote
    /// failure yields an empty list plus a formatted message in the outcome.
    pub async fn fetch_versions(
        &self,
        base_url: &str,
        platform: Platform,
        app_type: &str,
    ) -> Result<FetchOutcome, VersionApiError> {
        if base_url.trim().is_empty() || app_type.trim().is_empty() {
            return Err(VersionApiError::MissingSelection);
        }
        if !self.limiter.can_make_request() {
            warn!("version fetch rejected by local rate limit");
            return Ok(FetchOutcome {
                versions: Vec::new(),
                error: Some(
                    "Request failed: rate limit exceeded, wait before making more requests"
                        .to_string(),
                ),
            });
        }

        let url = format!("{base_url}/mobile-versions/{platform}/{app_type}");
        debug!(%url, "fetching mobile versions");

        match self.get_versions(&url, true).await {
            Ok(versions) => Ok(FetchOutcome {
                versions,
                error: None,
            }),
            Err(FetchFailure::UnsupportedMediaType) => {
                debug!(%url, "remote rejected structured media type, retrying with relaxed accept");
                match self.get_versions(&url, false).await {
                    Ok(versions) => Ok(FetchOutcome {
                        versions,
                        error: None,
                    }),
                    Err(failure) => {
                        let message = failure.formatted();
                        warn!(%url, %message, "version fetch failed on fallback attempt");
                        Ok(FetchOutcome {
                            versions: Vec::new(),
                            error: Some(message),
                        })
                    }
                }
            }
            Err(failure) => {
                let message = failure.formatted();
                warn!(%url, %message, "version fetch failed");
                Ok(FetchOutcome {
                    versions: Vec::new(),
                    error: Some(message),
                })
            }
        }
    }

    async fn get_versions(
        &self,
        url: &str,
        structured_content_type: bool,
    ) -> Result<Vec<VersionRecord>, FetchFailure> {
        let mut request = self.http.get(url);
        if structured_content_type {
            request = request
                .header(header::ACCEPT, JSON_API_MEDIA_TYPE)
                .header(header::CONTENT_TYPE, JSON_API_MEDIA_TYPE);
        } else {
            request = request.header(header::ACCEPT, JSON_API_ACCEPT_FALLBACK);
        }

        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();
        if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
            return Err(FetchFailure::UnsupportedMediaType);
        }
        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
                message: remote_error_message(response).await,
            });
        }

        let body: VersionListResponse = response
            .json()
            .await
            .map_err(|err| FetchFailure::Transport(format!("invalid response body: {err}")))?;
        Ok(body.data)
    }

    /// Submits a version upsert. Required fields are validated locally; the
    /// caller is expected to re-fetch the list afterwards to observe the
    /// server-resolved state.
    pub async fn submit_version(
        &self,
        base_url: &str,
        app_type: &str,
        submission: &VersionSubmission,
    ) -> Result<(), VersionApiError> {
        if base_url.trim().is_empty() || app_type.trim().is_empty() {
            return Err(VersionApiError::MissingSelection);
        }
        let version = submission.version.trim();
        if version.is_empty() {
            return Err(VersionApiError::MissingField("version"));
        }
        let Some(platform) = submission.platform else {
            return Err(VersionApiError::MissingField("type"));
        };
        let Some(is_active) = submission.is_active else {
            return Err(VersionApiError::MissingField("is_active"));
        };
        if !self.limiter.can_make_request() {
            return Err(VersionApiError::Submit(
                "rate limit exceeded, wait before making more requests".to_string(),
            ));
        }

        let envelope = VersionUpsertEnvelope::new(VersionUpsertAttributes {
            app_name: app_type.to_string(),
            version: version.to_string(),
            is_active,
            platform,
        });
        let body = serde_json::to_vec(&envelope).map_err(VersionApiError::Encode)?;

        let url = format!("{base_url}/add-update-mobile-version");
        debug!(%url, %platform, version, "submitting version upsert");

        let response = self
            .http
            .post(&url)
            .header(header::ACCEPT, JSON_API_ACCEPT_FALLBACK)
            .header(header::CONTENT_TYPE, JSON_API_MEDIA_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| VersionApiError::Submit(transport_failure(err).formatted()))?;

        let status = response.status();
        if !status.is_success() {
            let message = remote_error_message(response).await;
            return Err(VersionApiError::Submit(format!(
                "Request failed (status {}): {message}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

fn transport_failure(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Transport("request timed out".to_string())
    } else {
        FetchFailure::Transport(err.to_string())
    }
}

/// Pulls the most useful message out of an error response: the remote's
/// `message` field when the body is JSON, otherwise the raw body text.
async fn remote_error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
        return value.to_string();
    }
    if text.is_empty() {
        "no response body".to_string()
    } else {
        text
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
