//! Fetch-and-extract collaborator.
//!
//! Scraping a page and turning its text into candidate facts happens outside
//! this crate. The coordinator only needs the contract: given a source URL,
//! return a fresh [`CandidateBatch`] or say whether the failure is worth
//! retrying on a later cycle.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use sentinel::CandidateBatch;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// FactSource trait
// ============================================================================

#[async_trait]
pub trait FactSource: Send + Sync {
    /// Fetch `url` and extract candidate facts from it.
    ///
    /// Any timeout is the implementation's own; the coordinator does not
    /// bound this call.
    async fn fetch_and_extract(&self, url: &str) -> Result<CandidateBatch, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    /// Network trouble, rate limiting, a 5xx. Worth escalating.
    Transient,
    /// The page is gone or yields nothing extractable.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?} collaborator failure: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CollaboratorErrorKind::Transient
    }
}

// ============================================================================
// HttpFactSource
// ============================================================================

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    url: &'a str,
}

/// Calls an extractor service that accepts `{"url": ...}` and answers with a
/// JSON [`CandidateBatch`].
#[derive(Debug, Clone)]
pub struct HttpFactSource {
    client: Client,
    endpoint: String,
}

impl HttpFactSource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(endpoint, Duration::from_secs(120))
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Transient: 408, 429 and every 5xx.
pub(crate) fn classify_status(status: StatusCode) -> CollaboratorErrorKind {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        CollaboratorErrorKind::Transient
    } else {
        CollaboratorErrorKind::Permanent
    }
}

fn classify_transport(err: &reqwest::Error) -> CollaboratorErrorKind {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CollaboratorErrorKind::Transient
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        CollaboratorErrorKind::Permanent
    }
}

#[async_trait]
impl FactSource for HttpFactSource {
    async fn fetch_and_extract(&self, url: &str) -> Result<CandidateBatch, CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ExtractRequest { url })
            .send()
            .await
            .map_err(|e| CollaboratorError {
                kind: classify_transport(&e),
                message: format!("extractor request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError {
                kind: classify_status(status),
                message: format!("extractor returned {status}: {}", truncate(&body, 200)),
            });
        }

        response.json::<CandidateBatch>().await.map_err(|e| {
            if e.is_decode() {
                CollaboratorError::permanent(format!("undecodable extractor response: {e}"))
            } else {
                CollaboratorError {
                    kind: classify_transport(&e),
                    message: format!("reading extractor response failed: {e}"),
                }
            }
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
