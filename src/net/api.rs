//! REST calls to the session service.
//!
//! ARCHITECTURE
//! ============
//! The controller talks to the service through the [`SessionApi`] trait so
//! tests can substitute a scripted implementation. [`HttpSessionApi`] is the
//! production client:
//! - `GET  {base}/rooms/{code}` → [`RoomMetadata`]
//! - `POST {base}/rooms/{code}/polls/answer` with `{pollId, userId, answerIndex}`
//!
//! ERROR HANDLING
//! ==============
//! Transport failures and 5xx responses are retryable; 4xx responses mean the
//! service refused the answer (already answered, room closed) and are not.
//! Nothing here retries: that decision belongs to the user.

use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use crate::config::HttpTimeouts;
use crate::error::ErrorCode;
use crate::poll::RoomMetadata;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidBaseUrl(_) => "E_CONFIG",
            Self::Http(_) => "E_NETWORK",
            Self::Rejected { status: 500..=599, .. } => "E_SERVER",
            Self::Rejected { .. } => "E_REJECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Rejected { status: 500..=599, .. })
    }
}

/// Body of an answer submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub poll_id: String,
    pub user_id: String,
    pub answer_index: usize,
}

/// Request/response surface of the session service.
#[async_trait::async_trait]
pub trait SessionApi: Send + Sync {
    async fn fetch_room(&self, room_code: &str) -> Result<RoomMetadata, ApiError>;

    async fn submit_answer(&self, room_code: &str, answer: &AnswerRequest) -> Result<(), ApiError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpSessionApi {
    http: reqwest::Client,
    base: Url,
}

impl HttpSessionApi {
    /// Build a client for the service at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot serve as a base or the HTTP client
    /// fails to build.
    pub fn new(api_url: &str, timeouts: HttpTimeouts) -> Result<Self, ApiError> {
        let base = Url::parse(api_url).map_err(|_| ApiError::InvalidBaseUrl(api_url.to_owned()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(api_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()?;
        Ok(Self { http, base })
    }

    /// Append path segments to the base URL, percent-encoding each one.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ApiError::InvalidBaseUrl(self.base.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }
}

/// Pull a human-readable reason out of an error body.
pub(crate) fn rejection_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| body.trim().to_owned())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Rejected { status: status.as_u16(), message: rejection_message(&body) })
}

#[async_trait::async_trait]
impl SessionApi for HttpSessionApi {
    async fn fetch_room(&self, room_code: &str) -> Result<RoomMetadata, ApiError> {
        let url = self.endpoint(&["rooms", room_code])?;
        let response = check_status(self.http.get(url).send().await?).await?;
        Ok(response.json::<RoomMetadata>().await?)
    }

    async fn submit_answer(&self, room_code: &str, answer: &AnswerRequest) -> Result<(), ApiError> {
        let url = self.endpoint(&["rooms", room_code, "polls", "answer"])?;
        check_status(self.http.post(url).json(answer).send().await?).await?;
        Ok(())
    }
}

// =============================================================================
// TEST DOUBLE
// =============================================================================

/// Scripted service: answers succeed unless a result was queued.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockApi {
    submit_results: std::sync::Mutex<Vec<Result<(), ApiError>>>,
    submitted: std::sync::Mutex<Vec<(String, AnswerRequest)>>,
    room_missing: bool,
}

#[cfg(test)]
impl MockApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn without_rooms() -> Self {
        Self { room_missing: true, ..Self::default() }
    }

    pub(crate) fn queue_submit_result(&self, result: Result<(), ApiError>) {
        self.submit_results.lock().unwrap().push(result);
    }

    pub(crate) fn submitted(&self) -> Vec<(String, AnswerRequest)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl SessionApi for MockApi {
    async fn fetch_room(&self, room_code: &str) -> Result<RoomMetadata, ApiError> {
        if self.room_missing {
            return Err(ApiError::Rejected { status: 404, message: "room not found".into() });
        }
        Ok(RoomMetadata {
            code: room_code.to_owned(),
            creator_id: "host-1".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        })
    }

    async fn submit_answer(&self, room_code: &str, answer: &AnswerRequest) -> Result<(), ApiError> {
        self.submitted
            .lock()
            .unwrap()
            .push((room_code.to_owned(), answer.clone()));
        let mut results = self.submit_results.lock().unwrap();
        if results.is_empty() {
            Ok(())
        } else {
            results.remove(0)
        }
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
