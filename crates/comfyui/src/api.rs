//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the HTTP API (workflow submission, history retrieval, artifact
//! download) using [`reqwest`]. Nothing here retries: submission is not
//! idempotent, and the polling and download layers own their own retry
//! budgets via [`ComfyUIApiError::is_transient`].

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::workflow::{StorageCategory, Workflow};

/// Statuses that polling and downloads treat as worth retrying.
pub const TRANSIENT_STATUSES: [StatusCode; 2] =
    [StatusCode::NOT_FOUND, StatusCode::INTERNAL_SERVER_ERROR];

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Request body of `POST /submit`.
#[derive(Debug, Serialize)]
struct SubmitEnvelope<'a> {
    workflow: &'a Workflow,
    client_tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_data: Option<ExtraData<'a>>,
}

/// Credential block nested inside the submission envelope.
#[derive(Debug, Serialize)]
struct ExtraData<'a> {
    api_key: &'a str,
}

/// Response returned by the `/submit` endpoint after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue, when reported.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The configured base URL is not an absolute HTTP(S) URL.
    #[error("Invalid server URL '{0}'. Must be a valid HTTP URL.")]
    InvalidEndpoint(String),

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: StatusCode,
        /// Raw response body for debugging.
        body: String,
    },

    /// A successful submission response carried no prompt ID.
    #[error("No prompt ID received from server")]
    MissingPromptId,
}

impl ComfyUIApiError {
    /// HTTP status of a non-2xx response, if that is what this error is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error is a status in [`TRANSIENT_STATUSES`].
    pub fn is_transient(&self) -> bool {
        self.status()
            .is_some_and(|status| TRANSIENT_STATUSES.contains(&status))
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    ///
    /// Rejects anything that is not an absolute `http`/`https` URL with a
    /// host, before any network call is made.
    pub fn new(api_url: &str) -> Result<Self, ComfyUIApiError> {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: &str) -> Result<Self, ComfyUIApiError> {
        let api_url = validate_endpoint(api_url)?;
        Ok(Self { client, api_url })
    }

    /// HTTP API base URL, without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// WebSocket base URL matching this HTTP base (`http` -> `ws`,
    /// `https` -> `wss`).
    pub fn ws_url(&self) -> String {
        match self.api_url.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!(
                "ws://{}",
                self.api_url.trim_start_matches("http://")
            ),
        }
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /submit` request and returns the server-assigned
    /// prompt ID. The credential, when present, travels inside the body
    /// as `extra_data.api_key`.
    pub async fn submit_workflow(
        &self,
        workflow: &Workflow,
        client_tag: &str,
        api_key: Option<&str>,
    ) -> Result<String, ComfyUIApiError> {
        let body = SubmitEnvelope {
            workflow,
            client_tag,
            extra_data: api_key.map(|api_key| ExtraData { api_key }),
        };

        let response = self
            .client
            .post(format!("{}/submit", self.api_url))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        let prompt_id = submitted
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or(ComfyUIApiError::MissingPromptId)?;

        tracing::debug!(prompt_id = %prompt_id, queue_number = ?submitted.number, "Workflow queued");
        Ok(prompt_id)
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON is
    /// interpreted by [`crate::history::interpret_history`].
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download the raw bytes of one artifact.
    ///
    /// Sends `GET /view?filename=&subfolder=&type=` where `type` is the
    /// storage area the owning node's role maps to.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        category: StorageCategory,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", category.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError { status, body });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Check that `api_url` is an absolute HTTP(S) URL and normalize it.
fn validate_endpoint(api_url: &str) -> Result<String, ComfyUIApiError> {
    let trimmed = api_url.trim().trim_end_matches('/');
    let invalid = || ComfyUIApiError::InvalidEndpoint(api_url.to_string());

    let parsed = Url::parse(trimmed).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }

    Ok(trimmed.to_string())
}
