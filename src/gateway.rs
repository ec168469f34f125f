//! Outbound provider-gateway collaborator.
//!
//! The lab never talks to vendors directly. It talks to a gateway service
//! that exposes one JSON endpoint per concern; `HttpGateway` is the reqwest
//! client for it and [`ProviderGateway`] is the seam tests substitute.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use url::Url;

use crate::conversation::Message;
use crate::documents::{UploadedDocument, check_upload_extension};
use crate::error::{LabError, TransportError, ValidationError};
use crate::{log_debug, log_warn};

/// Body of `POST /asher/test`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub provider: String,
    pub message: String,
    pub system_prompt: String,
    pub conversation_history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Entry of `GET /providers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProvidersResponse {
    providers: Vec<ProviderStatus>,
}

/// Loosely-typed reply body; failures may carry `detail` or `error`
#[derive(Debug, Default, Deserialize)]
struct TestResponse {
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl TestResponse {
    fn failure_detail(&self) -> Option<String> {
        self.detail
            .clone()
            .or_else(|| self.error.clone())
            .filter(|d| !d.is_empty())
    }
}

/// Operations the lab needs from the gateway
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Send one message to one provider and return its reply text
    async fn send(&self, request: &SendRequest) -> Result<String, TransportError>;

    /// Availability of every provider the gateway knows
    async fn list_providers(&self) -> Result<Vec<ProviderStatus>, TransportError>;

    /// Upload a file and get back its parsed text
    async fn upload_document(&self, path: &Path) -> Result<UploadedDocument, LabError>;
}

/// Reqwest client for the gateway's HTTP endpoints
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base: Url,
}

impl HttpGateway {
    /// Create a client rooted at `base_url` (e.g. `http://localhost:8001`)
    pub fn new(base_url: &str) -> Result<Self, LabError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(TransportError::Network)?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, LabError> {
        let base = parse_base_url(base_url)?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::MalformedResponse(format!("bad endpoint {path}: {e}")))
    }

    async fn fetch_providers(&self) -> Result<Vec<ProviderStatus>, TransportError> {
        let response = self.client.get(self.endpoint("providers")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                detail: extract_detail(&body).unwrap_or_else(|| "Request failed".to_string()),
            });
        }

        let parsed: ProvidersResponse = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        Ok(parsed.providers)
    }
}

/// Validate a gateway base URL and make relative joins append to its path
pub fn parse_base_url(base_url: &str) -> Result<Url, ValidationError> {
    let trimmed = base_url.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };

    let url = Url::parse(&with_slash).map_err(|e| ValidationError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ValidationError::InvalidUrl {
            url: base_url.to_string(),
            reason: "not a base URL".to_string(),
        });
    }
    Ok(url)
}

/// Pull `detail` or `error` out of a JSON error body
fn extract_detail(body: &str) -> Option<String> {
    serde_json::from_str::<TestResponse>(body)
        .ok()
        .and_then(|r| r.failure_detail())
}

#[async_trait]
impl ProviderGateway for HttpGateway {
    async fn send(&self, request: &SendRequest) -> Result<String, TransportError> {
        log_debug!(
            "Sending to {} with {} history messages",
            request.provider,
            request.conversation_history.len()
        );

        let response = self
            .client
            .post(self.endpoint("asher/test")?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: Option<TestResponse> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(TestResponse::failure_detail)
                .unwrap_or_else(|| "Request failed".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed = parsed.ok_or_else(|| {
            TransportError::MalformedResponse(format!("reply body is not JSON: {body}"))
        })?;

        if parsed.success == Some(false) {
            return Err(TransportError::Provider(
                parsed
                    .failure_detail()
                    .unwrap_or_else(|| "Provider reported a failure".to_string()),
            ));
        }

        parsed
            .reply
            .ok_or_else(|| TransportError::MalformedResponse("response has no reply".to_string()))
    }

    async fn list_providers(&self) -> Result<Vec<ProviderStatus>, TransportError> {
        // Idempotent read, safe to retry
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(2)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(2);

        Retry::spawn(strategy, || async {
            self.fetch_providers().await.inspect_err(|e| {
                log_warn!("Loading provider status failed: {}", e);
            })
        })
        .await
    }

    async fn upload_document(&self, path: &Path) -> Result<UploadedDocument, LabError> {
        check_upload_extension(path)?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::Provider(format!("Could not read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());

        let form = Form::new().part("file", Part::bytes(bytes).file_name(filename.clone()));
        let response = self
            .client
            .post(self.endpoint("upload/document")?)
            .multipart(form)
            .send()
            .await
            .map_err(TransportError::Network)?;

        let status = response.status();
        let body = response.text().await.map_err(TransportError::Network)?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                detail: extract_detail(&body).unwrap_or_else(|| "Upload failed".to_string()),
            }
            .into());
        }

        let uploaded: UploadedDocument = serde_json::from_str(&body)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        log_debug!("Uploaded {} ({})", uploaded.filename, uploaded.file_type);
        Ok(uploaded)
    }
}
