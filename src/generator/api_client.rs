//! Image generation API client
//!
//! This module provides the client for the chat-completion style image APIs:
//! 1. Picks the endpoint for one of the supported platforms
//! 2. Builds the message payload, embedding reference images as data URIs or URLs
//! 3. Retries network errors, bad statuses and unparsable responses with capped
//!    exponential backoff
//! 4. Extracts the image locator from whichever response shape comes back

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::generator::response_parser::extract_image_locator;
use crate::generator::task::{ImageSource, ReferenceImage, truncate_chars};

/// Total timeout for one generation call
pub const GENERATION_TIMEOUT_SECS: u64 = 600;

/// Delay before the first retry
pub const BASE_RETRY_DELAY_MS: u64 = 500;

/// Upper bound for the delay between retries
pub const MAX_RETRY_DELAY_MS: u64 = 8_000;

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Error types for the API client
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("No image data in response: {0}")]
    ResponseParse(String),

    #[error("API key is empty")]
    MissingCredential,

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl ApiError {
    /// Whether another attempt may succeed.
    ///
    /// Parse failures are retried the same as transport failures: a provider
    /// occasionally answers with text instead of an image.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Timeout(_)
                | ApiError::HttpStatus { .. }
                | ApiError::ResponseParse(_)
        )
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err)
        } else {
            ApiError::Network(err)
        }
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Supported API platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Platform {
    #[serde(rename = "yunwu", alias = "云雾")]
    Yunwu,
    #[serde(rename = "apicore")]
    ApiCore,
    #[default]
    #[serde(rename = "apiyi", alias = "API易")]
    ApiYi,
}

impl Platform {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Platform::Yunwu => "https://yunwu.ai/v1/chat/completions",
            Platform::ApiCore => "https://api.apicore.ai/v1/chat/completions",
            Platform::ApiYi => "https://vip.apiyi.com/v1/chat/completions",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Yunwu => write!(f, "yunwu"),
            Platform::ApiCore => write!(f, "apicore"),
            Platform::ApiYi => write!(f, "apiyi"),
        }
    }
}

/// Model family requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ModelVariant {
    #[default]
    #[serde(rename = "sora_image")]
    SoraImage,
    #[serde(rename = "nano-banana")]
    NanoBanana,
}

impl ModelVariant {
    /// Model identifier advertised in the payload
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelVariant::SoraImage => "sora_image",
            ModelVariant::NanoBanana => "gemini-2.5-flash-image-preview",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::SoraImage => write!(f, "sora_image"),
            ModelVariant::NanoBanana => write!(f, "nano-banana"),
        }
    }
}

/// API client configuration
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub platform: Platform,
    pub model: ModelVariant,
    pub api_key: String,
    pub retry_count: u32,
    pub allow_insecure_ssl: bool,
    pub timeout_seconds: u64,
    /// Replaces the platform endpoint when set
    pub endpoint_override: Option<String>,
    /// Base directory for relative reference image paths
    pub reference_root: PathBuf,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            model: ModelVariant::default(),
            api_key: String::new(),
            retry_count: 3,
            allow_insecure_ssl: false,
            timeout_seconds: GENERATION_TIMEOUT_SECS,
            endpoint_override: None,
            reference_root: PathBuf::from("."),
        }
    }
}

/// Input of one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Text sent to the model (already decorated with style and ratio)
    pub prompt: String,
    pub reference_images: Vec<ReferenceImage>,
}

/// Progress reported while an attempt loop is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptNotice {
    /// Attempt failed with a retryable error; retry number `retry` of `limit` follows
    Retrying { retry: u32, limit: u32, error: String },
    /// Backoff elapsed and retry number `retry` is starting
    Resumed { retry: u32 },
}

/// Anything that turns a prompt into an image locator
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        observer: &(dyn Fn(AttemptNotice) + Send + Sync),
    ) -> ApiResult<String>;
}

/// Delay before retry number `retry` (1-based): 0.5s, 1s, 2s, 4s, then 8s
pub fn calculate_backoff(retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    let delay = (1u64 << exponent) * BASE_RETRY_DELAY_MS;
    Duration::from_millis(std::cmp::min(delay, MAX_RETRY_DELAY_MS))
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Read a local image and encode it as a data URI
pub async fn image_to_data_uri(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(format!("data:{};base64,{}", mime_for_path(path), BASE64.encode(bytes)))
}

/// Client for the image generation endpoint
pub struct ApiClient {
    config: ApiClientConfig,
    client: Client,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: ApiClientConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(config.allow_insecure_ssl)
            .build()
            .map_err(ApiError::ClientBuild)?;

        if config.allow_insecure_ssl {
            warn!("TLS certificate verification is disabled for the generation API");
        }
        info!(
            "Initialized API client: platform={}, model={}, retries={}",
            config.platform, config.model, config.retry_count
        );

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        self.config
            .endpoint_override
            .as_deref()
            .unwrap_or_else(|| self.config.platform.endpoint())
    }

    /// Ordered content parts: the prompt text, then one part per usable reference image
    pub async fn build_content(&self, request: &GenerationRequest) -> Vec<Value> {
        let mut content = vec![json!({"type": "text", "text": request.prompt})];

        for image in &request.reference_images {
            let url = match &image.source {
                ImageSource::LocalFile(path) => {
                    let full_path = self.config.reference_root.join(path);
                    match image_to_data_uri(&full_path).await {
                        Ok(uri) => uri,
                        Err(e) => {
                            warn!(
                                "Skipping reference '{}' ({}): {}",
                                image.name,
                                full_path.display(),
                                e
                            );
                            continue;
                        }
                    }
                }
                ImageSource::Url(url) => url.clone(),
            };
            content.push(json!({"type": "image_url", "image_url": {"url": url}}));
        }

        content
    }

    /// Full request body for the configured model
    pub fn build_payload(&self, content: Vec<Value>) -> Value {
        json!({
            "model": self.config.model.model_id(),
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": content},
            ],
        })
    }

    /// One request/response round trip
    #[instrument(skip(self, payload), fields(endpoint = %self.endpoint()))]
    async fn send_once(&self, payload: &Value, attempt: u32) -> ApiResult<String> {
        let response = self
            .client
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let data: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(e)
            } else {
                ApiError::ResponseParse(format!("invalid JSON body: {}", e))
            }
        })?;

        debug!("Received response for attempt {}", attempt);

        extract_image_locator(&data, self.config.model).ok_or_else(|| {
            ApiError::ResponseParse(truncate_chars(&data.to_string(), 200))
        })
    }
}

#[async_trait]
impl ImageGenerator for ApiClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        observer: &(dyn Fn(AttemptNotice) + Send + Sync),
    ) -> ApiResult<String> {
        if self.config.api_key.trim().is_empty() {
            return Err(ApiError::MissingCredential);
        }

        let content = self.build_content(request).await;
        let payload = self.build_payload(content);

        let limit = self.config.retry_count;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if attempt > 1 {
                let retry = attempt - 1;
                let backoff = calculate_backoff(retry);
                debug!("Backing off for {}ms before retry {}", backoff.as_millis(), retry);
                sleep(backoff).await;
                observer(AttemptNotice::Resumed { retry });
            }

            match self.send_once(&payload, attempt).await {
                Ok(locator) => {
                    if attempt > 1 {
                        info!("Generation succeeded on attempt {}/{}", attempt, limit + 1);
                    }
                    return Ok(locator);
                }
                Err(e) if e.is_retryable() && attempt <= limit => {
                    warn!("Request failed, retrying ({}/{}): {}", attempt, limit, e);
                    observer(AttemptNotice::Retrying {
                        retry: attempt,
                        limit,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Request failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn test_config(server_url: &str, retry_count: u32) -> ApiClientConfig {
        ApiClientConfig {
            api_key: "test-key".to_string(),
            retry_count,
            endpoint_override: Some(format!("{}/v1/chat/completions", server_url)),
            ..ApiClientConfig::default()
        }
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            reference_images: Vec::new(),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(3), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(4), Duration::from_millis(4000));
        assert_eq!(calculate_backoff(5), Duration::from_millis(8000));
        assert_eq!(calculate_backoff(12), Duration::from_millis(8000));
    }

    #[test]
    fn test_platform_endpoints() {
        assert_eq!(Platform::Yunwu.endpoint(), "https://yunwu.ai/v1/chat/completions");
        assert_eq!(Platform::ApiCore.endpoint(), "https://api.apicore.ai/v1/chat/completions");
        assert_eq!(Platform::ApiYi.endpoint(), "https://vip.apiyi.com/v1/chat/completions");
    }

    #[test]
    fn test_payload_model_per_variant() {
        let client = ApiClient::new(ApiClientConfig {
            model: ModelVariant::NanoBanana,
            ..ApiClientConfig::default()
        })
        .unwrap();
        let payload = client.build_payload(vec![json!({"type": "text", "text": "hi"})]);
        assert_eq!(payload["model"], "gemini-2.5-flash-image-preview");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"][0]["text"], "hi");

        let client = ApiClient::new(ApiClientConfig::default()).unwrap();
        assert_eq!(client.build_payload(Vec::new())["model"], "sora_image");
    }

    #[tokio::test]
    async fn test_content_embeds_local_and_remote_references() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cat.jpg"), [0xFFu8, 0xD8, 0xFF]).unwrap();

        let client = ApiClient::new(ApiClientConfig {
            reference_root: dir.path().to_path_buf(),
            ..ApiClientConfig::default()
        })
        .unwrap();

        let content = client
            .build_content(&GenerationRequest {
                prompt: "a cat".to_string(),
                reference_images: vec![
                    ReferenceImage::local("cat", "cat.jpg"),
                    ReferenceImage::local("gone", "missing.png"),
                    ReferenceImage::remote("castle", "http://h/castle.png"),
                ],
            })
            .await;

        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["text"], "a cat");
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,/9j/");
        assert_eq!(content[2]["image_url"]["url"], "http://h/castle.png");
    }

    #[tokio::test]
    async fn test_generate_success_first_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(json!({"model": "sora_image"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"done [点击下载](http://h/x.png)"}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = ApiClient::new(test_config(&server.url(), 2)).unwrap();
        let notices = Mutex::new(Vec::new());
        let locator = client
            .generate(&request("a cat"), &|notice| notices.lock().push(notice))
            .await
            .unwrap();

        assert_eq!(locator, "http://h/x.png");
        assert!(notices.lock().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_errors_use_every_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("upstream busy")
            .expect(2)
            .create_async()
            .await;

        let client = ApiClient::new(test_config(&server.url(), 1)).unwrap();
        let notices = Mutex::new(Vec::new());
        let err = client
            .generate(&request("a cat"), &|notice| notices.lock().push(notice))
            .await
            .unwrap_err();

        match err {
            ApiError::HttpStatus { status, ref body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "upstream busy");
            }
            other => panic!("unexpected error: {other}"),
        }
        let notices = notices.lock();
        assert_eq!(notices.len(), 2);
        assert!(matches!(notices[0], AttemptNotice::Retrying { retry: 1, limit: 1, .. }));
        assert_eq!(notices[1], AttemptNotice::Resumed { retry: 1 });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_keeps_first_200_chars_of_body() {
        let mut server = mockito::Server::new_async().await;
        let body = "x".repeat(199) + "yz";
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(502)
            .with_body(&body)
            .create_async()
            .await;

        let client = ApiClient::new(test_config(&server.url(), 0)).unwrap();
        let err = client.generate(&request("a cat"), &|_| {}).await.unwrap_err();

        assert_eq!(err.to_string(), format!("HTTP 502: {}y", "x".repeat(199)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unparsable_response_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"I cannot draw that"}}]}"#)
            .expect(2)
            .create_async()
            .await;

        let client = ApiClient::new(test_config(&server.url(), 1)).unwrap();
        let err = client.generate(&request("a cat"), &|_| {}).await.unwrap_err();

        assert!(matches!(err, ApiError::ResponseParse(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_network() {
        let client = ApiClient::new(ApiClientConfig {
            endpoint_override: Some("http://127.0.0.1:9/unused".to_string()),
            ..ApiClientConfig::default()
        })
        .unwrap();
        let err = client.generate(&request("a cat"), &|_| {}).await.unwrap_err();
        assert!(matches!(err, ApiError::MissingCredential));
        assert!(!err.is_retryable());
    }
}
