//! Synthesis service HTTP client.

use async_trait::async_trait;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{SynthError, SynthResult};
use crate::types::{AvatarRequest, HealthResponse, SynthesizedMedia, TtsRequest};

const DURATION_HEADER: &str = "x-media-duration";

/// Configuration for the synthesis client.
#[derive(Debug, Clone)]
pub struct SynthClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Base delay between retries, doubled per attempt.
    pub retry_delay: Duration,
}

impl Default for SynthClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            timeout: Duration::from_secs(600), // avatar renders are slow
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl SynthClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SYNTH_SERVICE_URL").unwrap_or(defaults.base_url),
            timeout: std::env::var("SYNTH_SERVICE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: std::env::var("SYNTH_SERVICE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_delay: defaults.retry_delay,
        }
    }
}

/// Speech and avatar synthesis.
#[async_trait]
pub trait SynthBackend: Send + Sync {
    async fn synthesize_speech(&self, request: &TtsRequest) -> SynthResult<SynthesizedMedia>;

    async fn render_avatar(&self, request: &AvatarRequest) -> SynthResult<SynthesizedMedia>;
}

/// HTTP client for the synthesis service.
pub struct SynthClient {
    http: Client,
    config: SynthClientConfig,
}

impl SynthClient {
    pub fn new(config: SynthClientConfig) -> SynthResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(SynthError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> SynthResult<Self> {
        Self::new(SynthClientConfig::from_env())
    }

    /// Check if the service is healthy.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthResponse>().await {
                    Ok(health) => health.status == "healthy" || health.status == "ok",
                    Err(e) => {
                        warn!("Synthesis health response unreadable: {}", e);
                        false
                    }
                }
            }
            Ok(response) => {
                warn!("Synthesis service health check failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("Synthesis service health check error: {}", e);
                false
            }
        }
    }

    async fn post_media<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        fallback_content_type: &str,
    ) -> SynthResult<SynthesizedMedia> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!("Sending synthesis request to {}", url);

        self.with_retry(|| async {
            let response = self
                .http
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        SynthError::Timeout(self.config.timeout.as_secs())
                    } else {
                        SynthError::Network(e)
                    }
                })?;
            read_media(response, fallback_content_type).await
        })
        .await
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> SynthResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SynthResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt);
                    warn!(
                        "Synthesis request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl SynthBackend for SynthClient {
    async fn synthesize_speech(&self, request: &TtsRequest) -> SynthResult<SynthesizedMedia> {
        self.post_media("/tts/synthesize", request, request.format.content_type())
            .await
    }

    async fn render_avatar(&self, request: &AvatarRequest) -> SynthResult<SynthesizedMedia> {
        self.post_media("/avatar/render", request, request.format.content_type())
            .await
    }
}

async fn read_media(response: Response, fallback_content_type: &str) -> SynthResult<SynthesizedMedia> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, body));
    }

    let headers = response.headers();
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| fallback_content_type.to_string());
    let duration_secs = headers
        .get(DURATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());

    let bytes = response.bytes().await?.to_vec();
    if bytes.is_empty() {
        return Err(SynthError::InvalidResponse("empty media body".to_string()));
    }

    Ok(SynthesizedMedia {
        bytes,
        content_type,
        duration_secs,
    })
}

fn classify_status(status: StatusCode, body: String) -> SynthError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SynthError::ServiceUnavailable(format!("{}: {}", status, body))
    } else {
        SynthError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
