//! HTTP-backed human detector
//!
//! Forwards each image URL to a detection service and reads back a boolean verdict.

use std::time::Duration;

use async_trait::async_trait;
use rb_common::WorkerError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::HumanDetector;

/// Detection service client configuration
#[derive(Debug, Clone)]
pub struct HttpDetectorConfig {
    /// Endpoint receiving `{"url": ...}` requests
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpDetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/detect".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    human_detected: bool,
}

pub struct HttpHumanDetector {
    config: HttpDetectorConfig,
    client: reqwest::Client,
}

impl HttpHumanDetector {
    pub fn new(config: HttpDetectorConfig) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WorkerError::InvalidInput(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl HumanDetector for HttpHumanDetector {
    async fn detect(&self, url: &str) -> Result<bool, WorkerError> {
        debug!(image_url = %url, endpoint = %self.config.endpoint, "Requesting human detection");

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&DetectRequest { url })
            .send()
            .await
            .map_err(|e| {
                warn!(image_url = %url, error = %e, "Detection request failed");
                WorkerError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(image_url = %url, status = %status, "Detector returned error status");
            return Err(WorkerError::InvalidResponse(format!("HTTP {}", status.as_u16())));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?;

        Ok(body.human_detected)
    }
}
