//! Request and response bodies as they appear in the OpenAPI document.
//!
//! Handlers read raw bytes and reply with the shared reply envelope; these types
//! only describe the wire shapes.

use rb_common::ResultItem;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Two operands to add
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddRequest {
    #[schema(value_type = f64)]
    pub x: serde_json::Value,
    #[schema(value_type = f64)]
    pub y: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddResponse {
    /// Integer when both operands are integers, otherwise a float
    #[schema(value_type = f64)]
    pub result: serde_json::Value,
}

/// One media reference; only `type == "image"` entries with a `url` are examined
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MediaItem {
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckHumanRequest {
    pub media: Vec<MediaItem>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckHumanResponse {
    pub results: Vec<ResultItem>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Simple health response for basic health check
#[derive(Debug, Serialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}
