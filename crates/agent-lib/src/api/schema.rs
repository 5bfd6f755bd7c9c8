//! JSON schema for the control-plane API
//!
//! Field names here are the canonical wire names; both the persisted
//! config and the CLI client depend on them staying stable.

use crate::config::ConfigDocument;
use crate::metric::MetricParams;
use crate::responder::FeedbackSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiRequest {
    #[serde(rename = "api-key", skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub target_type: String,
    #[serde(rename = "target-name", skip_serializing_if = "String::is_empty")]
    pub target_name: String,

    // Responder fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "request-timeout", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(rename = "response-timeout", skip_serializing_if = "Option::is_none")]
    pub response_timeout: Option<u64>,
    #[serde(rename = "command-list", skip_serializing_if = "Option::is_none")]
    pub command_list: Option<String>,
    #[serde(rename = "command-interval", skip_serializing_if = "Option::is_none")]
    pub command_interval: Option<u64>,
    #[serde(rename = "threshold-mode", skip_serializing_if = "Option::is_none")]
    pub threshold_mode: Option<String>,
    #[serde(rename = "threshold-max", skip_serializing_if = "Option::is_none")]
    pub threshold_max: Option<i64>,
    #[serde(rename = "log-state-changes", skip_serializing_if = "Option::is_none")]
    pub log_state_changes: Option<bool>,
    #[serde(rename = "feedback-sources", skip_serializing_if = "Option::is_none")]
    pub feedback_sources: Option<BTreeMap<String, FeedbackSource>>,

    // Source fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub significance: Option<f64>,
    #[serde(rename = "max-value", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,

    // Monitor fields
    #[serde(rename = "metric-type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(rename = "interval-ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(rename = "metric-config", skip_serializing_if = "Option::is_none")]
    pub metric_config: Option<MetricParams>,
    #[serde(rename = "smart-shape", skip_serializing_if = "Option::is_none")]
    pub smart_shape: Option<bool>,
}

/// A response sent back to a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiResponse {
    #[serde(rename = "service-name")]
    pub service_name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ApiRequest>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(rename = "error-name", skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "current-config", skip_serializing_if = "Option::is_none")]
    pub current_config: Option<ConfigDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<ServiceStatus>>,
    #[serde(rename = "feedback-sources", skip_serializing_if = "Option::is_none")]
    pub feedback_sources: Option<BTreeMap<String, FeedbackSource>>,
}

/// One row of the `status` action's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    #[serde(rename = "type")]
    pub service_type: String,
    pub name: String,
    pub status: String,
}
