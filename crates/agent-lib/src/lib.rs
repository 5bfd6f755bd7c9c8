//! Core library for the lbfeedback agent
//!
//! This crate provides:
//! - Periodic system metric monitors feeding cumulative statistics models
//! - Feedback responders serving availability and HAProxy agent commands
//!   over TCP, HTTP and HTTPS
//! - The HTTPS JSON control plane and its mutation handlers
//! - Configuration persistence and self-signed TLS material

pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod connector;
pub mod error;
pub mod metric;
pub mod monitor;
pub mod responder;
pub mod service;
pub mod stats;
pub mod tls;
pub mod util;

pub use agent::{AgentSignal, FeedbackAgent};
pub use api::schema::{ApiRequest, ApiResponse, ServiceStatus};
pub use api::{SERVICE_NAME, VERSION};
pub use config::{ConfigDocument, MonitorConfig, ResponderConfig};
pub use error::{AgentError, LifecycleError, Result};
pub use metric::{MetricKind, MetricParams};
pub use monitor::SystemMonitor;
pub use responder::{FeedbackResponder, FeedbackSource, ResponderProtocol, ThresholdMode};
pub use service::RunState;
pub use stats::StatisticsModel;
