//! Configuration persistence
//!
//! The agent's full state lives in a single JSON document
//! (`agent-config.json`) under the config directory. The document is loaded
//! at boot (or created with defaults) and rewritten after every successful
//! API mutation. A failure to save never invalidates the in-memory state.

use crate::error::{AgentError, Result};
use crate::metric::{MetricKind, MetricParams, PARAM_SAMPLING_MS};
use crate::responder::{FeedbackSource, ResponderProtocol, ThresholdMode};
use crate::util::random_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "agent-config.json";
pub const LOG_FILE_NAME: &str = "agent.log";
pub const DEFAULT_CONFIG_DIR: &str = "/opt/lbfeedback";
pub const DEFAULT_LOG_DIR: &str = "/var/log/lbfeedback";

/// Bytes of randomness in a freshly generated API key (128 bits).
pub const API_KEY_BYTES: usize = 16;

pub const DEFAULT_FEEDBACK_PORT: u16 = 3333;
pub const DEFAULT_API_PORT: u16 = 3334;
pub const DEFAULT_COMMAND_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1000;

/// The persisted agent document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigDocument {
    #[serde(rename = "log-dir", default)]
    pub log_dir: String,
    #[serde(rename = "api-key", default)]
    pub api_key: String,
    #[serde(default)]
    pub monitors: BTreeMap<String, MonitorConfig>,
    #[serde(default)]
    pub responders: BTreeMap<String, ResponderConfig>,
}

/// Persisted shape of a system monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(rename = "metric-type")]
    pub metric_type: MetricKind,
    #[serde(rename = "interval-ms", default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(
        rename = "metric-config",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub params: MetricParams,
    #[serde(rename = "smart-shape", default)]
    pub smart_shape: bool,
}

/// Persisted shape of a feedback responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponderConfig {
    pub protocol: ResponderProtocol,
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,
    #[serde(rename = "request-timeout", default = "default_timeout_secs")]
    pub request_timeout: u64,
    #[serde(rename = "response-timeout", default = "default_timeout_secs")]
    pub response_timeout: u64,
    #[serde(rename = "command-list", default = "default_command_list")]
    pub command_list: String,
    #[serde(rename = "command-interval", default = "default_command_interval")]
    pub command_interval: u64,
    #[serde(rename = "threshold-mode", default)]
    pub threshold_mode: ThresholdMode,
    #[serde(rename = "threshold-max", default)]
    pub threshold_max: u8,
    #[serde(rename = "offline-interval", default = "default_true")]
    pub offline_interval: bool,
    #[serde(rename = "log-state-changes", default)]
    pub log_state_changes: bool,
    #[serde(rename = "feedback-sources", default)]
    pub feedback_sources: BTreeMap<String, FeedbackSource>,
}

fn default_interval_ms() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MS
}

fn default_ip() -> String {
    "*".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_command_list() -> String {
    "default".to_string()
}

fn default_command_interval() -> u64 {
    DEFAULT_COMMAND_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

/// Resolves the config directory from the `LBFEEDBACK_CONFIG_DIR`
/// environment override, falling back to the platform default.
pub fn resolve_config_dir() -> PathBuf {
    env_override("config_dir").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Resolves the log directory override (`LBFEEDBACK_LOG_DIR`), if any.
pub fn resolve_log_dir_override() -> Option<PathBuf> {
    env_override("log_dir")
}

fn env_override(key: &str) -> Option<PathBuf> {
    let settings = config::Config::builder()
        .add_source(config::Environment::with_prefix("LBFEEDBACK"))
        .build()
        .ok()?;
    settings.get_string(key).ok().map(PathBuf::from)
}

/// The default service graph: one CPU monitor, one TCP responder on
/// `*:3333` fed by it, and the API responder on `127.0.0.1:3334`.
pub fn default_document() -> ConfigDocument {
    let mut monitors = BTreeMap::new();
    let mut params = MetricParams::new();
    params.insert(PARAM_SAMPLING_MS.into(), "500".into());
    monitors.insert(
        "cpu".to_string(),
        MonitorConfig {
            metric_type: MetricKind::Cpu,
            interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            params,
            smart_shape: false,
        },
    );

    let mut sources = BTreeMap::new();
    sources.insert("cpu".to_string(), FeedbackSource::new(1.0, 100, 0));

    let mut responders = BTreeMap::new();
    responders.insert(
        "default".to_string(),
        ResponderConfig {
            protocol: ResponderProtocol::Tcp,
            ip: default_ip(),
            port: DEFAULT_FEEDBACK_PORT,
            request_timeout: DEFAULT_TIMEOUT_SECS,
            response_timeout: DEFAULT_TIMEOUT_SECS,
            command_list: default_command_list(),
            command_interval: DEFAULT_COMMAND_INTERVAL_SECS,
            threshold_mode: ThresholdMode::default(),
            threshold_max: 0,
            offline_interval: true,
            log_state_changes: false,
            feedback_sources: sources,
        },
    );
    responders.insert("api".to_string(), default_api_responder());

    ConfigDocument {
        log_dir: DEFAULT_LOG_DIR.to_string(),
        api_key: random_hex(API_KEY_BYTES),
        monitors,
        responders,
    }
}

/// The dedicated control-plane responder.
pub fn default_api_responder() -> ResponderConfig {
    ResponderConfig {
        protocol: ResponderProtocol::HttpsApi,
        ip: "127.0.0.1".to_string(),
        port: DEFAULT_API_PORT,
        request_timeout: DEFAULT_TIMEOUT_SECS,
        response_timeout: DEFAULT_TIMEOUT_SECS,
        command_list: "none".to_string(),
        command_interval: DEFAULT_COMMAND_INTERVAL_SECS,
        threshold_mode: ThresholdMode::None,
        threshold_max: 0,
        offline_interval: true,
        log_state_changes: false,
        feedback_sources: BTreeMap::new(),
    }
}

/// Loads the config file if it exists.
pub fn load_document(config_dir: &Path) -> Result<Option<ConfigDocument>> {
    let path = config_dir.join(CONFIG_FILE_NAME);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AgentError::Persistence(format!(
                "failed to read '{}': {err}",
                path.display()
            )))
        }
    };
    let document = serde_json::from_str(&contents)
        .map_err(|err| AgentError::Config(format!("JSON configuration is invalid: {err}")))?;
    Ok(Some(document))
}

/// Loads the config file, creating it with defaults when missing. Returns
/// the document and whether it was freshly created.
pub fn load_or_create(config_dir: &Path) -> Result<(ConfigDocument, bool)> {
    if let Some(document) = load_document(config_dir)? {
        info!(path = %config_dir.join(CONFIG_FILE_NAME).display(), "configured from JSON");
        return Ok((document, false));
    }
    let document = default_document();
    save_document(config_dir, &document)?;
    info!(
        path = %config_dir.join(CONFIG_FILE_NAME).display(),
        "config file not found; wrote defaults"
    );
    Ok((document, true))
}

/// Writes the document, creating the config directory if missing.
pub fn save_document(config_dir: &Path, document: &ConfigDocument) -> Result<()> {
    if std::fs::read_dir(config_dir).is_err() {
        std::fs::create_dir_all(config_dir).map_err(|err| {
            AgentError::Persistence(format!(
                "could not create config directory '{}': {err}",
                config_dir.display()
            ))
        })?;
        info!(dir = %config_dir.display(), "created config directory");
    }
    let path = config_dir.join(CONFIG_FILE_NAME);
    let created = !path.exists();
    let json = serde_json::to_string_pretty(document)
        .map_err(|err| AgentError::Persistence(format!("failed to serialise config: {err}")))?;
    std::fs::write(&path, json).map_err(|err| {
        if created {
            // A failed first write must not leave an empty config file
            // behind; removal itself is best-effort.
            let _ = std::fs::remove_file(&path);
        }
        AgentError::Persistence(format!("failed to write '{}': {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_shape() {
        let document = default_document();
        assert_eq!(document.api_key.len(), API_KEY_BYTES * 2);
        assert!(document.monitors.contains_key("cpu"));
        let default = &document.responders["default"];
        assert_eq!(default.protocol, ResponderProtocol::Tcp);
        assert_eq!(default.port, DEFAULT_FEEDBACK_PORT);
        assert_eq!(default.ip, "*");
        assert!(default.feedback_sources.contains_key("cpu"));
        let api = &document.responders["api"];
        assert_eq!(api.protocol, ResponderProtocol::HttpsApi);
        assert_eq!(api.port, DEFAULT_API_PORT);
        assert!(api.feedback_sources.is_empty());
    }

    #[test]
    fn test_round_trip_is_identity() {
        let document = default_document();
        let json = serde_json::to_string_pretty(&document).unwrap();
        let reparsed: ConfigDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(document, reparsed);
    }

    #[test]
    fn test_load_or_create_writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let (created_doc, created) = load_or_create(dir.path()).unwrap();
        assert!(created);
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());

        let (loaded_doc, created_again) = load_or_create(dir.path()).unwrap();
        assert!(!created_again);
        assert_eq!(created_doc, loaded_doc);
    }

    #[test]
    fn test_save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        save_document(&nested, &default_document()).unwrap();
        assert!(nested.join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_malformed_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        assert!(load_document(dir.path()).is_err());
    }

    #[test]
    fn test_responder_defaults_fill_in() {
        let json = r#"{"protocol": "tcp", "port": 3333}"#;
        let parsed: ResponderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.ip, "*");
        assert_eq!(parsed.command_list, "default");
        assert_eq!(parsed.command_interval, DEFAULT_COMMAND_INTERVAL_SECS);
        assert!(parsed.offline_interval);
        assert_eq!(parsed.threshold_mode, ThresholdMode::None);
    }
}
