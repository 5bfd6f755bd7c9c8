//! Error types for the feedback agent
//!
//! This module defines all error kinds used throughout the library.

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid or malformed configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Service lifecycle violation
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    /// Named service or source does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Missing or mismatched API key
    #[error("invalid or missing API key")]
    BadApiKey,

    /// A metric sample failed; local to the owning monitor
    #[error("failed to sample metric: {0}")]
    Sampling(String),

    /// A listener could not start or failed while serving
    #[error("listener failure: {0}")]
    Connector(String),

    /// The configuration file could not be written
    #[error("failed to persist configuration: {0}")]
    Persistence(String),
}

/// Errors raised by service start/stop/add/delete transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{kind} '{name}' is already running")]
    AlreadyRunning { kind: &'static str, name: String },

    #[error("{kind} '{name}' is not running")]
    NotRunning { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    NameCollision { kind: &'static str, name: String },

    #[error("cannot delete monitor '{monitor}': currently in use by responder '{responder}'")]
    MonitorInUse { monitor: String, responder: String },

    #[error("cannot delete the API responder")]
    ApiResponderProtected,
}

impl AgentError {
    /// Short machine-readable name for the API response envelope.
    pub fn error_name(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config-error",
            AgentError::Lifecycle(_) => "lifecycle-error",
            AgentError::NotFound { .. } => "not-found",
            AgentError::BadApiKey => "bad-api-key",
            AgentError::Sampling(_) => "sampling-error",
            AgentError::Connector(_) => "connector-error",
            AgentError::Persistence(_) => "persistence-error",
        }
    }

    /// Joins a secondary error onto this one, preserving both messages.
    ///
    /// Used when a save failure must not mask the primary result of a
    /// request.
    pub fn join(self, other: AgentError) -> AgentError {
        AgentError::Config(format!("{self}; {other}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_are_stable() {
        assert_eq!(AgentError::BadApiKey.error_name(), "bad-api-key");
        assert_eq!(
            AgentError::Config("x".into()).error_name(),
            "config-error"
        );
        assert_eq!(
            AgentError::NotFound {
                kind: "monitor",
                name: "cpu".into()
            }
            .error_name(),
            "not-found"
        );
    }

    #[test]
    fn test_join_preserves_both_messages() {
        let primary = AgentError::Config("bad port".into());
        let joined = primary.join(AgentError::Persistence("disk full".into()));
        let text = joined.to_string();
        assert!(text.contains("bad port"));
        assert!(text.contains("disk full"));
    }
}
