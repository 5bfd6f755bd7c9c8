//! System metrics for the monitor service
//!
//! A metric reports a load score to its owning monitor. Five kinds are
//! supported: CPU utilisation, RAM usage, disk usage, connection count and
//! an operator-supplied script. Each kind declares its own minimum sampling
//! interval and default ceiling.

mod script;
mod system;

pub use script::ScriptMetric;
pub use system::{CpuMetric, DiskUsageMetric, MemoryMetric, NetConnectionsMetric};

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Metric-type-specific key/value configuration.
pub type MetricParams = BTreeMap<String, String>;

/// Parameter key for the CPU sampling window in milliseconds.
pub const PARAM_SAMPLING_MS: &str = "sampling-ms";
/// Parameter key for the script metric's file name.
pub const PARAM_SCRIPT_NAME: &str = "script-name";
/// Parameter key for the disk usage metric's target path.
pub const PARAM_DISK_PATH: &str = "disk-path";

/// The supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    Cpu,
    Ram,
    DiskUsage,
    Netconn,
    Script,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Ram => "ram",
            MetricKind::DiskUsage => "disk-usage",
            MetricKind::Netconn => "netconn",
            MetricKind::Script => "script",
        }
    }
}

impl FromStr for MetricKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(MetricKind::Cpu),
            "ram" => Ok(MetricKind::Ram),
            "disk-usage" => Ok(MetricKind::DiskUsage),
            "netconn" => Ok(MetricKind::Netconn),
            "script" => Ok(MetricKind::Script),
            other => Err(AgentError::Config(format!(
                "unrecognised metric type: '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric capable of reporting a load score to a monitor.
#[async_trait]
pub trait SystemMetric: Send {
    /// Validates and applies the metric's parameters. May rewrite a
    /// parameter in place when a value is clamped, so the persisted config
    /// reflects what actually runs.
    fn configure(&mut self, params: &mut MetricParams) -> Result<()>;

    /// Takes one sample. May suspend for the length of the metric's
    /// sampling window.
    async fn sample(&mut self) -> Result<f64>;

    /// Ceiling reported while no sample has completed yet.
    fn default_max(&self) -> f64;

    /// Minimum sampling interval this metric tolerates, in milliseconds.
    fn min_interval_ms(&self) -> u64;

    /// Human description for log lines.
    fn describe(&self) -> String;
}

/// Builds and configures a metric of the given kind.
///
/// The config directory is only used by the script metric: script names are
/// resolved against it and never taken from a client-supplied path.
pub fn build_metric(
    kind: MetricKind,
    params: &mut MetricParams,
    config_dir: &Path,
) -> Result<Box<dyn SystemMetric>> {
    let mut metric: Box<dyn SystemMetric> = match kind {
        MetricKind::Cpu => Box::new(CpuMetric::new()),
        MetricKind::Ram => Box::new(MemoryMetric::new()),
        MetricKind::DiskUsage => Box::new(DiskUsageMetric::new()),
        MetricKind::Netconn => Box::new(NetConnectionsMetric::new()),
        MetricKind::Script => Box::new(ScriptMetric::new(config_dir)),
    };
    metric.configure(params).map_err(|err| {
        AgentError::Config(format!(
            "configuration failed for metric type '{kind}': {err}"
        ))
    })?;
    Ok(metric)
}

pub(crate) fn require_param(key: &str, params: &MetricParams) -> Result<String> {
    params
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AgentError::Config(format!("missing parameter: '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kind_round_trip() {
        for kind in [
            MetricKind::Cpu,
            MetricKind::Ram,
            MetricKind::DiskUsage,
            MetricKind::Netconn,
            MetricKind::Script,
        ] {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_metric_kind_rejected() {
        assert!("unknown".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_build_metric_validates_params() {
        let dir = std::env::temp_dir();
        // disk-usage requires a disk-path parameter
        let mut params = MetricParams::new();
        assert!(build_metric(MetricKind::DiskUsage, &mut params, &dir).is_err());

        params.insert(PARAM_DISK_PATH.into(), "/".into());
        assert!(build_metric(MetricKind::DiskUsage, &mut params, &dir).is_ok());
    }

    #[test]
    fn test_require_param_rejects_blank() {
        let mut params = MetricParams::new();
        params.insert("key".into(), "   ".into());
        assert!(require_param("key", &params).is_err());
        params.insert("key".into(), "value".into());
        assert_eq!(require_param("key", &params).unwrap(), "value");
    }
}
