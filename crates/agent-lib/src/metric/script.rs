//! Script metric backend
//!
//! Runs an operator-supplied script and parses its standard output as a
//! float percent. The script name is resolved against the agent's config
//! directory only; a client can never supply a path of its own.

use super::{require_param, MetricParams, SystemMetric, PARAM_SCRIPT_NAME};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const SCRIPT_MIN_INTERVAL_MS: u64 = 3000;
const SCRIPT_DEFAULT_MAX: f64 = 100.0;

pub struct ScriptMetric {
    script_name: String,
    script_dir: PathBuf,
}

impl ScriptMetric {
    pub fn new(script_dir: &Path) -> Self {
        Self {
            script_name: String::new(),
            script_dir: script_dir.to_path_buf(),
        }
    }

    fn full_path(&self) -> PathBuf {
        self.script_dir.join(&self.script_name)
    }
}

#[async_trait]
impl SystemMetric for ScriptMetric {
    fn configure(&mut self, params: &mut MetricParams) -> Result<()> {
        let name = require_param(PARAM_SCRIPT_NAME, params)?;
        // The name must be a bare file name so it cannot escape the
        // config directory.
        if name.contains('/') || name.contains("..") {
            return Err(AgentError::Config(format!(
                "script name '{name}' must not contain a path"
            )));
        }
        self.script_name = name;
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64> {
        let path = self.full_path();
        let output = Command::new("bash")
            .arg("-c")
            .arg(&path)
            .output()
            .await
            .map_err(|err| {
                AgentError::Sampling(format!(
                    "failed to execute script '{}': {err}",
                    path.display()
                ))
            })?;
        if !output.status.success() {
            return Err(AgentError::Sampling(format!(
                "script '{}' exited with status {}",
                path.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        trimmed.parse::<f64>().map_err(|_| {
            AgentError::Sampling(format!(
                "script '{}' output '{trimmed}' is not a number",
                path.display()
            ))
        })
    }

    fn default_max(&self) -> f64 {
        SCRIPT_DEFAULT_MAX
    }

    fn min_interval_ms(&self) -> u64 {
        SCRIPT_MIN_INTERVAL_MS
    }

    fn describe(&self) -> String {
        format!("script '{}'", self.script_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{body}").unwrap();
    }

    #[test]
    fn test_path_in_script_name_rejected() {
        let dir = std::env::temp_dir();
        let mut metric = ScriptMetric::new(&dir);
        let mut params = MetricParams::new();
        params.insert(PARAM_SCRIPT_NAME.into(), "../evil.sh".into());
        assert!(metric.configure(&mut params).is_err());
        params.insert(PARAM_SCRIPT_NAME.into(), "sub/dir.sh".into());
        assert!(metric.configure(&mut params).is_err());
    }

    #[test]
    fn test_missing_script_name_rejected() {
        let dir = std::env::temp_dir();
        let mut metric = ScriptMetric::new(&dir);
        let mut params = MetricParams::new();
        assert!(metric.configure(&mut params).is_err());
    }

    #[tokio::test]
    async fn test_script_output_parsed_as_float() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "load.sh", "echo 42.5");
        let mut metric = ScriptMetric::new(dir.path());
        let mut params = MetricParams::new();
        params.insert(PARAM_SCRIPT_NAME.into(), "load.sh".into());
        metric.configure(&mut params).unwrap();
        let value = metric.sample().await.unwrap();
        assert!((value - 42.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_non_numeric_script_output_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "bad.sh", "echo not-a-number");
        let mut metric = ScriptMetric::new(dir.path());
        let mut params = MetricParams::new();
        params.insert(PARAM_SCRIPT_NAME.into(), "bad.sh".into());
        metric.configure(&mut params).unwrap();
        assert!(metric.sample().await.is_err());
    }
}
