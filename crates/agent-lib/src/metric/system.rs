//! Host-level metric backends
//!
//! CPU, RAM and disk usage read through `sysinfo`; connection counts come
//! from the `/proc/net` tables directly.

use super::{require_param, MetricParams, SystemMetric, PARAM_DISK_PATH, PARAM_SAMPLING_MS};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::warn;

const CPU_MIN_SAMPLE_MS: u64 = 500;
const CPU_MIN_INTERVAL_MS: u64 = 500;
const RAM_MIN_INTERVAL_MS: u64 = 500;
const DISK_MIN_INTERVAL_MS: u64 = 3000;
const NETCONN_MIN_INTERVAL_MS: u64 = 3000;

const PERCENT_MAX: f64 = 100.0;
const NETCONN_DEFAULT_MAX: f64 = 2000.0;

/// CPU utilisation averaged across all cores over a sampling window.
pub struct CpuMetric {
    sample_ms: u64,
    system: System,
}

impl CpuMetric {
    pub fn new() -> Self {
        Self {
            sample_ms: CPU_MIN_SAMPLE_MS,
            system: System::new(),
        }
    }
}

impl Default for CpuMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemMetric for CpuMetric {
    fn configure(&mut self, params: &mut MetricParams) -> Result<()> {
        let mut clamp_reason = None;
        match params.get(PARAM_SAMPLING_MS) {
            None => clamp_reason = Some("no sample time specified"),
            Some(value) => {
                self.sample_ms = value.trim().parse().map_err(|_| {
                    AgentError::Config(format!("invalid '{PARAM_SAMPLING_MS}' value '{value}'"))
                })?;
                // A very short CPU window both distorts the reading and
                // costs scheduler churn, so force a floor.
                if self.sample_ms < CPU_MIN_SAMPLE_MS {
                    clamp_reason = Some("sample time too low");
                }
            }
        }
        if let Some(reason) = clamp_reason {
            warn!(
                metric = "cpu",
                "{reason}; using default of {CPU_MIN_SAMPLE_MS}ms"
            );
            self.sample_ms = CPU_MIN_SAMPLE_MS;
            params.insert(PARAM_SAMPLING_MS.into(), CPU_MIN_SAMPLE_MS.to_string());
        }
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64> {
        // Two refreshes bracketing the window give per-core utilisation
        // over that window; averaging them ourselves behaves consistently
        // across platforms.
        self.system.refresh_cpu();
        tokio::time::sleep(Duration::from_millis(self.sample_ms)).await;
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(AgentError::Sampling("no CPUs reported".into()));
        }
        let total: f64 = cpus.iter().map(|cpu| f64::from(cpu.cpu_usage())).sum();
        Ok(total / cpus.len() as f64)
    }

    fn default_max(&self) -> f64 {
        PERCENT_MAX
    }

    fn min_interval_ms(&self) -> u64 {
        CPU_MIN_INTERVAL_MS
    }

    fn describe(&self) -> String {
        "CPU".to_string()
    }
}

/// RAM used-percent.
pub struct MemoryMetric {
    system: System,
}

impl MemoryMetric {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemMetric for MemoryMetric {
    fn configure(&mut self, _params: &mut MetricParams) -> Result<()> {
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(AgentError::Sampling("total memory reported as zero".into()));
        }
        Ok(self.system.used_memory() as f64 / total as f64 * PERCENT_MAX)
    }

    fn default_max(&self) -> f64 {
        PERCENT_MAX
    }

    fn min_interval_ms(&self) -> u64 {
        RAM_MIN_INTERVAL_MS
    }

    fn describe(&self) -> String {
        "RAM".to_string()
    }
}

/// Used-percent of the filesystem holding a configured path.
pub struct DiskUsageMetric {
    disk_path: PathBuf,
    disks: Disks,
}

impl DiskUsageMetric {
    pub fn new() -> Self {
        Self {
            disk_path: PathBuf::new(),
            disks: Disks::new(),
        }
    }
}

impl Default for DiskUsageMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemMetric for DiskUsageMetric {
    fn configure(&mut self, params: &mut MetricParams) -> Result<()> {
        self.disk_path = PathBuf::from(require_param(PARAM_DISK_PATH, params)?);
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64> {
        self.disks.refresh_list();
        // The filesystem owning the path is the one with the longest mount
        // point prefix.
        let disk = self
            .disks
            .iter()
            .filter(|disk| self.disk_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                AgentError::Sampling(format!(
                    "no filesystem found for path '{}'",
                    self.disk_path.display()
                ))
            })?;
        let total = disk.total_space();
        if total == 0 {
            return Err(AgentError::Sampling("filesystem reports zero size".into()));
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 / total as f64 * PERCENT_MAX)
    }

    fn default_max(&self) -> f64 {
        PERCENT_MAX
    }

    fn min_interval_ms(&self) -> u64 {
        DISK_MIN_INTERVAL_MS
    }

    fn describe(&self) -> String {
        format!("disk-usage, path '{}'", self.disk_path.display())
    }
}

/// Absolute count of network connections on the host.
pub struct NetConnectionsMetric;

impl NetConnectionsMetric {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetConnectionsMetric {
    fn default() -> Self {
        Self::new()
    }
}

const PROC_NET_TABLES: [&str; 4] = [
    "/proc/net/tcp",
    "/proc/net/tcp6",
    "/proc/net/udp",
    "/proc/net/udp6",
];

#[async_trait]
impl SystemMetric for NetConnectionsMetric {
    fn configure(&mut self, _params: &mut MetricParams) -> Result<()> {
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64> {
        let mut count = 0usize;
        let mut any_table = false;
        for table in PROC_NET_TABLES {
            match tokio::fs::read_to_string(table).await {
                Ok(contents) => {
                    any_table = true;
                    // Each table starts with a single header line.
                    count += contents.lines().count().saturating_sub(1);
                }
                // A protocol table may be absent (e.g. IPv6 disabled).
                Err(_) => continue,
            }
        }
        if !any_table {
            return Err(AgentError::Sampling(
                "no /proc/net connection tables readable".into(),
            ));
        }
        Ok(count as f64)
    }

    fn default_max(&self) -> f64 {
        NETCONN_DEFAULT_MAX
    }

    fn min_interval_ms(&self) -> u64 {
        NETCONN_MIN_INTERVAL_MS
    }

    fn describe(&self) -> String {
        "netconn".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sample_in_percent_range() {
        let mut metric = MemoryMetric::new();
        let value = metric.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[tokio::test]
    async fn test_netconn_sample_is_nonnegative_count() {
        let mut metric = NetConnectionsMetric::new();
        let value = metric.sample().await.unwrap();
        assert!(value >= 0.0);
        assert_eq!(value.fract(), 0.0);
    }

    #[tokio::test]
    async fn test_disk_usage_for_root() {
        let mut metric = DiskUsageMetric::new();
        let mut params = MetricParams::new();
        params.insert(PARAM_DISK_PATH.into(), "/".into());
        metric.configure(&mut params).unwrap();
        let value = metric.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn test_cpu_sampling_window_clamped() {
        let mut metric = CpuMetric::new();
        let mut params = MetricParams::new();
        params.insert(PARAM_SAMPLING_MS.into(), "10".into());
        metric.configure(&mut params).unwrap();
        assert_eq!(metric.sample_ms, CPU_MIN_SAMPLE_MS);
        // The clamped value is written back for persistence.
        assert_eq!(
            params.get(PARAM_SAMPLING_MS).map(String::as_str),
            Some("500")
        );
    }

    #[test]
    fn test_cpu_invalid_sampling_value_rejected() {
        let mut metric = CpuMetric::new();
        let mut params = MetricParams::new();
        params.insert(PARAM_SAMPLING_MS.into(), "fast".into());
        assert!(metric.configure(&mut params).is_err());
    }
}
