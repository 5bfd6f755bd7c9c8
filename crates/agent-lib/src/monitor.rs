//! System metric monitor service
//!
//! A monitor runs a single metric on a periodic, interruptible timer and
//! feeds each sample into its statistics model. The sampling task polls a
//! stop channel between short sleep slices so that shutdown latency stays
//! bounded regardless of how long the sampling interval is.

use crate::config::MonitorConfig;
use crate::error::{AgentError, LifecycleError, Result};
use crate::metric::{build_metric, MetricKind, MetricParams, SystemMetric};
use crate::service::RunState;
use crate::stats::StatisticsModel;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Upper bound on how long the sampler sleeps between stop-channel polls.
const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

/// A monitor measuring one metric on the local system.
pub struct SystemMonitor {
    name: String,
    config_dir: PathBuf,
    // Handle to the owning Arc so the sampling task can hold the monitor
    // alive; always upgradable while a caller holds the service.
    weak: Weak<SystemMonitor>,
    state: tokio::sync::Mutex<MonitorState>,
}

struct MonitorState {
    metric_type: MetricKind,
    interval_ms: u64,
    params: MetricParams,
    shaping: bool,
    model: StatisticsModel,
    run_state: RunState,
    default_max: f64,
    stop_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl SystemMonitor {
    pub fn new(
        name: impl Into<String>,
        config: MonitorConfig,
        config_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            config_dir: config_dir.into(),
            weak: weak.clone(),
            state: tokio::sync::Mutex::new(MonitorState {
                metric_type: config.metric_type,
                interval_ms: config.interval_ms,
                params: config.params,
                shaping: config.smart_shape,
                model: StatisticsModel::new(config.smart_shape),
                run_state: RunState::Stopped,
                default_max: 100.0,
                stop_tx: None,
                task: None,
                last_error: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validates the metric parameters and raises a too-short sampling
    /// interval to the metric's minimum.
    pub async fn initialise(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut params = state.params.clone();
        let metric = build_metric(state.metric_type, &mut params, &self.config_dir)?;
        state.params = params;
        state.default_max = metric.default_max();
        let min_interval = metric.min_interval_ms();
        if state.interval_ms < min_interval {
            warn!(
                monitor = %self.name,
                requested_ms = state.interval_ms,
                minimum_ms = min_interval,
                "sampling interval below metric minimum; raising"
            );
            state.interval_ms = min_interval;
        }
        Ok(())
    }

    /// Launches the sampling task.
    pub async fn start(&self) -> Result<()> {
        let handle = self
            .weak
            .upgrade()
            .ok_or_else(|| AgentError::Config("monitor handle dropped".into()))?;
        let mut state = self.state.lock().await;
        if state.run_state != RunState::Stopped {
            return Err(LifecycleError::AlreadyRunning {
                kind: "monitor",
                name: self.name.clone(),
            }
            .into());
        }
        state.run_state = RunState::Starting;
        state.last_error = None;
        let mut params = state.params.clone();
        let metric = match build_metric(state.metric_type, &mut params, &self.config_dir) {
            Ok(metric) => metric,
            Err(err) => {
                state.run_state = RunState::Stopped;
                state.last_error = Some(err.to_string());
                error!(monitor = %self.name, "failed to start: {err}");
                return Err(err);
            }
        };
        state.params = params;
        state.default_max = metric.default_max();
        let min_interval = metric.min_interval_ms();
        if state.interval_ms < min_interval {
            state.interval_ms = min_interval;
        }
        let description = metric.describe();
        let interval = Duration::from_millis(state.interval_ms);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        // The sampling loop runs in its own task so a panicking metric
        // backend is captured here instead of dying silently.
        let task = tokio::spawn({
            let monitor = handle.clone();
            async move {
                let sampler = tokio::spawn(run_loop(handle, metric, stop_rx, interval));
                if let Err(join_err) = sampler.await {
                    if join_err.is_panic() {
                        monitor
                            .record_sample_error(AgentError::Sampling(format!(
                                "sampling task terminated abnormally: {join_err}"
                            )))
                            .await;
                    }
                    monitor.mark_stopped().await;
                }
            }
        });
        state.stop_tx = Some(stop_tx);
        state.task = Some(task);
        state.run_state = RunState::Running;
        info!(
            monitor = %self.name,
            interval_ms = state.interval_ms,
            "system metric monitor is running ({description})"
        );
        Ok(())
    }

    /// Signals the sampling task to stop and waits for its acknowledgement.
    pub async fn stop(&self) -> Result<()> {
        let (stop_tx, task) = {
            let mut state = self.state.lock().await;
            if !state.run_state.is_running() {
                return Err(LifecycleError::NotRunning {
                    kind: "monitor",
                    name: self.name.clone(),
                }
                .into());
            }
            state.run_state = RunState::Stopping;
            (state.stop_tx.take(), state.task.take())
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(()).await;
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state.lock().await.run_state = RunState::Stopped;
        info!(monitor = %self.name, "system metric monitor has stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    pub async fn run_state(&self) -> RunState {
        self.state.lock().await.run_state
    }

    pub async fn is_running(&self) -> bool {
        self.run_state().await.is_running()
    }

    /// The current integer load for this monitor: the model's result once
    /// at least one sample has completed, the metric's default ceiling
    /// before then.
    pub async fn result(&self) -> i64 {
        let state = self.state.lock().await;
        if state.model.has_observations() {
            state.model.result()
        } else {
            state.default_max.round() as i64
        }
    }

    /// Feeds a completed sample into the model. Clears a latched sampling
    /// error, logging the recovery once.
    pub async fn submit_sample(&self, value: f64) {
        let mut state = self.state.lock().await;
        state.model.observe(value);
        if state.last_error.take().is_some() {
            info!(monitor = %self.name, "sampling has now succeeded; error cleared");
        }
    }

    /// Records a failed sample. The first failure is logged; repeats are
    /// suppressed until a sample succeeds again.
    pub async fn record_sample_error(&self, err: AgentError) {
        let mut state = self.state.lock().await;
        if state.last_error.is_none() {
            error!(monitor = %self.name, "failed to sample metric: {err}");
            warn!(monitor = %self.name, "the above error will be logged only once");
        }
        state.last_error = Some(err.to_string());
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    /// The metric's default ceiling, used as the source ceiling when a
    /// client does not supply one.
    pub async fn default_max(&self) -> f64 {
        self.state.lock().await.default_max
    }

    /// The monitor's persistable configuration.
    pub async fn snapshot(&self) -> MonitorConfig {
        let state = self.state.lock().await;
        MonitorConfig {
            metric_type: state.metric_type,
            interval_ms: state.interval_ms,
            params: state.params.clone(),
            smart_shape: state.shaping,
        }
    }

    async fn mark_stopped(&self) {
        self.state.lock().await.run_state = RunState::Stopped;
    }
}

/// The sampling loop. Alternates between polling the stop channel and,
/// when a sample is due, running the (possibly long) sample without holding
/// the monitor's lock.
async fn run_loop(
    monitor: Arc<SystemMonitor>,
    mut metric: Box<dyn SystemMetric>,
    mut stop_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    let mut next_due = Instant::now();
    loop {
        let now = Instant::now();
        if now < next_due {
            let wait = STOP_POLL_SLICE.min(next_due - now);
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        next_due = Instant::now() + interval;
        match metric.sample().await {
            Ok(value) => monitor.submit_sample(value).await,
            Err(err) => monitor.record_sample_error(err).await,
        }
    }
    monitor.mark_stopped().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::PARAM_SCRIPT_NAME;
    use std::io::Write;

    fn monitor_config(kind: MetricKind, interval_ms: u64) -> MonitorConfig {
        MonitorConfig {
            metric_type: kind,
            interval_ms,
            params: MetricParams::new(),
            smart_shape: false,
        }
    }

    #[tokio::test]
    async fn test_result_is_default_max_before_first_sample() {
        let monitor = SystemMonitor::new(
            "ram",
            monitor_config(MetricKind::Ram, 1000),
            std::env::temp_dir(),
        );
        monitor.initialise().await.unwrap();
        assert_eq!(monitor.result().await, 100);

        let netconn = SystemMonitor::new(
            "netconn",
            monitor_config(MetricKind::Netconn, 3000),
            std::env::temp_dir(),
        );
        netconn.initialise().await.unwrap();
        assert_eq!(netconn.result().await, 2000);
    }

    #[tokio::test]
    async fn test_interval_raised_to_metric_minimum() {
        let monitor = SystemMonitor::new(
            "ram",
            monitor_config(MetricKind::Ram, 10),
            std::env::temp_dir(),
        );
        monitor.initialise().await.unwrap();
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.interval_ms, 500);
    }

    #[tokio::test]
    async fn test_submit_sample_updates_result() {
        let monitor = SystemMonitor::new(
            "ram",
            monitor_config(MetricKind::Ram, 1000),
            std::env::temp_dir(),
        );
        monitor.initialise().await.unwrap();
        monitor.submit_sample(41.6).await;
        assert_eq!(monitor.result().await, 42);
    }

    #[tokio::test]
    async fn test_sampling_error_latch_clears_on_success() {
        let monitor = SystemMonitor::new(
            "ram",
            monitor_config(MetricKind::Ram, 1000),
            std::env::temp_dir(),
        );
        monitor
            .record_sample_error(AgentError::Sampling("boom".into()))
            .await;
        assert!(monitor.last_error().await.is_some());
        monitor.submit_sample(10.0).await;
        assert!(monitor.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop_script_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "echo 55").unwrap();
        drop(file);

        let mut params = MetricParams::new();
        params.insert(PARAM_SCRIPT_NAME.into(), "load.sh".into());
        let monitor = SystemMonitor::new(
            "script",
            MonitorConfig {
                metric_type: MetricKind::Script,
                interval_ms: 3000,
                params,
                smart_shape: false,
            },
            dir.path(),
        );
        monitor.initialise().await.unwrap();
        monitor.start().await.unwrap();
        assert!(monitor.is_running().await);
        // Starting twice is a lifecycle error.
        assert!(monitor.start().await.is_err());

        // The first sample fires immediately on start.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.result().await, 55);

        monitor.stop().await.unwrap();
        assert!(!monitor.is_running().await);
        assert!(monitor.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_start_with_invalid_params_fails_cleanly() {
        let monitor = SystemMonitor::new(
            "script",
            monitor_config(MetricKind::Script, 3000),
            std::env::temp_dir(),
        );
        assert!(monitor.start().await.is_err());
        assert_eq!(monitor.run_state().await, RunState::Stopped);
        assert!(monitor.last_error().await.is_some());
    }
}
