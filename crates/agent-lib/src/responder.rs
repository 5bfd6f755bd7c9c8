//! Feedback responder service
//!
//! A responder aggregates its feedback sources into an availability score,
//! drives an online/offline command latch under threshold and interval
//! rules, and formats the wire reply served by its protocol connector. The
//! dedicated `api` responder instead routes request bodies into the agent's
//! JSON control plane.

use crate::agent::FeedbackAgent;
use crate::commands::{
    default_mask, format_commands, parse_command_list, CommandMask, MASK_NONE,
};
use crate::config::ResponderConfig;
use crate::connector::{HttpConnector, ProtocolConnector, TcpConnector};
use crate::error::{AgentError, LifecycleError, Result};
use crate::monitor::SystemMonitor;
use crate::service::RunState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Network protocol a responder listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponderProtocol {
    Tcp,
    Http,
    Https,
    HttpsApi,
}

impl ResponderProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponderProtocol::Tcp => "tcp",
            ResponderProtocol::Http => "http",
            ResponderProtocol::Https => "https",
            ResponderProtocol::HttpsApi => "https-api",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ResponderProtocol::Tcp),
            "http" => Ok(ResponderProtocol::Http),
            "https" => Ok(ResponderProtocol::Https),
            "https-api" => Ok(ResponderProtocol::HttpsApi),
            other => Err(AgentError::Config(format!(
                "invalid protocol '{other}' specified"
            ))),
        }
    }
}

impl std::fmt::Display for ResponderProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which thresholds can push a responder offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdMode {
    #[default]
    None,
    Any,
    Overall,
    Metric,
}

impl ThresholdMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ThresholdMode::None),
            "any" => Ok(ThresholdMode::Any),
            "overall" => Ok(ThresholdMode::Overall),
            "metric" => Ok(ThresholdMode::Metric),
            other => Err(AgentError::Config(format!(
                "invalid threshold mode '{other}'"
            ))),
        }
    }

    fn checks_per_metric(self) -> bool {
        matches!(self, ThresholdMode::Any | ThresholdMode::Metric)
    }

    fn checks_overall(self) -> bool {
        matches!(self, ThresholdMode::Any | ThresholdMode::Overall)
    }
}

fn default_significance() -> f64 {
    1.0
}

fn default_max_value() -> i64 {
    100
}

/// One monitor's weighted contribution to a responder.
#[derive(Clone, Serialize, Deserialize)]
pub struct FeedbackSource {
    #[serde(default = "default_significance")]
    pub significance: f64,
    #[serde(rename = "max-value", default = "default_max_value")]
    pub max_value: i64,
    #[serde(default)]
    pub threshold: u8,
    /// Derived: this source's share of the responder's total significance.
    #[serde(rename = "relative-significance", default, skip_deserializing)]
    pub relative_significance: f64,
    #[serde(skip)]
    monitor: Option<Arc<SystemMonitor>>,
}

impl FeedbackSource {
    pub fn new(significance: f64, max_value: i64, threshold: u8) -> Self {
        Self {
            significance,
            max_value,
            threshold,
            relative_significance: 0.0,
            monitor: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.significance) {
            return Err(AgentError::Config(format!(
                "significance {} out of range [0, 1]",
                self.significance
            )));
        }
        if self.max_value < 1 {
            return Err(AgentError::Config(format!(
                "max-value {} must be a positive integer",
                self.max_value
            )));
        }
        if self.threshold > 100 {
            return Err(AgentError::Config(format!(
                "threshold {} out of range [0, 100]",
                self.threshold
            )));
        }
        Ok(())
    }

    pub fn monitor(&self) -> Option<&Arc<SystemMonitor>> {
        self.monitor.as_ref()
    }

    fn set_monitor(&mut self, monitor: Arc<SystemMonitor>) {
        self.monitor = Some(monitor);
    }
}

impl std::fmt::Debug for FeedbackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackSource")
            .field("significance", &self.significance)
            .field("max_value", &self.max_value)
            .field("threshold", &self.threshold)
            .field("relative_significance", &self.relative_significance)
            .finish_non_exhaustive()
    }
}

// Equality covers the configured fields only; derived and resolved state
// is excluded.
impl PartialEq for FeedbackSource {
    fn eq(&self, other: &Self) -> bool {
        self.significance == other.significance
            && self.max_value == other.max_value
            && self.threshold == other.threshold
    }
}

struct ResponderState {
    protocol: ResponderProtocol,
    ip: String,
    port: u16,
    sources: BTreeMap<String, FeedbackSource>,
    request_timeout: Duration,
    response_timeout: Duration,
    command_list: String,
    command_mask: CommandMask,
    command_interval: Duration,
    threshold_mode: ThresholdMode,
    threshold_max: u8,
    offline_interval: bool,
    log_state_changes: bool,
    // Command latch
    online: bool,
    expiry: Option<Instant>,
    force: bool,
    override_mask: CommandMask,
    // Service machinery
    run_state: RunState,
    connector: Option<Arc<dyn ProtocolConnector>>,
    task: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
    last_error: Option<String>,
}

/// A feedback responder service.
pub struct FeedbackResponder {
    name: String,
    agent: Weak<FeedbackAgent>,
    // Handle to the owning Arc so the listener task can hold the
    // responder alive; always upgradable while a caller holds the service.
    weak: Weak<FeedbackResponder>,
    state: Mutex<ResponderState>,
}

impl FeedbackResponder {
    pub fn from_config(
        name: impl Into<String>,
        config: ResponderConfig,
        agent: Weak<FeedbackAgent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            agent,
            weak: weak.clone(),
            state: Mutex::new(ResponderState {
                protocol: config.protocol,
                ip: config.ip,
                port: config.port,
                sources: config.feedback_sources,
                request_timeout: Duration::from_secs(config.request_timeout),
                response_timeout: Duration::from_secs(config.response_timeout),
                command_list: config.command_list,
                command_mask: default_mask(),
                command_interval: Duration::from_secs(config.command_interval),
                threshold_mode: config.threshold_mode,
                threshold_max: config.threshold_max,
                offline_interval: config.offline_interval,
                log_state_changes: config.log_state_changes,
                online: true,
                expiry: None,
                force: false,
                override_mask: MASK_NONE,
                run_state: RunState::Stopped,
                connector: None,
                task: None,
                bound_addr: None,
                last_error: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validates the configuration and resolves source monitor references.
    /// Run again after any hot mutation of the source map.
    pub async fn initialise(
        &self,
        monitors: &BTreeMap<String, Arc<SystemMonitor>>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.ip != "*" && state.ip.parse::<IpAddr>().is_err() {
            return Err(AgentError::Config(format!(
                "invalid listen IP '{}'",
                state.ip
            )));
        }
        if self.name == "api" {
            match state.protocol {
                ResponderProtocol::HttpsApi => {}
                ResponderProtocol::Http | ResponderProtocol::Https => {
                    warn!(
                        responder = %self.name,
                        "legacy plain API protocol configured; upgrading to HTTPS"
                    );
                    state.protocol = ResponderProtocol::HttpsApi;
                }
                ResponderProtocol::Tcp => {
                    return Err(AgentError::Config(
                        "the API responder must use the https-api protocol".into(),
                    ));
                }
            }
        } else if state.protocol == ResponderProtocol::HttpsApi {
            return Err(AgentError::Config(
                "the https-api protocol is reserved for the 'api' responder".into(),
            ));
        }
        state.command_mask = parse_command_list(&state.command_list)?;
        if state.protocol == ResponderProtocol::HttpsApi {
            // The control-plane responder takes part in no feedback
            // computation.
            state.sources.clear();
            state.threshold_mode = ThresholdMode::None;
            return Ok(());
        }
        for (monitor_name, source) in state.sources.iter_mut() {
            source.validate()?;
            let monitor = monitors.get(monitor_name).ok_or_else(|| AgentError::NotFound {
                kind: "monitor",
                name: monitor_name.clone(),
            })?;
            source.set_monitor(monitor.clone());
        }
        recompute_relative_significance(&mut state.sources);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the protocol connector. Returns once the listener is
    /// actively accepting, or with the captured failure.
    pub async fn start(&self) -> Result<()> {
        let handle = self
            .weak
            .upgrade()
            .ok_or_else(|| AgentError::Config("responder handle dropped".into()))?;
        let ready_rx = {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Stopped {
                return Err(LifecycleError::AlreadyRunning {
                    kind: "responder",
                    name: self.name.clone(),
                }
                .into());
            }
            state.run_state = RunState::Starting;
            state.last_error = None;
            let addr = match listen_addr(&state.ip, state.port) {
                Ok(addr) => addr,
                Err(err) => {
                    state.run_state = RunState::Stopped;
                    state.last_error = Some(err.to_string());
                    return Err(err);
                }
            };
            let tls = if matches!(
                state.protocol,
                ResponderProtocol::Https | ResponderProtocol::HttpsApi
            ) {
                match self.agent.upgrade() {
                    Some(agent) => Some(agent.tls_material().clone()),
                    None => {
                        state.run_state = RunState::Stopped;
                        return Err(AgentError::Config(
                            "no TLS certificate available; unable to serve HTTPS".into(),
                        ));
                    }
                }
            } else {
                None
            };
            let connector: Arc<dyn ProtocolConnector> = match state.protocol {
                ResponderProtocol::Tcp => Arc::new(TcpConnector::new()),
                ResponderProtocol::Http => Arc::new(HttpConnector::new(None)),
                ResponderProtocol::Https | ResponderProtocol::HttpsApi => {
                    Arc::new(HttpConnector::new(tls))
                }
            };
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn({
                let connector = connector.clone();
                let responder = handle;
                async move {
                    connector.listen(responder, addr, ready_tx).await;
                }
            });
            state.connector = Some(connector);
            state.task = Some(task);
            ready_rx
        };

        match ready_rx.await {
            Ok(Ok(bound)) => {
                let mut state = self.state.lock().await;
                state.run_state = RunState::Running;
                state.bound_addr = Some(bound);
                // Fresh latch on entry to running.
                state.online = true;
                state.force = false;
                state.override_mask = MASK_NONE;
                state.expiry = Some(Instant::now() + state.command_interval);
                info!(
                    responder = %self.name,
                    protocol = %state.protocol,
                    addr = %bound,
                    "feedback responder is running"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                self.abort_start(err.to_string()).await;
                error!(responder = %self.name, "failed to start: {err}");
                Err(err)
            }
            Err(_) => {
                let err = AgentError::Connector("listener task exited during startup".into());
                self.abort_start(err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn abort_start(&self, message: String) {
        let mut state = self.state.lock().await;
        state.run_state = RunState::Stopped;
        state.last_error = Some(message);
        state.connector = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Closes the connector and waits for the accept loop to exit.
    /// In-flight requests complete before the task finishes.
    pub async fn stop(&self) -> Result<()> {
        let (connector, task) = {
            let mut state = self.state.lock().await;
            if !state.run_state.is_running() {
                return Err(LifecycleError::NotRunning {
                    kind: "responder",
                    name: self.name.clone(),
                }
                .into());
            }
            state.run_state = RunState::Stopping;
            (state.connector.take(), state.task.take())
        };
        if let Some(connector) = connector {
            connector.close().await;
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut state = self.state.lock().await;
        state.run_state = RunState::Stopped;
        state.bound_addr = None;
        info!(responder = %self.name, "feedback responder has stopped");
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

    pub async fn is_api(&self) -> bool {
        self.state.lock().await.protocol == ResponderProtocol::HttpsApi
    }

    pub async fn protocol(&self) -> ResponderProtocol {
        self.state.lock().await.protocol
    }

    /// The address the connector actually bound, once running.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.bound_addr
    }

    pub async fn listen_tuple(&self) -> (String, u16) {
        let state = self.state.lock().await;
        (state.ip.clone(), state.port)
    }

    pub async fn timeouts(&self) -> (Duration, Duration) {
        let state = self.state.lock().await;
        (state.request_timeout, state.response_timeout)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    // ------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------

    /// Builds the reply for one client request. For the API responder the
    /// body is routed into the control plane and the returned flag asks
    /// the agent to quit after the response flushes.
    pub async fn build_reply(&self, body: &str) -> (String, bool) {
        let protocol = self.state.lock().await.protocol;
        if protocol == ResponderProtocol::HttpsApi {
            return match self.agent.upgrade() {
                Some(agent) => agent.receive_api_request(body).await,
                None => ("{}".to_string(), false),
            };
        }
        (self.feedback_reply().await, false)
    }

    /// Computes the weighted availability, updates the command latch and
    /// formats the wire reply.
    pub async fn feedback_reply(&self) -> String {
        let mut state = self.state.lock().await;
        let mode = state.threshold_mode;

        let mut weighted = 0.0f64;
        let mut metric_tripped = false;
        for source in state.sources.values() {
            let Some(monitor) = source.monitor() else {
                continue;
            };
            let raw = monitor.result().await as f64;
            let ceiling = source.max_value as f64;
            let load = ((raw.clamp(0.0, ceiling) / ceiling) * 100.0)
                .round()
                .clamp(0.0, 100.0) as i64;
            if mode.checks_per_metric() && source.threshold > 0 && load >= i64::from(source.threshold)
            {
                metric_tripped = true;
            }
            weighted += load as f64 * source.relative_significance;
        }
        let overall = (weighted.round() as i64).clamp(0, 100);
        let availability = 100 - overall;

        let overall_tripped = mode.checks_overall()
            && state.threshold_max > 0
            && overall >= i64::from(state.threshold_max);
        let computed_online = !(mode.checks_per_metric() && metric_tripped) && !overall_tripped;

        if mode != ThresholdMode::None && computed_online != state.online {
            let now = Instant::now();
            let expired = state.expiry.map_or(true, |expiry| now >= expiry);
            if !state.force || (expired && (state.online || state.offline_interval)) {
                state.online = computed_online;
                state.force = false;
                state.override_mask = MASK_NONE;
                state.expiry = Some(now + state.command_interval);
                if state.log_state_changes {
                    info!(
                        responder = %self.name,
                        online = computed_online,
                        availability,
                        "threshold state change"
                    );
                }
            }
        }

        let now = Instant::now();
        let in_window = state.expiry.map_or(false, |expiry| now < expiry);
        let show_commands = in_window || (!state.offline_interval && !state.online);
        let mut reply = String::new();
        if show_commands {
            let mask = if state.override_mask != MASK_NONE {
                state.override_mask
            } else {
                state.command_mask
            };
            let tokens = format_commands(mask, state.online);
            if !tokens.is_empty() {
                reply.push_str(&tokens);
                reply.push(' ');
            }
        }
        reply.push_str(&format!("{availability}%\n"));
        reply
    }

    /// Administrative latch: `send` passes an empty override so the
    /// configured command tokens are used; `force` passes an override mask
    /// replacing them until the interval expires.
    pub async fn set_command_state(&self, online: bool, override_mask: CommandMask) {
        let mut state = self.state.lock().await;
        state.online = online;
        state.force = true;
        state.override_mask = override_mask;
        state.expiry = Some(Instant::now() + state.command_interval);
        if state.log_state_changes {
            info!(
                responder = %self.name,
                online,
                forced = override_mask != MASK_NONE,
                "administrative state change"
            );
        }
    }

    // ------------------------------------------------------------------
    // Hot reconfiguration
    // ------------------------------------------------------------------

    pub async fn set_commands(
        &self,
        command_list: Option<&str>,
        command_interval: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if command_list.is_none() && command_interval.is_none() {
            return Err(AgentError::Config(
                "no command parameters specified".into(),
            ));
        }
        if let Some(list) = command_list {
            state.command_mask = parse_command_list(list)?;
            state.command_list = list.trim().to_ascii_lowercase();
        }
        if let Some(interval) = command_interval {
            state.command_interval = Duration::from_secs(interval);
        }
        Ok(())
    }

    pub async fn set_threshold(
        &self,
        mode: Option<ThresholdMode>,
        threshold_max: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if mode.is_none() && threshold_max.is_none() {
            return Err(AgentError::Config(
                "no threshold parameters specified".into(),
            ));
        }
        if let Some(mode) = mode {
            if state.protocol == ResponderProtocol::HttpsApi && mode != ThresholdMode::None {
                return Err(AgentError::Config(
                    "the API responder has no thresholds".into(),
                ));
            }
            state.threshold_mode = mode;
        }
        if let Some(max) = threshold_max {
            if !(0..=100).contains(&max) {
                return Err(AgentError::Config(format!(
                    "threshold-max {max} out of range [0, 100]"
                )));
            }
            state.threshold_max = max as u8;
        }
        Ok(())
    }

    /// Adds a feedback source. A failed validation removes the new entry,
    /// leaving the previous state intact.
    pub async fn add_source(
        &self,
        monitors: &BTreeMap<String, Arc<SystemMonitor>>,
        monitor_name: &str,
        significance: Option<f64>,
        max_value: Option<i64>,
        threshold: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.protocol == ResponderProtocol::HttpsApi {
            return Err(AgentError::Config(
                "the API responder has no feedback sources".into(),
            ));
        }
        if state.sources.contains_key(monitor_name) {
            return Err(LifecycleError::NameCollision {
                kind: "source",
                name: monitor_name.to_string(),
            }
            .into());
        }
        let monitor = monitors.get(monitor_name).ok_or_else(|| AgentError::NotFound {
            kind: "monitor",
            name: monitor_name.to_string(),
        })?;
        let default_ceiling = monitor.default_max().await.round() as i64;
        let mut source = FeedbackSource::new(
            significance.unwrap_or(1.0),
            max_value.unwrap_or(default_ceiling),
            clamp_threshold(threshold)?,
        );
        source.validate()?;
        source.set_monitor(monitor.clone());
        state.sources.insert(monitor_name.to_string(), source);
        recompute_relative_significance(&mut state.sources);
        Ok(())
    }

    /// Edits a feedback source. A failed validation restores the previous
    /// source unchanged.
    pub async fn edit_source(
        &self,
        monitor_name: &str,
        significance: Option<f64>,
        max_value: Option<i64>,
        threshold: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let previous = state
            .sources
            .get(monitor_name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                kind: "source",
                name: monitor_name.to_string(),
            })?;
        let mut updated = previous.clone();
        if let Some(significance) = significance {
            updated.significance = significance;
        }
        if let Some(max_value) = max_value {
            updated.max_value = max_value;
        }
        if let Some(threshold) = threshold {
            updated.threshold = clamp_threshold(Some(threshold))?;
        }
        if let Err(err) = updated.validate() {
            state.sources.insert(monitor_name.to_string(), previous);
            return Err(err);
        }
        state.sources.insert(monitor_name.to_string(), updated);
        recompute_relative_significance(&mut state.sources);
        Ok(())
    }

    pub async fn delete_source(&self, monitor_name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.sources.remove(monitor_name).is_none() {
            return Err(AgentError::NotFound {
                kind: "source",
                name: monitor_name.to_string(),
            });
        }
        recompute_relative_significance(&mut state.sources);
        Ok(())
    }

    pub async fn has_source(&self, monitor_name: &str) -> bool {
        self.state.lock().await.sources.contains_key(monitor_name)
    }

    /// Re-points a source at a replacement monitor object after an edit
    /// swapped the monitor in the agent's map.
    pub async fn replace_monitor(&self, monitor_name: &str, monitor: &Arc<SystemMonitor>) {
        let mut state = self.state.lock().await;
        if let Some(source) = state.sources.get_mut(monitor_name) {
            source.set_monitor(monitor.clone());
        }
    }

    pub async fn sources_snapshot(&self) -> BTreeMap<String, FeedbackSource> {
        self.state.lock().await.sources.clone()
    }

    /// The responder's persistable configuration.
    pub async fn snapshot(&self) -> ResponderConfig {
        let state = self.state.lock().await;
        ResponderConfig {
            protocol: state.protocol,
            ip: state.ip.clone(),
            port: state.port,
            request_timeout: state.request_timeout.as_secs(),
            response_timeout: state.response_timeout.as_secs(),
            command_list: state.command_list.clone(),
            command_interval: state.command_interval.as_secs(),
            threshold_mode: state.threshold_mode,
            threshold_max: state.threshold_max,
            offline_interval: state.offline_interval,
            log_state_changes: state.log_state_changes,
            feedback_sources: state.sources.clone(),
        }
    }

    /// Asks the owning agent to shut down once the current response has
    /// flushed.
    pub async fn signal_agent_quit(&self) {
        if let Some(agent) = self.agent.upgrade() {
            agent.self_signal_quit().await;
        }
    }
}

fn clamp_threshold(threshold: Option<i64>) -> Result<u8> {
    match threshold {
        None => Ok(0),
        Some(value) if (0..=100).contains(&value) => Ok(value as u8),
        Some(value) => Err(AgentError::Config(format!(
            "threshold {value} out of range [0, 100]"
        ))),
    }
}

fn recompute_relative_significance(sources: &mut BTreeMap<String, FeedbackSource>) {
    if sources.is_empty() {
        return;
    }
    let total: f64 = sources.values().map(|source| source.significance).sum();
    let count = sources.len() as f64;
    for source in sources.values_mut() {
        source.relative_significance = if total > 0.0 {
            source.significance / total
        } else {
            1.0 / count
        };
    }
}

fn listen_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip = ip.trim();
    let addr = if ip == "*" || ip.is_empty() {
        IpAddr::from([0u8, 0, 0, 0])
    } else {
        ip.parse::<IpAddr>()
            .map_err(|_| AgentError::Config(format!("invalid listen IP '{ip}'")))?
    };
    Ok(SocketAddr::new(addr, port))
}
