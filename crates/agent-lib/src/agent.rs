//! The feedback agent service
//!
//! Owns the monitor and responder maps, loads and saves the persisted
//! configuration, orchestrates startup/shutdown/restart and carries the
//! process signal loop. API mutations route in through the receiver in the
//! `api` module while services continue running.

use crate::api::schema::ServiceStatus;
use crate::config::{
    self, default_api_responder, ConfigDocument, API_KEY_BYTES,
};
use crate::error::{AgentError, Result};
use crate::monitor::SystemMonitor;
use crate::responder::FeedbackResponder;
use crate::tls::{self, TlsMaterial, DEFAULT_CERT_VALID_DAYS};
use crate::util::{normalise_name, random_hex};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// In-process control signals, carried alongside the OS signal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    Quit,
}

#[derive(Default)]
struct ServiceMaps {
    monitors: BTreeMap<String, Arc<SystemMonitor>>,
    responders: BTreeMap<String, Arc<FeedbackResponder>>,
}

struct AgentSettings {
    log_dir: String,
    api_key: String,
    unsaved_changes: bool,
}

/// The parent service owning all monitors and responders.
pub struct FeedbackAgent {
    config_dir: PathBuf,
    tls: TlsMaterial,
    // Back-pointer handed to responders; the agent's lifetime dominates.
    weak: Weak<FeedbackAgent>,
    services: Mutex<ServiceMaps>,
    settings: Mutex<AgentSettings>,
    signal_tx: mpsc::Sender<AgentSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<AgentSignal>>>,
}

impl FeedbackAgent {
    /// Loads the agent from the config directory, creating a default
    /// configuration file when none exists.
    pub async fn load(config_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let config_dir = config_dir.into();
        let (document, _created) = config::load_or_create(&config_dir)?;
        Self::from_document(config_dir, document).await
    }

    /// Builds the agent from an explicit document. The document is applied
    /// as the full service graph; a missing `api` responder or blank API
    /// key is repaired and persisted.
    pub async fn from_document(
        config_dir: PathBuf,
        document: ConfigDocument,
    ) -> Result<Arc<Self>> {
        let tls = tls::generate_certificate(DEFAULT_CERT_VALID_DAYS)?;
        let (signal_tx, signal_rx) = mpsc::channel(4);
        let agent = Arc::new_cyclic(|weak| Self {
            config_dir,
            tls,
            weak: weak.clone(),
            services: Mutex::new(ServiceMaps::default()),
            settings: Mutex::new(AgentSettings {
                log_dir: String::new(),
                api_key: String::new(),
                unsaved_changes: false,
            }),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        });
        let repaired = agent.apply_document(document).await?;
        if repaired {
            if let Err(err) = agent.save_config().await {
                error!("failed to persist repaired configuration: {err}");
            }
        }
        Ok(agent)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn tls_material(&self) -> &TlsMaterial {
        &self.tls
    }

    pub async fn log_dir(&self) -> String {
        self.settings.lock().await.log_dir.clone()
    }

    pub(crate) async fn api_key(&self) -> String {
        self.settings.lock().await.api_key.clone()
    }

    /// A weak back-pointer for wiring into owned responders.
    pub(crate) fn weak_handle(&self) -> Weak<FeedbackAgent> {
        self.weak.clone()
    }

    /// Replaces the full service graph from a parsed document. Returns
    /// whether the document needed repair (and so should be re-saved).
    async fn apply_document(&self, mut document: ConfigDocument) -> Result<bool> {
        let mut repaired = false;
        if document.api_key.trim().is_empty() {
            document.api_key = random_hex(API_KEY_BYTES);
            warn!("no API key in configuration; generated a new one");
            repaired = true;
        }
        if !document.responders.contains_key("api") {
            warn!("no 'api' responder configured; adding the default");
            document
                .responders
                .insert("api".to_string(), default_api_responder());
            repaired = true;
        }
        {
            let mut settings = self.settings.lock().await;
            settings.log_dir = document.log_dir.clone();
            settings.api_key = document.api_key.clone();
        }

        let mut monitors = BTreeMap::new();
        for (name, monitor_config) in document.monitors {
            let name = normalise_name(&name)?;
            let monitor = SystemMonitor::new(&name, monitor_config, &self.config_dir);
            monitor.initialise().await.map_err(|err| {
                AgentError::Config(format!("monitor '{name}': {err}"))
            })?;
            monitors.insert(name, monitor);
        }

        let mut responders = BTreeMap::new();
        let mut endpoints = BTreeSet::new();
        for (name, responder_config) in document.responders {
            let name = normalise_name(&name)?;
            // Port 0 binds an ephemeral port, so it never collides.
            if responder_config.port != 0
                && !endpoints.insert((responder_config.ip.clone(), responder_config.port))
            {
                return Err(AgentError::Config(format!(
                    "responder '{name}': listen endpoint {}:{} already in use",
                    responder_config.ip, responder_config.port
                )));
            }
            let responder =
                FeedbackResponder::from_config(&name, responder_config, self.weak_handle());
            responder.initialise(&monitors).await.map_err(|err| {
                AgentError::Config(format!("responder '{name}': {err}"))
            })?;
            responders.insert(name, responder);
        }

        let mut services = self.services.lock().await;
        services.monitors = monitors;
        services.responders = responders;
        Ok(repaired)
    }

    // ------------------------------------------------------------------
    // Service map access
    // ------------------------------------------------------------------

    pub async fn get_monitor(&self, name: &str) -> Result<Arc<SystemMonitor>> {
        self.services
            .lock()
            .await
            .monitors
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                kind: "monitor",
                name: name.to_string(),
            })
    }

    pub async fn get_responder(&self, name: &str) -> Result<Arc<FeedbackResponder>> {
        self.services
            .lock()
            .await
            .responders
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                kind: "responder",
                name: name.to_string(),
            })
    }

    pub(crate) async fn monitors_snapshot(&self) -> BTreeMap<String, Arc<SystemMonitor>> {
        self.services.lock().await.monitors.clone()
    }

    pub(crate) async fn responders_snapshot(
        &self,
    ) -> BTreeMap<String, Arc<FeedbackResponder>> {
        self.services.lock().await.responders.clone()
    }

    pub(crate) async fn insert_monitor(
        &self,
        name: &str,
        monitor: Arc<SystemMonitor>,
    ) -> Result<()> {
        let mut services = self.services.lock().await;
        if services.monitors.contains_key(name) {
            return Err(crate::error::LifecycleError::NameCollision {
                kind: "monitor",
                name: name.to_string(),
            }
            .into());
        }
        services.monitors.insert(name.to_string(), monitor);
        Ok(())
    }

    pub(crate) async fn insert_responder(
        &self,
        name: &str,
        responder: Arc<FeedbackResponder>,
    ) -> Result<()> {
        let mut services = self.services.lock().await;
        if services.responders.contains_key(name) {
            return Err(crate::error::LifecycleError::NameCollision {
                kind: "responder",
                name: name.to_string(),
            }
            .into());
        }
        services.responders.insert(name.to_string(), responder);
        Ok(())
    }

    pub(crate) async fn replace_monitor_entry(&self, name: &str, monitor: Arc<SystemMonitor>) {
        self.services
            .lock()
            .await
            .monitors
            .insert(name.to_string(), monitor);
    }

    pub(crate) async fn replace_responder_entry(
        &self,
        name: &str,
        responder: Arc<FeedbackResponder>,
    ) {
        self.services
            .lock()
            .await
            .responders
            .insert(name.to_string(), responder);
    }

    pub(crate) async fn remove_monitor_entry(&self, name: &str) {
        self.services.lock().await.monitors.remove(name);
    }

    pub(crate) async fn remove_responder_entry(&self, name: &str) {
        self.services.lock().await.responders.remove(name);
    }

    /// Checks a proposed listen endpoint against every responder except
    /// `exclude`.
    pub(crate) async fn endpoint_in_use(
        &self,
        ip: &str,
        port: u16,
        exclude: Option<&str>,
    ) -> bool {
        if port == 0 {
            return false;
        }
        let responders = self.responders_snapshot().await;
        for (name, responder) in responders {
            if exclude == Some(name.as_str()) {
                continue;
            }
            let (other_ip, other_port) = responder.listen_tuple().await;
            if other_ip == ip && other_port == port {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Lifecycle orchestration
    // ------------------------------------------------------------------

    /// Starts every service: monitors first, then the `api` responder so a
    /// port collision elsewhere cannot block administration, then the
    /// rest. Non-API responder failures are non-fatal provided at least
    /// one responder started.
    pub async fn start_all(&self) -> Result<()> {
        let (monitors, responders) = {
            let services = self.services.lock().await;
            (services.monitors.clone(), services.responders.clone())
        };
        for (name, monitor) in &monitors {
            monitor.start().await.map_err(|err| {
                error!("error starting monitor '{name}': {err}");
                err
            })?;
        }
        let mut started = 0usize;
        if let Some(api) = responders.get("api") {
            match api.start().await {
                Ok(()) => started += 1,
                Err(err) => error!("error starting responder 'api': {err}"),
            }
        }
        for (name, responder) in &responders {
            if name == "api" {
                continue;
            }
            match responder.start().await {
                Ok(()) => started += 1,
                Err(err) => error!("error starting responder '{name}': {err}"),
            }
        }
        if started == 0 && !responders.is_empty() {
            return Err(AgentError::Connector(
                "no responders could be started".into(),
            ));
        }
        Ok(())
    }

    /// Stops every service: responders first, then monitors. Services
    /// already stopped are skipped.
    pub async fn stop_all(&self) {
        info!("stopping all feedback agent services");
        let (monitors, responders) = {
            let services = self.services.lock().await;
            (services.monitors.clone(), services.responders.clone())
        };
        for (name, responder) in &responders {
            if responder.is_running().await {
                if let Err(err) = responder.stop().await {
                    error!("error stopping responder '{name}': {err}");
                }
            }
        }
        for (name, monitor) in &monitors {
            if monitor.is_running().await {
                if let Err(err) = monitor.stop().await {
                    error!("error stopping monitor '{name}': {err}");
                }
            }
        }
        info!("all services have stopped");
    }

    /// Stops and restarts all services in memory, without touching the
    /// config file.
    pub async fn restart_services(&self) -> Result<()> {
        info!("the feedback agent is restarting");
        self.stop_all().await;
        self.start_all().await?;
        info!("restart complete");
        Ok(())
    }

    /// Full reload: stops everything, re-reads the config file and starts
    /// the freshly built service graph.
    pub async fn reload_from_disk(&self) -> Result<()> {
        self.stop_all().await;
        let (document, _created) = config::load_or_create(&self.config_dir)?;
        self.apply_document(document).await?;
        self.start_all().await
    }

    /// Runs the agent until an OS signal or in-process quit request
    /// arrives. SIGHUP reloads the configuration; SIGINT, SIGTERM and
    /// SIGQUIT stop the agent.
    pub async fn run(&self) -> Result<()> {
        self.start_all().await?;
        info!("startup complete; the feedback agent is running");

        let mut signal_rx = self
            .signal_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::Config("agent event loop already running".into()))?;

        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup())
            .map_err(|err| AgentError::Config(format!("signal handler failed: {err}")))?;
        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|err| AgentError::Config(format!("signal handler failed: {err}")))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|err| AgentError::Config(format!("signal handler failed: {err}")))?;
        let mut quit = signal(SignalKind::quit())
            .map_err(|err| AgentError::Config(format!("signal handler failed: {err}")))?;

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received; reloading configuration");
                    if let Err(err) = self.reload_from_disk().await {
                        error!("reload failed: {err}");
                    }
                }
                _ = interrupt.recv() => break,
                _ = terminate.recv() => break,
                _ = quit.recv() => break,
                message = signal_rx.recv() => {
                    match message {
                        Some(AgentSignal::Quit) | None => break,
                    }
                }
            }
        }
        self.stop_all().await;
        info!("the feedback agent has terminated");
        Ok(())
    }

    /// Requests shutdown from inside a request handler; the event loop
    /// stops services after the current response flushes.
    pub async fn self_signal_quit(&self) {
        let _ = self.signal_tx.try_send(AgentSignal::Quit);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub(crate) async fn mark_unsaved(&self) {
        self.settings.lock().await.unsaved_changes = true;
    }

    pub(crate) async fn take_unsaved(&self) -> bool {
        let mut settings = self.settings.lock().await;
        std::mem::take(&mut settings.unsaved_changes)
    }

    /// Serialises the current in-memory state into a config document.
    pub async fn snapshot_document(&self) -> ConfigDocument {
        let (log_dir, api_key) = {
            let settings = self.settings.lock().await;
            (settings.log_dir.clone(), settings.api_key.clone())
        };
        let (monitors, responders) = {
            let services = self.services.lock().await;
            (services.monitors.clone(), services.responders.clone())
        };
        let mut document = ConfigDocument {
            log_dir,
            api_key,
            monitors: BTreeMap::new(),
            responders: BTreeMap::new(),
        };
        for (name, monitor) in monitors {
            document.monitors.insert(name, monitor.snapshot().await);
        }
        for (name, responder) in responders {
            document.responders.insert(name, responder.snapshot().await);
        }
        document
    }

    /// Writes the full configuration to the config file.
    pub async fn save_config(&self) -> Result<()> {
        let document = self.snapshot_document().await;
        config::save_document(&self.config_dir, &document)?;
        info!("agent configuration saved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn service_status(&self) -> Vec<ServiceStatus> {
        let (monitors, responders) = {
            let services = self.services.lock().await;
            (services.monitors.clone(), services.responders.clone())
        };
        let mut status = Vec::new();
        for (name, responder) in responders {
            status.push(ServiceStatus {
                service_type: "responder".to_string(),
                name,
                status: responder.run_state().await.to_string(),
            });
        }
        for (name, monitor) in monitors {
            status.push(ServiceStatus {
                service_type: "monitor".to_string(),
                name,
                status: monitor.run_state().await.to_string(),
            });
        }
        status
    }
}
