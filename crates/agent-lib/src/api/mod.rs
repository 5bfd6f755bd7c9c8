//! Control-plane API receiver
//!
//! Parses a JSON request, validates the API key in constant time,
//! dispatches into the mutation handlers and marshals the response
//! envelope. Any successful mutation flags the configuration as unsaved;
//! the receiver persists it before the response is returned, joining save
//! failures into the reported result without undoing the in-memory change.

pub mod schema;

use crate::agent::FeedbackAgent;
use crate::commands::{drain_mask, maint_mask, online_mask, CommandMask, MASK_NONE};
use crate::config::{MonitorConfig, ResponderConfig, DEFAULT_MONITOR_INTERVAL_MS};
use crate::error::{AgentError, LifecycleError, Result};
use crate::metric::MetricKind;
use crate::monitor::SystemMonitor;
use crate::responder::{FeedbackResponder, ResponderProtocol, ThresholdMode};
use crate::util::{normalise_name, random_hex};
use schema::{ApiRequest, ApiResponse};
use subtle::ConstantTimeEq;
use tracing::{error, info};

/// Service name reported in every response envelope.
pub const SERVICE_NAME: &str = "lbfeedback";
/// Agent version reported in every response envelope.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bytes of randomness in a response tag (32 bits).
const RESPONSE_TAG_BYTES: usize = 4;

/// Constant-time API key comparison; the length check alone leaks only
/// the length, never the contents.
fn api_key_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
}

fn describe_request(request: &ApiRequest) -> String {
    let mut description = if request.action.is_empty() {
        "(no action)".to_string()
    } else {
        format!("action '{}'", request.action)
    };
    if !request.target_type.is_empty() {
        description.push_str(&format!(", type '{}'", request.target_type));
    }
    if !request.target_name.is_empty() {
        description.push_str(&format!(", target name '{}'", request.target_name));
    }
    description
}

fn parse_threshold_max(value: Option<i64>) -> Result<Option<u8>> {
    match value {
        None => Ok(None),
        Some(value) if (0..=100).contains(&value) => Ok(Some(value as u8)),
        Some(value) => Err(AgentError::Config(format!(
            "threshold-max {value} out of range [0, 100]"
        ))),
    }
}

impl FeedbackAgent {
    /// Handles one raw API request body, returning the response JSON and
    /// whether the agent should quit after the response flushes.
    pub async fn receive_api_request(&self, body: &str) -> (String, bool) {
        let parsed = serde_json::from_str::<ApiRequest>(body);
        let (response, quit_after) = self.process_api_request(parsed).await;
        let json = serde_json::to_string_pretty(&response).unwrap_or_else(|err| {
            error!("failed to marshal JSON API response: {err}");
            "{\"success\": false}".to_string()
        });
        (json, quit_after)
    }

    /// Processes a parsed (or unparseable) request into a response
    /// envelope.
    pub async fn process_api_request(
        &self,
        parsed: serde_json::Result<ApiRequest>,
    ) -> (ApiResponse, bool) {
        let mut response = ApiResponse {
            service_name: SERVICE_NAME.to_string(),
            version: VERSION.to_string(),
            tag: random_hex(RESPONSE_TAG_BYTES),
            ..ApiResponse::default()
        };
        let mut request = match parsed {
            Ok(request) => request,
            Err(err) => {
                response.error_name = Some("json-syntax".to_string());
                response.message = Some(format!("JSON syntax error: {err}"));
                return (response, false);
            }
        };
        request.action = request.action.trim().to_ascii_lowercase();
        request.target_type = request.target_type.trim().to_ascii_lowercase();
        request.target_name = request.target_name.trim().to_string();
        response.id = request.id;

        let expected_key = self.api_key().await;
        if !api_key_matches(&expected_key, &request.api_key) {
            response.error_name = Some("bad-api-key".to_string());
            response.message = Some("invalid or missing API key".to_string());
            request.api_key.clear();
            response.request = Some(request);
            return (response, false);
        }
        if matches!(request.target_type.as_str(), "monitor" | "responder")
            && request.target_name.is_empty()
        {
            response.error_name = Some("missing-target".to_string());
            response.message = Some("no target service name specified".to_string());
            request.api_key.clear();
            response.request = Some(request);
            return (response, false);
        }

        let description = describe_request(&request);
        let mut suppress_log = false;
        let (quit_after, outcome) = self
            .dispatch_action(&request, &mut response, &mut suppress_log)
            .await;

        // Persist any successful mutation before responding. A failed save
        // is reported without undoing the in-memory change.
        let mut save_failure = None;
        if self.take_unsaved().await {
            match self.save_config().await {
                Ok(()) => {}
                Err(err) => {
                    error!("failed to save agent configuration: {err}");
                    save_failure = Some(err);
                }
            }
        }

        let log_head = format!("API request #{}", response.tag);
        match outcome {
            Ok(()) => {
                response.success = true;
                let mut message = format!("succeeded: {description}");
                if let Some(save_err) = save_failure {
                    response.error_name = Some(save_err.error_name().to_string());
                    message.push_str(&format!(" (warning: {save_err})"));
                }
                if !suppress_log {
                    info!("{log_head} {message}");
                }
                response.message = Some(message);
            }
            Err(err) => {
                let err = match save_failure {
                    Some(save_err) => err.join(save_err),
                    None => err,
                };
                response.error_name = Some(err.error_name().to_string());
                let message = format!("failed: {description}: {err}");
                if !suppress_log {
                    error!("{log_head} {message}");
                }
                response.message = Some(message);
            }
        }
        request.api_key.clear();
        response.request = Some(request);
        (response, quit_after)
    }

    async fn dispatch_action(
        &self,
        request: &ApiRequest,
        response: &mut ApiResponse,
        suppress_log: &mut bool,
    ) -> (bool, Result<()>) {
        let mut quit_after = false;
        let outcome = match request.action.as_str() {
            "add" | "edit" | "delete" | "start" | "stop" | "restart" => {
                match request.target_type.as_str() {
                    "monitor" => self.handle_monitor_action(request).await,
                    "responder" => self.handle_responder_action(request).await,
                    "source" => self.handle_source_action(request).await,
                    "agent" => match request.action.as_str() {
                        "restart" => self.restart_services().await,
                        "stop" => {
                            quit_after = true;
                            Ok(())
                        }
                        _ => Err(AgentError::Config(format!(
                            "invalid agent action '{}'",
                            request.action
                        ))),
                    },
                    other => Err(AgentError::Config(format!(
                        "invalid action type '{other}'"
                    ))),
                }
            }
            "status" => {
                response.status = Some(self.service_status().await);
                *suppress_log = true;
                Ok(())
            }
            "get" => match request.target_type.as_str() {
                "config" => {
                    let mut document = self.snapshot_document().await;
                    document.api_key = String::new();
                    response.current_config = Some(document);
                    *suppress_log = true;
                    Ok(())
                }
                "feedback" => {
                    *suppress_log = true;
                    match self.api_get_feedback(request).await {
                        Ok(feedback) => {
                            response.output = Some(feedback);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
                "sources" => {
                    *suppress_log = true;
                    match self.api_get_sources(request).await {
                        Ok(sources) => {
                            response.feedback_sources = Some(sources);
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
                other => Err(AgentError::Config(format!(
                    "invalid action type '{other}'"
                ))),
            },
            "set" => match request.target_type.as_str() {
                "commands" | "cmd" => self.api_set_commands(request).await,
                "threshold" | "cmd-threshold" => self.api_set_threshold(request).await,
                "cmd-interval" => self.api_set_interval(request).await,
                other => Err(AgentError::Config(format!(
                    "invalid action type '{other}'"
                ))),
            },
            "send" => match request.target_type.as_str() {
                "online" => {
                    self.api_set_online_state(&request.target_name, true, MASK_NONE)
                        .await
                }
                "offline" => {
                    self.api_set_online_state(&request.target_name, false, MASK_NONE)
                        .await
                }
                other => Err(AgentError::Config(format!(
                    "invalid action type '{other}'"
                ))),
            },
            "force" => match request.target_type.as_str() {
                "halt" | "maint" => {
                    self.api_set_online_state(&request.target_name, false, maint_mask())
                        .await
                }
                "drain" => {
                    self.api_set_online_state(&request.target_name, false, drain_mask())
                        .await
                }
                "online" => {
                    self.api_set_online_state(&request.target_name, true, online_mask())
                        .await
                }
                "save-config" => {
                    self.mark_unsaved().await;
                    Ok(())
                }
                other => Err(AgentError::Config(format!(
                    "invalid action type '{other}'"
                ))),
            },
            "agent" => match request.target_type.as_str() {
                "restart" => self.restart_services().await,
                "stop" => {
                    quit_after = true;
                    Ok(())
                }
                other => Err(AgentError::Config(format!(
                    "invalid agent action '{other}'"
                ))),
            },
            _ => Err(AgentError::Config("invalid action specified".into())),
        };
        (quit_after, outcome)
    }

    // ------------------------------------------------------------------
    // Monitor actions
    // ------------------------------------------------------------------

    async fn handle_monitor_action(&self, request: &ApiRequest) -> Result<()> {
        let name = normalise_name(&request.target_name)?;
        match request.action.as_str() {
            "add" => self.api_add_monitor(&name, request).await,
            "edit" => self.api_edit_monitor(&name, request).await,
            "delete" => self.api_delete_monitor(&name).await,
            "start" => self.get_monitor(&name).await?.start().await,
            "stop" => self.get_monitor(&name).await?.stop().await,
            "restart" => self.get_monitor(&name).await?.restart().await,
            other => Err(AgentError::Config(format!("unknown action '{other}'"))),
        }
    }

    async fn api_add_monitor(&self, name: &str, request: &ApiRequest) -> Result<()> {
        let metric_type: MetricKind = request
            .metric_type
            .as_deref()
            .ok_or_else(|| AgentError::Config("system metric type not specified".into()))?
            .parse()?;
        let config = MonitorConfig {
            metric_type,
            interval_ms: request.interval_ms.unwrap_or(DEFAULT_MONITOR_INTERVAL_MS),
            params: request.metric_config.clone().unwrap_or_default(),
            smart_shape: request.smart_shape.unwrap_or(false),
        };
        let monitor = SystemMonitor::new(name, config, self.config_dir());
        monitor.initialise().await?;
        self.insert_monitor(name, monitor.clone()).await?;
        if let Err(start_err) = monitor.start().await {
            self.remove_monitor_entry(name).await;
            return Err(start_err);
        }
        self.mark_unsaved().await;
        Ok(())
    }

    /// Copy, apply the diff, validate, and only then replace the live
    /// monitor. A failed validation leaves the running service untouched.
    async fn api_edit_monitor(&self, name: &str, request: &ApiRequest) -> Result<()> {
        let old = self.get_monitor(name).await?;
        let mut config = old.snapshot().await;
        let mut changed = false;
        if let Some(metric_type) = request.metric_type.as_deref() {
            config.metric_type = metric_type.parse()?;
            changed = true;
        }
        if let Some(interval_ms) = request.interval_ms {
            config.interval_ms = interval_ms;
            changed = true;
        }
        if let Some(params) = &request.metric_config {
            config.params = params.clone();
            changed = true;
        }
        if let Some(smart_shape) = request.smart_shape {
            config.smart_shape = smart_shape;
            changed = true;
        }
        if !changed {
            return Err(AgentError::Config("no fields changed in request".into()));
        }
        let new = SystemMonitor::new(name, config, self.config_dir());
        new.initialise().await?;
        self.replace_monitor_entry(name, new.clone()).await;
        if old.is_running().await {
            old.stop().await?;
            new.start().await?;
        }
        // Any responder holding a source on this monitor follows the swap.
        for responder in self.responders_snapshot().await.into_values() {
            responder.replace_monitor(name, &new).await;
        }
        self.mark_unsaved().await;
        Ok(())
    }

    async fn api_delete_monitor(&self, name: &str) -> Result<()> {
        let monitor = self.get_monitor(name).await?;
        for (responder_name, responder) in self.responders_snapshot().await {
            if responder.has_source(name).await {
                return Err(LifecycleError::MonitorInUse {
                    monitor: name.to_string(),
                    responder: responder_name,
                }
                .into());
            }
        }
        if monitor.is_running().await {
            monitor.stop().await?;
        }
        self.remove_monitor_entry(name).await;
        self.mark_unsaved().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Responder actions
    // ------------------------------------------------------------------

    async fn handle_responder_action(&self, request: &ApiRequest) -> Result<()> {
        let name = normalise_name(&request.target_name)?;
        match request.action.as_str() {
            "add" => self.api_add_responder(&name, request).await,
            "edit" => self.api_edit_responder(&name, request).await,
            "delete" => self.api_delete_responder(&name).await,
            "start" => self.get_responder(&name).await?.start().await,
            "stop" => self.get_responder(&name).await?.stop().await,
            "restart" => self.get_responder(&name).await?.restart().await,
            other => Err(AgentError::Config(format!("unknown action '{other}'"))),
        }
    }

    async fn api_add_responder(&self, name: &str, request: &ApiRequest) -> Result<()> {
        let protocol = ResponderProtocol::parse(
            request
                .protocol
                .as_deref()
                .ok_or_else(|| AgentError::Config("protocol not specified".into()))?,
        )?;
        let port = request
            .port
            .ok_or_else(|| AgentError::Config("listen port not specified".into()))?;
        let threshold_mode = match request.threshold_mode.as_deref() {
            Some(mode) => ThresholdMode::parse(mode)?,
            None => ThresholdMode::None,
        };
        let config = ResponderConfig {
            protocol,
            ip: request.ip.clone().unwrap_or_else(|| "*".to_string()),
            port,
            request_timeout: request
                .request_timeout
                .unwrap_or(crate::config::DEFAULT_TIMEOUT_SECS),
            response_timeout: request
                .response_timeout
                .unwrap_or(crate::config::DEFAULT_TIMEOUT_SECS),
            command_list: request
                .command_list
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            command_interval: request
                .command_interval
                .unwrap_or(crate::config::DEFAULT_COMMAND_INTERVAL_SECS),
            threshold_mode,
            threshold_max: parse_threshold_max(request.threshold_max)?.unwrap_or(0),
            offline_interval: true,
            log_state_changes: request.log_state_changes.unwrap_or(false),
            feedback_sources: request.feedback_sources.clone().unwrap_or_default(),
        };
        if self.endpoint_in_use(&config.ip, config.port, None).await {
            return Err(AgentError::Config(format!(
                "listen endpoint {}:{} already in use",
                config.ip, config.port
            )));
        }
        let responder = FeedbackResponder::from_config(name, config, self.weak_handle());
        responder.initialise(&self.monitors_snapshot().await).await?;
        self.insert_responder(name, responder.clone()).await?;
        if let Err(start_err) = responder.start().await {
            self.remove_responder_entry(name).await;
            return Err(start_err);
        }
        self.mark_unsaved().await;
        Ok(())
    }

    /// Copy-validate-swap, as for monitor edits.
    async fn api_edit_responder(&self, name: &str, request: &ApiRequest) -> Result<()> {
        let old = self.get_responder(name).await?;
        let mut config = old.snapshot().await;
        let mut changed = false;
        if let Some(protocol) = request.protocol.as_deref() {
            if name == "api" {
                return Err(AgentError::Config(
                    "API responders do not have a configurable protocol".into(),
                ));
            }
            config.protocol = ResponderProtocol::parse(protocol)?;
            changed = true;
        }
        if let Some(ip) = &request.ip {
            config.ip = ip.clone();
            changed = true;
        }
        if let Some(port) = request.port {
            config.port = port;
            changed = true;
        }
        if let Some(timeout) = request.request_timeout {
            config.request_timeout = timeout;
            changed = true;
        }
        if let Some(timeout) = request.response_timeout {
            config.response_timeout = timeout;
            changed = true;
        }
        if let Some(command_list) = &request.command_list {
            config.command_list = command_list.clone();
            changed = true;
        }
        if let Some(interval) = request.command_interval {
            config.command_interval = interval;
            changed = true;
        }
        if let Some(mode) = request.threshold_mode.as_deref() {
            config.threshold_mode = ThresholdMode::parse(mode)?;
            changed = true;
        }
        if let Some(threshold_max) = parse_threshold_max(request.threshold_max)? {
            config.threshold_max = threshold_max;
            changed = true;
        }
        if let Some(log_state_changes) = request.log_state_changes {
            config.log_state_changes = log_state_changes;
            changed = true;
        }
        if let Some(sources) = &request.feedback_sources {
            config.feedback_sources = sources.clone();
            changed = true;
        }
        if !changed {
            return Err(AgentError::Config("no fields changed in request".into()));
        }
        if self.endpoint_in_use(&config.ip, config.port, Some(name)).await {
            return Err(AgentError::Config(format!(
                "listen endpoint {}:{} already in use",
                config.ip, config.port
            )));
        }
        let new = FeedbackResponder::from_config(name, config, self.weak_handle());
        new.initialise(&self.monitors_snapshot().await).await?;
        self.replace_responder_entry(name, new.clone()).await;
        if old.is_running().await {
            old.stop().await?;
            new.start().await?;
        }
        self.mark_unsaved().await;
        Ok(())
    }

    async fn api_delete_responder(&self, name: &str) -> Result<()> {
        if name == "api" {
            return Err(LifecycleError::ApiResponderProtected.into());
        }
        let responder = self.get_responder(name).await?;
        if responder.is_running().await {
            responder.stop().await?;
        }
        self.remove_responder_entry(name).await;
        self.mark_unsaved().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Source actions
    // ------------------------------------------------------------------

    async fn handle_source_action(&self, request: &ApiRequest) -> Result<()> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        let monitor_name = normalise_name(
            request
                .monitor
                .as_deref()
                .ok_or_else(|| AgentError::Config("no source monitor specified".into()))?,
        )?;
        let monitors = self.monitors_snapshot().await;
        match request.action.as_str() {
            "add" => {
                responder
                    .add_source(
                        &monitors,
                        &monitor_name,
                        request.significance,
                        request.max_value,
                        request.threshold,
                    )
                    .await?
            }
            "edit" => {
                responder
                    .edit_source(
                        &monitor_name,
                        request.significance,
                        request.max_value,
                        request.threshold,
                    )
                    .await?
            }
            "delete" => responder.delete_source(&monitor_name).await?,
            other => {
                return Err(AgentError::Config(format!(
                    "unknown action '{other}' for source"
                )))
            }
        }
        self.mark_unsaved().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only and administrative actions
    // ------------------------------------------------------------------

    async fn api_get_feedback(&self, request: &ApiRequest) -> Result<String> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        if responder.is_api().await {
            return Err(AgentError::Config(
                "the API responder serves no feedback".into(),
            ));
        }
        let reply = responder.feedback_reply().await;
        Ok(reply.trim_end().to_string())
    }

    async fn api_get_sources(
        &self,
        request: &ApiRequest,
    ) -> Result<std::collections::BTreeMap<String, crate::responder::FeedbackSource>> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        Ok(responder.sources_snapshot().await)
    }

    async fn api_set_commands(&self, request: &ApiRequest) -> Result<()> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        responder
            .set_commands(request.command_list.as_deref(), request.command_interval)
            .await?;
        self.mark_unsaved().await;
        Ok(())
    }

    async fn api_set_threshold(&self, request: &ApiRequest) -> Result<()> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        let mode = match request.threshold_mode.as_deref() {
            Some(mode) => Some(ThresholdMode::parse(mode)?),
            None => None,
        };
        responder
            .set_threshold(mode, request.threshold_max)
            .await?;
        self.mark_unsaved().await;
        Ok(())
    }

    async fn api_set_interval(&self, request: &ApiRequest) -> Result<()> {
        let responder = self
            .get_responder(&normalise_name(&request.target_name)?)
            .await?;
        let interval = request.command_interval.ok_or_else(|| {
            AgentError::Config("invalid command interval specified".into())
        })?;
        responder.set_commands(None, Some(interval)).await?;
        self.mark_unsaved().await;
        Ok(())
    }

    /// Latches one or all responders. An empty target applies the state to
    /// every feedback responder.
    async fn api_set_online_state(
        &self,
        target: &str,
        online: bool,
        override_mask: CommandMask,
    ) -> Result<()> {
        let target = target.trim();
        if target.is_empty() {
            for responder in self.responders_snapshot().await.into_values() {
                if !responder.is_api().await {
                    responder.set_command_state(online, override_mask).await;
                }
            }
            return Ok(());
        }
        let responder = self.get_responder(&normalise_name(target)?).await?;
        if responder.is_api().await {
            return Err(AgentError::Config(
                "the API responder accepts no commands".into(),
            ));
        }
        responder.set_command_state(online, override_mask).await;
        Ok(())
    }
}
