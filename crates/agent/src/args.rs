//! Client CLI argument surface
//!
//! Every client subcommand maps onto one control-plane API request; the
//! API itself validates that the right parameters were supplied for an
//! action, so the flag set is shared across subcommands.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use lbfeedback_lib::metric::{
    MetricParams, PARAM_DISK_PATH, PARAM_SAMPLING_MS, PARAM_SCRIPT_NAME,
};
use lbfeedback_lib::ApiRequest;

/// Load balancer feedback agent and control CLI
#[derive(Parser)]
#[command(name = "lbfeedback", version, about = "Load balancer feedback agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent service
    RunAgent,
    /// Add a monitor, responder or source
    Add(TypedRequest),
    /// Edit a monitor, responder or source
    Edit(TypedRequest),
    /// Delete a monitor, responder or source
    Delete(TypedRequest),
    /// Start a monitor or responder
    Start(TypedRequest),
    /// Stop a monitor or responder
    Stop(TypedRequest),
    /// Restart a monitor or responder
    Restart(TypedRequest),
    /// Show the status of all services
    Status(RequestFlags),
    /// Read configuration, feedback or sources (type: config, feedback, sources)
    Get(TypedRequest),
    /// Change command or threshold settings (type: commands, threshold)
    Set(TypedRequest),
    /// Latch a responder online or offline (type: online, offline)
    Send(TypedRequest),
    /// Force a command state (type: halt, drain, online, save-config)
    Force(TypedRequest),
    /// Agent-wide control (type: restart, stop)
    Agent(TypedRequest),
}

#[derive(Args)]
pub struct TypedRequest {
    /// The action's type field (e.g. monitor, responder, source)
    pub target_type: String,
    #[command(flatten)]
    pub flags: RequestFlags,
}

#[derive(Args, Default)]
pub struct RequestFlags {
    /// Target service name
    #[arg(long)]
    pub name: Option<String>,

    /// Responder protocol (tcp, http, https)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Listen IP address; 'any' listens on all interfaces
    #[arg(long)]
    pub ip: Option<String>,

    /// Listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Request timeout in seconds
    #[arg(long = "request-timeout")]
    pub request_timeout: Option<u64>,

    /// Response timeout in seconds
    #[arg(long = "response-timeout")]
    pub response_timeout: Option<u64>,

    /// Command list ('default', 'none' or space separated tokens)
    #[arg(long = "command-list")]
    pub command_list: Option<String>,

    /// Command interval in seconds
    #[arg(long = "command-interval")]
    pub command_interval: Option<u64>,

    /// Threshold mode (none, any, overall, metric)
    #[arg(long = "threshold-mode")]
    pub threshold_mode: Option<String>,

    /// Overall threshold percent (0 disables)
    #[arg(long = "threshold-max")]
    pub threshold_max: Option<i64>,

    /// Source monitor name
    #[arg(long)]
    pub monitor: Option<String>,

    /// Source significance weight in [0, 1]
    #[arg(long)]
    pub significance: Option<f64>,

    /// Source clamp ceiling
    #[arg(long = "max-value")]
    pub max_value: Option<i64>,

    /// Per-source threshold percent (0 disables)
    #[arg(long)]
    pub threshold: Option<i64>,

    /// Metric type (cpu, ram, disk-usage, netconn, script)
    #[arg(long = "metric-type")]
    pub metric_type: Option<String>,

    /// Monitor sampling interval in milliseconds
    #[arg(long = "interval-ms")]
    pub interval_ms: Option<u64>,

    /// CPU sampling window in milliseconds
    #[arg(long = "sampling-ms")]
    pub sampling_ms: Option<u64>,

    /// Script metric file name (resolved in the agent config directory)
    #[arg(long = "script-name")]
    pub script_name: Option<String>,

    /// Disk usage metric target path
    #[arg(long = "disk-path")]
    pub disk_path: Option<String>,

    /// Enable statistical load shaping (true/false)
    #[arg(long = "smart-shape")]
    pub smart_shape: Option<bool>,

    /// Log threshold state changes (true/false)
    #[arg(long = "log-state-changes")]
    pub log_state_changes: Option<bool>,
}

/// Maps a parsed subcommand onto the API request it performs.
pub fn to_request(command: Command) -> Result<ApiRequest> {
    let (action, target_type, flags) = match command {
        Command::RunAgent => bail!("run-agent is not an API action"),
        Command::Add(t) => ("add", t.target_type, t.flags),
        Command::Edit(t) => ("edit", t.target_type, t.flags),
        Command::Delete(t) => ("delete", t.target_type, t.flags),
        Command::Start(t) => ("start", t.target_type, t.flags),
        Command::Stop(t) => ("stop", t.target_type, t.flags),
        Command::Restart(t) => ("restart", t.target_type, t.flags),
        Command::Status(flags) => ("status", String::new(), flags),
        Command::Get(t) => ("get", t.target_type, t.flags),
        Command::Set(t) => ("set", t.target_type, t.flags),
        Command::Send(t) => ("send", t.target_type, t.flags),
        Command::Force(t) => ("force", t.target_type, t.flags),
        Command::Agent(t) => ("agent", t.target_type, t.flags),
    };

    let mut request = ApiRequest {
        action: action.to_string(),
        target_type,
        ..ApiRequest::default()
    };
    if let Some(name) = flags.name {
        request.target_name = name;
    }
    request.protocol = flags.protocol;
    // 'any' stands in for '*' so the shell does not glob it.
    request.ip = flags
        .ip
        .map(|ip| if ip == "any" { "*".to_string() } else { ip });
    request.port = flags.port;
    request.request_timeout = flags.request_timeout;
    request.response_timeout = flags.response_timeout;
    request.command_list = flags.command_list;
    request.command_interval = flags.command_interval;
    request.threshold_mode = flags.threshold_mode;
    request.threshold_max = flags.threshold_max;
    request.monitor = flags.monitor;
    request.significance = flags.significance;
    request.max_value = flags.max_value;
    request.threshold = flags.threshold;
    request.metric_type = flags.metric_type;
    request.interval_ms = flags.interval_ms;
    request.smart_shape = flags.smart_shape;
    request.log_state_changes = flags.log_state_changes;

    let mut params = MetricParams::new();
    if let Some(sampling_ms) = flags.sampling_ms {
        params.insert(PARAM_SAMPLING_MS.to_string(), sampling_ms.to_string());
    }
    if let Some(script_name) = flags.script_name {
        params.insert(PARAM_SCRIPT_NAME.to_string(), script_name);
    }
    if let Some(disk_path) = flags.disk_path {
        params.insert(PARAM_DISK_PATH.to_string(), disk_path);
    }
    if !params.is_empty() {
        request.metric_config = Some(params);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        Cli::parse_from(args).command
    }

    #[test]
    fn test_any_ip_translates_to_wildcard() {
        let command = parse(&[
            "lbfeedback",
            "add",
            "responder",
            "--name",
            "web",
            "--protocol",
            "http",
            "--ip",
            "any",
            "--port",
            "8080",
        ]);
        let request = to_request(command).unwrap();
        assert_eq!(request.action, "add");
        assert_eq!(request.target_type, "responder");
        assert_eq!(request.target_name, "web");
        assert_eq!(request.ip.as_deref(), Some("*"));
        assert_eq!(request.port, Some(8080));
    }

    #[test]
    fn test_metric_flags_build_metric_config() {
        let command = parse(&[
            "lbfeedback",
            "add",
            "monitor",
            "--name",
            "cpu2",
            "--metric-type",
            "cpu",
            "--sampling-ms",
            "750",
            "--interval-ms",
            "2000",
        ]);
        let request = to_request(command).unwrap();
        assert_eq!(request.metric_type.as_deref(), Some("cpu"));
        assert_eq!(request.interval_ms, Some(2000));
        let params = request.metric_config.unwrap();
        assert_eq!(params.get(PARAM_SAMPLING_MS).map(String::as_str), Some("750"));
    }

    #[test]
    fn test_script_and_disk_flags() {
        let command = parse(&[
            "lbfeedback",
            "edit",
            "monitor",
            "--name",
            "disk",
            "--disk-path",
            "/var",
            "--script-name",
            "load.sh",
        ]);
        let request = to_request(command).unwrap();
        let params = request.metric_config.unwrap();
        assert_eq!(params.get(PARAM_DISK_PATH).map(String::as_str), Some("/var"));
        assert_eq!(
            params.get(PARAM_SCRIPT_NAME).map(String::as_str),
            Some("load.sh")
        );
    }

    #[test]
    fn test_status_takes_no_type() {
        let command = parse(&["lbfeedback", "status"]);
        let request = to_request(command).unwrap();
        assert_eq!(request.action, "status");
        assert!(request.target_type.is_empty());
    }

    #[test]
    fn test_set_threshold_flags() {
        let command = parse(&[
            "lbfeedback",
            "set",
            "threshold",
            "--name",
            "default",
            "--threshold-mode",
            "any",
            "--threshold-max",
            "20",
        ]);
        let request = to_request(command).unwrap();
        assert_eq!(request.target_type, "threshold");
        assert_eq!(request.threshold_mode.as_deref(), Some("any"));
        assert_eq!(request.threshold_max, Some(20));
    }

    #[test]
    fn test_run_agent_has_no_request_mapping() {
        assert!(to_request(Command::RunAgent).is_err());
    }
}
