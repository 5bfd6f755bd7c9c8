//! Integration tests for the control-plane receiver

use lbfeedback_lib::config;
use lbfeedback_lib::{ApiRequest, FeedbackAgent};
use std::path::Path;
use std::sync::Arc;

const TEST_KEY: &str = "00112233445566778899aabbccddeeff";

async fn test_agent(dir: &Path) -> Arc<FeedbackAgent> {
    let mut document = config::default_document();
    document.api_key = TEST_KEY.to_string();
    document.log_dir = String::new();
    // Ephemeral ports so parallel tests never collide.
    document.responders.get_mut("default").unwrap().port = 0;
    document.responders.get_mut("default").unwrap().ip = "127.0.0.1".to_string();
    document.responders.get_mut("api").unwrap().port = 0;
    FeedbackAgent::from_document(dir.to_path_buf(), document)
        .await
        .unwrap()
}

fn request(action: &str, target_type: &str, target_name: &str) -> ApiRequest {
    ApiRequest {
        api_key: TEST_KEY.to_string(),
        action: action.to_string(),
        target_type: target_type.to_string(),
        target_name: target_name.to_string(),
        ..ApiRequest::default()
    }
}

#[tokio::test]
async fn test_wrong_api_key_is_rejected_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    let mut bad = request("get", "config", "");
    bad.api_key = "ffeeddccbbaa99887766554433221100".to_string();
    let (response, quit) = agent.process_api_request(Ok(bad)).await;
    assert!(!quit);
    assert!(!response.success);
    assert_eq!(response.error_name.as_deref(), Some("bad-api-key"));
    assert!(response.current_config.is_none());
    // The echoed request never contains the key the caller sent.
    assert!(response.request.unwrap().api_key.is_empty());

    // With the right key the configuration is intact.
    let (response, _) = agent
        .process_api_request(Ok(request("get", "config", "")))
        .await;
    assert!(response.success);
    let document = response.current_config.unwrap();
    assert!(document.monitors.contains_key("cpu"));
    // The key is redacted from config reads.
    assert!(document.api_key.is_empty());
}

#[tokio::test]
async fn test_malformed_json_reports_syntax_error() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let (json, quit) = agent.receive_api_request("{not valid json").await;
    assert!(!quit);
    let response: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["error-name"], "json-syntax");
}

#[tokio::test]
async fn test_failed_monitor_edit_leaves_service_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    agent.start_all().await.unwrap();

    let mut edit = request("edit", "monitor", "cpu");
    edit.metric_type = Some("unknown".to_string());
    let (response, _) = agent.process_api_request(Ok(edit)).await;
    assert!(!response.success);

    // The live monitor still has its old configuration and keeps running.
    let (response, _) = agent
        .process_api_request(Ok(request("get", "config", "")))
        .await;
    let document = response.current_config.unwrap();
    assert_eq!(
        document.monitors["cpu"].metric_type,
        lbfeedback_lib::MetricKind::Cpu
    );
    let monitor = agent.get_monitor("cpu").await.unwrap();
    assert!(monitor.is_running().await);

    agent.stop_all().await;
}

#[tokio::test]
async fn test_weight_recomputation_across_source_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    // Add a RAM monitor, attach it to the default responder, then halve
    // its weight.
    let mut add_monitor = request("add", "monitor", "ram");
    add_monitor.metric_type = Some("ram".to_string());
    let (response, _) = agent.process_api_request(Ok(add_monitor)).await;
    assert!(response.success, "{:?}", response.message);

    let mut add_source = request("add", "source", "default");
    add_source.monitor = Some("ram".to_string());
    add_source.significance = Some(1.0);
    add_source.max_value = Some(100);
    let (response, _) = agent.process_api_request(Ok(add_source)).await;
    assert!(response.success, "{:?}", response.message);

    let mut edit_source = request("edit", "source", "default");
    edit_source.monitor = Some("ram".to_string());
    edit_source.significance = Some(0.5);
    let (response, _) = agent.process_api_request(Ok(edit_source)).await;
    assert!(response.success, "{:?}", response.message);

    let (response, _) = agent
        .process_api_request(Ok(request("get", "sources", "default")))
        .await;
    let sources = response.feedback_sources.unwrap();
    let cpu = sources["cpu"].relative_significance;
    let ram = sources["ram"].relative_significance;
    assert!((cpu - 2.0 / 3.0).abs() < 0.01, "cpu weight {cpu}");
    assert!((ram - 1.0 / 3.0).abs() < 0.01, "ram weight {ram}");
    assert!((cpu + ram - 1.0).abs() < 1e-9);

    // The mutations were auto-saved to the config file.
    let persisted = config::load_document(dir.path()).unwrap().unwrap();
    assert!(persisted.monitors.contains_key("ram"));
    assert!(persisted.responders["default"]
        .feedback_sources
        .contains_key("ram"));

    agent.get_monitor("ram").await.unwrap().stop().await.unwrap();
}

#[tokio::test]
async fn test_delete_referenced_monitor_fails_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    let (response, _) = agent
        .process_api_request(Ok(request("delete", "monitor", "cpu")))
        .await;
    assert!(!response.success);
    assert!(agent.get_monitor("cpu").await.is_ok());

    let mut delete_source = request("delete", "source", "default");
    delete_source.monitor = Some("cpu".to_string());
    let (response, _) = agent.process_api_request(Ok(delete_source)).await;
    assert!(response.success, "{:?}", response.message);

    let (response, _) = agent
        .process_api_request(Ok(request("delete", "monitor", "cpu")))
        .await;
    assert!(response.success, "{:?}", response.message);
    assert!(agent.get_monitor("cpu").await.is_err());
}

#[tokio::test]
async fn test_api_responder_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let (response, _) = agent
        .process_api_request(Ok(request("delete", "responder", "api")))
        .await;
    assert!(!response.success);
    assert!(agent.get_responder("api").await.is_ok());
}

#[tokio::test]
async fn test_set_commands_persists_and_restores_default() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    let mut disable = request("set", "commands", "default");
    disable.command_list = Some("none".to_string());
    let (response, _) = agent.process_api_request(Ok(disable)).await;
    assert!(response.success, "{:?}", response.message);
    let persisted = config::load_document(dir.path()).unwrap().unwrap();
    assert_eq!(persisted.responders["default"].command_list, "none");

    let mut restore = request("set", "commands", "default");
    restore.command_list = Some("default".to_string());
    let (response, _) = agent.process_api_request(Ok(restore)).await;
    assert!(response.success);
    let persisted = config::load_document(dir.path()).unwrap().unwrap();
    assert_eq!(persisted.responders["default"].command_list, "default");
}

#[tokio::test]
async fn test_set_threshold_and_get_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    let mut set = request("set", "threshold", "default");
    set.threshold_mode = Some("any".to_string());
    set.threshold_max = Some(20);
    let (response, _) = agent.process_api_request(Ok(set)).await;
    assert!(response.success, "{:?}", response.message);

    // No sample has completed, so the cpu source reports its ceiling:
    // load 100 trips the threshold and the latch goes offline.
    let (response, _) = agent
        .process_api_request(Ok(request("get", "feedback", "default")))
        .await;
    assert!(response.success);
    let output = response.output.unwrap();
    assert_eq!(output, "drain 0%");

    // Out-of-range threshold is rejected.
    let mut bad = request("set", "threshold", "default");
    bad.threshold_max = Some(250);
    let (response, _) = agent.process_api_request(Ok(bad)).await;
    assert!(!response.success);
}

#[tokio::test]
async fn test_send_and_force_latch_all_responders() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;

    // Force halt with no target latches every feedback responder.
    let (response, _) = agent
        .process_api_request(Ok(request("force", "halt", "")))
        .await;
    assert!(response.success, "{:?}", response.message);
    let (response, _) = agent
        .process_api_request(Ok(request("get", "feedback", "default")))
        .await;
    let output = response.output.unwrap();
    assert!(output.starts_with("maint "), "unexpected output {output:?}");

    // A plain send keeps the configured command tokens.
    let (response, _) = agent
        .process_api_request(Ok(request("send", "online", "default")))
        .await;
    assert!(response.success);
    let (response, _) = agent
        .process_api_request(Ok(request("get", "feedback", "default")))
        .await;
    let output = response.output.unwrap();
    assert!(
        output.starts_with("up ready "),
        "unexpected output {output:?}"
    );
}

#[tokio::test]
async fn test_agent_stop_requests_quit_after_response() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let body = serde_json::to_string(&request("agent", "stop", "")).unwrap();
    let (json, quit) = agent.receive_api_request(&body).await;
    assert!(quit);
    let response: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn test_status_lists_every_service() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let (response, _) = agent
        .process_api_request(Ok(request("status", "", "")))
        .await;
    assert!(response.success);
    let status = response.status.unwrap();
    let names: Vec<(String, String)> = status
        .iter()
        .map(|row| (row.service_type.clone(), row.name.clone()))
        .collect();
    assert!(names.contains(&("monitor".to_string(), "cpu".to_string())));
    assert!(names.contains(&("responder".to_string(), "default".to_string())));
    assert!(names.contains(&("responder".to_string(), "api".to_string())));
    for row in &status {
        assert_eq!(row.status, "stopped");
    }
}

#[tokio::test]
async fn test_duplicate_listen_endpoint_rejected() {
    // Two responders on the same (ip, port) tuple cannot coexist.
    let dir = tempfile::tempdir().unwrap();
    let mut document = config::default_document();
    document.api_key = TEST_KEY.to_string();
    document.log_dir = String::new();
    let clone = document.responders["default"].clone();
    document.responders.insert("clone".to_string(), clone);
    assert!(
        FeedbackAgent::from_document(dir.path().to_path_buf(), document)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_missing_target_name_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let (response, _) = agent
        .process_api_request(Ok(request("edit", "monitor", "")))
        .await;
    assert!(!response.success);
    assert_eq!(response.error_name.as_deref(), Some("missing-target"));
}

#[tokio::test]
async fn test_response_envelope_shape() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path()).await;
    let mut status = request("status", "", "");
    status.id = Some(7);
    let (json, _) = agent
        .receive_api_request(&serde_json::to_string(&status).unwrap())
        .await;
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["service-name"], "lbfeedback");
    assert_eq!(value["id"], 7);
    assert!(value["version"].is_string());
    // Tag is a random 32-bit hex string.
    assert_eq!(value["tag"].as_str().unwrap().len(), 8);
    // The echoed request has its key redacted.
    assert!(value["request"].get("api-key").is_none());
}
