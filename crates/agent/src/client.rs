//! API client for the agent control plane
//!
//! Reads the API host, port and key from the persisted agent config and
//! posts JSON requests over HTTPS. Certificate verification is disabled
//! because the agent's certificate is ephemeral and self-signed.

use anyhow::{anyhow, Context, Result};
use lbfeedback_lib::config;
use lbfeedback_lib::{ApiRequest, ApiResponse};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;

pub struct ApiClient {
    client: Client,
    url: String,
    api_key: String,
}

impl ApiClient {
    /// Builds a client from the agent configuration in `config_dir`.
    pub fn from_config(config_dir: &Path) -> Result<Self> {
        let document = config::load_document(config_dir)
            .map_err(|err| anyhow!("unable to load agent config for API credentials: {err}"))?
            .with_context(|| {
                format!(
                    "no agent configuration found in '{}'; is the agent installed?",
                    config_dir.display()
                )
            })?;
        let api = document
            .responders
            .get("api")
            .context("failed to obtain API config: no 'api' responder configured")?;
        let host = if api.ip == "*" {
            "127.0.0.1"
        } else {
            api.ip.as_str()
        };
        let url = format!("https://{host}:{}/", api.port);
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTPS client")?;
        Ok(Self {
            client,
            url,
            api_key: document.api_key,
        })
    }

    /// Sends one request, injecting the configured API key.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut request = request.clone();
        request.api_key = self.api_key.clone();
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context(
                "the CLI client failed to establish a connection to the agent;\n\
                 please check that the agent is running and able to accept API requests",
            )?;
        let body = response
            .text()
            .await
            .context("failed to read the agent's response")?;
        serde_json::from_str(&body).context("failed to parse the agent's response")
    }
}
