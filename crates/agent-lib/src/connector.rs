//! Network protocol connectors for the feedback responder
//!
//! A connector owns one listener. `listen` blocks until the listener shuts
//! down; `close` unblocks it, which the responder treats as a clean stop.
//! Startup is confirmed through a one-shot channel carrying the bound
//! address, so a responder's start call only returns once the listener is
//! actually accepting.

use crate::error::{AgentError, Result};
use crate::responder::FeedbackResponder;
use crate::tls::TlsMaterial;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, warn};

/// How long a closing HTTP listener waits for in-flight requests.
const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Serves requests until closed. Exactly one message is sent on
    /// `ready`: the bound address once accepting, or the startup failure.
    async fn listen(
        &self,
        responder: Arc<FeedbackResponder>,
        addr: SocketAddr,
        ready: oneshot::Sender<Result<SocketAddr>>,
    );

    /// Unblocks the accept loop.
    async fn close(&self);
}

// ------------------------------------------------------------------
// TCP
// ------------------------------------------------------------------

/// Raw TCP connector: every accepted connection receives one feedback
/// reply and is then closed by the server.
pub struct TcpConnector {
    shutdown: watch::Sender<bool>,
}

impl TcpConnector {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolConnector for TcpConnector {
    async fn listen(
        &self,
        responder: Arc<FeedbackResponder>,
        addr: SocketAddr,
        ready: oneshot::Sender<Result<SocketAddr>>,
    ) {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(Err(AgentError::Connector(format!(
                    "TCP bind on {addr} failed: {err}"
                ))));
                return;
            }
        };
        let bound = match listener.local_addr() {
            Ok(bound) => bound,
            Err(err) => {
                let _ = ready.send(Err(AgentError::Connector(err.to_string())));
                return;
            }
        };
        let _ = ready.send(Ok(bound));

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let responder = responder.clone();
                            tokio::spawn(handle_tcp_connection(responder, stream));
                        }
                        Err(err) => {
                            warn!("TCP accept failed: {err}");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn handle_tcp_connection(
    responder: Arc<FeedbackResponder>,
    mut stream: tokio::net::TcpStream,
) {
    let (reply, _) = responder.build_reply("").await;
    let _ = stream.write_all(reply.as_bytes()).await;
    // Always close after the reply: some peers block until they see FIN.
    let _ = stream.shutdown().await;
}

// ------------------------------------------------------------------
// HTTP / HTTPS
// ------------------------------------------------------------------

/// HTTP connector, optionally terminating TLS with the agent's in-memory
/// certificate. Used for the `http`, `https` and `https-api` protocols.
pub struct HttpConnector {
    handle: Handle,
    tls: Option<TlsMaterial>,
}

impl HttpConnector {
    pub fn new(tls: Option<TlsMaterial>) -> Self {
        Self {
            handle: Handle::new(),
            tls,
        }
    }
}

#[async_trait]
impl ProtocolConnector for HttpConnector {
    async fn listen(
        &self,
        responder: Arc<FeedbackResponder>,
        addr: SocketAddr,
        ready: oneshot::Sender<Result<SocketAddr>>,
    ) {
        let tls_config = match &self.tls {
            Some(material) => {
                match RustlsConfig::from_der(
                    vec![material.cert_der.clone()],
                    material.key_der.clone(),
                )
                .await
                {
                    Ok(config) => Some(config),
                    Err(err) => {
                        let _ = ready.send(Err(AgentError::Connector(format!(
                            "TLS configuration failed: {err}"
                        ))));
                        return;
                    }
                }
            }
            None => None,
        };

        let std_listener = match std::net::TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(Err(AgentError::Connector(format!(
                    "HTTP bind on {addr} failed: {err}"
                ))));
                return;
            }
        };
        if let Err(err) = std_listener.set_nonblocking(true) {
            let _ = ready.send(Err(AgentError::Connector(err.to_string())));
            return;
        }
        let bound = match std_listener.local_addr() {
            Ok(bound) => bound,
            Err(err) => {
                let _ = ready.send(Err(AgentError::Connector(err.to_string())));
                return;
            }
        };
        let _ = ready.send(Ok(bound));

        let router = Router::new()
            .fallback(handle_http_request)
            .with_state(responder);
        let service = router.into_make_service();
        let served = match tls_config {
            Some(config) => {
                axum_server::from_tcp_rustls(std_listener, config)
                    .handle(self.handle.clone())
                    .serve(service)
                    .await
            }
            None => {
                axum_server::from_tcp(std_listener)
                    .handle(self.handle.clone())
                    .serve(service)
                    .await
            }
        };
        if let Err(err) = served {
            error!("HTTP listener error: {err}");
        }
    }

    async fn close(&self) {
        self.handle
            .graceful_shutdown(Some(GRACEFUL_SHUTDOWN_DEADLINE));
    }
}

/// Serves any method on any path: the whole request body goes to the
/// responder's reply builder.
async fn handle_http_request(
    State(responder): State<Arc<FeedbackResponder>>,
    body: Bytes,
) -> Response {
    let body = String::from_utf8_lossy(&body).into_owned();
    let (_, response_timeout) = responder.timeouts().await;
    let is_api = responder.is_api().await;
    let built = tokio::time::timeout(response_timeout, responder.build_reply(&body)).await;
    let (reply, quit_after) = match built {
        Ok(result) => result,
        Err(_) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "response timed out\n").into_response();
        }
    };
    if quit_after {
        responder.signal_agent_quit().await;
    }
    let content_type = if is_api {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    ([(header::CONTENT_TYPE, content_type)], reply).into_response()
}
