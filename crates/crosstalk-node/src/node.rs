//! Node runtime.
//!
//! Starts the broker, serves `/health` and `/status`, publishes every stdin
//! line, and logs every payload received from peers.

use crate::config::Config;
use crate::metrics;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use bytes::Bytes;
use crosstalk_core::{
    build_broker, Broker, BrokerDeps, NamedClient, PayloadHandler, RemoteRoster, StaticRoster,
    TransportKind,
};
use crosstalk_transport::MemoryBus;
use serde::Serialize;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the broker gauges are refreshed.
const GAUGE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared node state.
pub struct AppState {
    /// The broker.
    pub broker: Arc<dyn Broker>,
    /// Peer rosters learned from presence announcements.
    pub peers: Arc<RemoteRoster>,
    /// Clients announced by this node.
    pub roster: Arc<StaticRoster>,
}

/// Logs payloads from peers.
struct LogHandler;

#[async_trait]
impl PayloadHandler for LogHandler {
    async fn on_message_received(&self, channel_id: &str, sender: Option<&str>, payload: Bytes) {
        metrics::record_received(payload.len());
        info!(
            channel = channel_id,
            sender = sender.unwrap_or("-"),
            len = payload.len(),
            text = %String::from_utf8_lossy(&payload),
            "Received payload"
        );
    }
}

impl AppState {
    /// Build the broker and its collaborators from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker configuration is invalid or asks for
    /// the relay transport, which needs a proxy host.
    pub fn new(config: &Config) -> Result<Self> {
        let broker_config = config.broker_config();
        if broker_config.kind() == TransportKind::Relay {
            bail!("relay transport needs a proxy host; a standalone node can only use the bus");
        }

        let roster = Arc::new(StaticRoster::new());
        for client in &config.clients {
            let name = client.name.clone().unwrap_or_else(|| client.id.clone());
            roster.add(Arc::new(NamedClient::new(client.id.clone(), name)));
        }

        let peers = Arc::new(RemoteRoster::new(broker_config.presence().roster_ttl));
        let mut deps = BrokerDeps::new(Arc::new(LogHandler), roster.clone())
            .with_peer_roster(Arc::clone(&peers));
        if config.uses_memory_bus() {
            warn!("memory:// bus is private to this process; no peers will be seen");
            deps = deps.with_connector(Arc::new(MemoryBus::new()));
        }

        let broker = build_broker(broker_config, deps).context("Failed to build broker")?;
        Ok(Self {
            broker,
            peers,
            roster,
        })
    }
}

/// Run the node until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the node cannot be set up or the HTTP server fails.
pub async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    let state = Arc::new(AppState::new(&config)?);

    // Without a broker the node still serves /health so operators can see it
    if let Err(e) = state.broker.start().await {
        error!(error = %e, "Broker did not start; running without cross-server messaging");
    }

    let gauges = tokio::spawn(update_gauges(Arc::clone(&state)));
    let stdin = tokio::spawn(forward_stdin(Arc::clone(&state), spawn_stdin_reader()));

    if config.http.enabled {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .with_state(Arc::clone(&state));

        let addr = config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(%addr, "HTTP endpoint listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    stdin.abort();
    gauges.abort();
    state.broker.stop().await;
    info!("Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Read stdin on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    let reader = std::thread::Builder::new()
        .name("crosstalk-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        });
    if let Err(e) = reader {
        warn!(error = %e, "Could not start stdin reader");
    }
    rx
}

/// Publish each stdin line as one payload.
async fn forward_stdin(state: Arc<AppState>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        if line.is_empty() {
            continue;
        }

        let len = line.len();
        match state.broker.send_data(Bytes::from(line)).await {
            Ok(()) => metrics::record_sent(len),
            Err(e) => {
                metrics::record_send_failure(&e);
                warn!(error = %e, "Send failed");
            }
        }
    }
    debug!("Stdin closed");
}

async fn update_gauges(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(GAUGE_INTERVAL);
    loop {
        interval.tick().await;
        metrics::set_broker_state(state.broker.is_connected(), state.peers.len());
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// A peer as reported by `/status`.
#[derive(Debug, Serialize)]
struct PeerStatus {
    server: String,
    timestamp: u64,
    clients: Vec<String>,
}

/// Broker state as reported by `/status`.
#[derive(Debug, Serialize)]
struct NodeStatus {
    server: String,
    transport: String,
    started: bool,
    connected: bool,
    local_clients: usize,
    peers: Vec<PeerStatus>,
}

fn node_status(state: &AppState) -> NodeStatus {
    let peers = state
        .peers
        .servers()
        .into_iter()
        .filter_map(|server| state.peers.snapshot(&server))
        .map(|roster| PeerStatus {
            server: roster.server,
            timestamp: roster.timestamp,
            clients: roster.clients.into_iter().map(|c| c.name).collect(),
        })
        .collect();

    NodeStatus {
        server: state.broker.server_name().to_string(),
        transport: state.broker.kind().to_string(),
        started: state.broker.is_started(),
        connected: state.broker.is_connected(),
        local_clients: state.roster.len(),
        peers,
    }
}

/// Status handler.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(node_status(&state))
}
