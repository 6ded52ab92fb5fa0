use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use relay_core::{
    ChannelDispatcher, Destination, DispatchError, EventSink, FanoutSink, Message, PipelineStats,
    RelayConfig, RelayError, RouteTable, SynthesisPipeline, TracingSink, Transport,
};

/// How long shutdown waits for accepted messages to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("invalid listen address: {0}")]
    Address(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

fn http_client(timeout_ms: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Delivers packaged messages to a platform adapter with `POST <endpoint>`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: http_client(timeout_ms),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, destination: &Destination, message: Message) -> std::result::Result<(), DispatchError> {
        let response = self
            .client
            .post(&destination.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| DispatchError::Unavailable(format!("{}: {}", destination.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Transport(format!(
                "{} answered {}",
                destination.endpoint, status
            )));
        }
        Ok(())
    }
}

/// Forwards adapter traffic to the bot core.
#[derive(Clone)]
pub struct UpstreamClient {
    url: String,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            url: url.into(),
            client: http_client(timeout_ms),
        }
    }

    pub async fn forward(&self, message: &Message) -> std::result::Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Transport(format!("upstream answered {}", status)));
        }
        Ok(())
    }
}

/// Counts invocations spawned by `/messages` that have not finished yet.
#[derive(Debug, Default)]
pub struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

pub struct InflightGuard(Arc<Inflight>);

impl Inflight {
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard(Arc::clone(self))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct BridgeState {
    pub pipeline: Arc<SynthesisPipeline>,
    pub stats: Arc<PipelineStats>,
    pub upstream: Option<UpstreamClient>,
    pub inflight: Arc<Inflight>,
    pub started_at: DateTime<Utc>,
}

impl BridgeState {
    pub fn new(
        pipeline: Arc<SynthesisPipeline>,
        stats: Arc<PipelineStats>,
        upstream: Option<UpstreamClient>,
    ) -> Self {
        Self {
            pipeline,
            stats,
            upstream,
            inflight: Arc::new(Inflight::default()),
            started_at: Utc::now(),
        }
    }

    /// Wait for accepted messages to finish, then flush the dispatcher.
    /// Returns false when `grace` ran out with invocations still running.
    pub async fn drain(&self, grace: Duration) -> bool {
        let pending = self.inflight.count();
        if pending > 0 {
            info!(target: "bridge", pending, "Waiting for in-flight messages");
        }
        let finished = tokio::time::timeout(grace, self.inflight.wait_idle())
            .await
            .is_ok();
        if !finished {
            warn!(target: "bridge", pending = self.inflight.count(), "Shutdown grace period elapsed");
        }
        self.pipeline.shutdown().await;
        finished
    }

    /// Wire pipeline, HTTP dispatch and sinks from a validated config.
    pub fn from_config(cfg: &RelayConfig) -> Result<Self> {
        let stats = Arc::new(PipelineStats::new(
            RouteTable::from_config(cfg).platforms().map(str::to_string),
        ));
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(stats.clone()),
        );
        let dispatcher = Arc::new(ChannelDispatcher::new(
            HttpTransport::new(cfg.dispatch.request_timeout_ms),
            cfg.dispatch.queue_capacity,
        ));
        let pipeline = SynthesisPipeline::from_config(cfg, dispatcher, sink)?;
        let upstream = cfg
            .upstream
            .as_ref()
            .map(|u| UpstreamClient::new(u.url.clone(), cfg.dispatch.request_timeout_ms));

        Ok(Self::new(Arc::new(pipeline), stats, upstream))
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/messages", post(messages_handler))
        .route("/upstream", post(upstream_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bot core response: processed in the background, accepted immediately.
async fn messages_handler(
    State(state): State<BridgeState>,
    Json(message): Json<Message>,
) -> impl IntoResponse {
    let id = message.id.clone();
    debug!(target: "bridge", message_id = %id, platform = %message.platform, "Message received");
    let pipeline = state.pipeline.clone();
    let guard = state.inflight.enter();
    tokio::spawn(async move {
        pipeline.handle(message).await;
        drop(guard);
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "message_id": id })),
    )
}

/// Adapter message headed for the bot core; advertises `tts_text` support first.
async fn upstream_handler(
    State(state): State<BridgeState>,
    Json(mut message): Json<Message>,
) -> impl IntoResponse {
    let Some(upstream) = state.upstream.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no upstream configured" })),
        );
    };
    let advertised = message.advertise_tts_capability();
    match upstream.forward(&message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "forwarded": true, "advertised": advertised })),
        ),
        Err(e) => {
            warn!(target: "bridge", message_id = %message.id, error = %e, "Upstream forward failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn health_handler(State(state): State<BridgeState>) -> impl IntoResponse {
    let registry = state.pipeline.registry();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at.to_rfc3339(),
        "providers": registry.len(),
        "enabled_providers": registry.enabled_providers().count(),
        "mode": registry.preferred_mode(),
        "voice_probability": state.pipeline.gate().probability(),
    }))
}

async fn stats_handler(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

/// Serve until ctrl-c.
pub async fn serve(cfg: RelayConfig) -> Result<()> {
    let state = BridgeState::from_config(&cfg)?;
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| BridgeError::Address(e.to_string()))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "bridge", %addr, "Relay bridge listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.drain(SHUTDOWN_GRACE).await;
    info!(target: "bridge", "Relay bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "bridge", error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(target: "bridge", "Shutdown signal received");
}
