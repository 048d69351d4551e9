use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "tieroor" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total classified samples by class (near/far/throttled/other).
    pub samples_total: IntCounterVec,
    /// Samples in the most recent reporting period, by class.
    pub period_samples: IntGaugeVec,
    /// Total reporting ticks emitted.
    pub report_ticks: IntCounter,
    /// Whether sampling is enabled (1=on, 0=off).
    pub engine_enabled: IntGauge,
    /// Sample buffers currently active.
    pub buffers_active: IntGauge,
    /// Control surface commands by token (on/off/invalid).
    pub control_commands: IntCounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_total = IntCounterVec::new(
            Opts::new("samples_total", "Total classified samples by class.")
                .namespace("tieroor"),
            &["class"],
        )?;
        let period_samples = IntGaugeVec::new(
            Opts::new(
                "period_samples",
                "Samples in the most recent reporting period, by class.",
            )
            .namespace("tieroor"),
            &["class"],
        )?;
        let report_ticks = IntCounter::with_opts(
            Opts::new("report_ticks_total", "Total reporting ticks emitted.")
                .namespace("tieroor"),
        )?;
        let engine_enabled = IntGauge::with_opts(
            Opts::new("engine_enabled", "Whether sampling is enabled (1=on, 0=off).")
                .namespace("tieroor"),
        )?;
        let buffers_active = IntGauge::with_opts(
            Opts::new("buffers_active", "Sample buffers currently active.")
                .namespace("tieroor"),
        )?;
        let control_commands = IntCounterVec::new(
            Opts::new(
                "control_commands_total",
                "Control surface commands by token.",
            )
            .namespace("tieroor"),
            &["command"],
        )?;

        registry.register(Box::new(samples_total.clone()))?;
        registry.register(Box::new(period_samples.clone()))?;
        registry.register(Box::new(report_ticks.clone()))?;
        registry.register(Box::new(engine_enabled.clone()))?;
        registry.register(Box::new(buffers_active.clone()))?;
        registry.register(Box::new(control_commands.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_total,
            period_samples,
            report_ticks,
            engine_enabled,
            buffers_active,
            control_commands,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
