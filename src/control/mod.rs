//! Runtime on/off control surface.
//!
//! The core handlers are transport-agnostic: a status read renders `on\n`
//! or `off\n`, and a command write accepts a single whitespace-trimmed
//! token presented at offset zero. The HTTP server below is one transport
//! over them; a file-like transport maps onto the same signatures.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::{Engine, EngineState};
use crate::export::health::HealthMetrics;

/// Errors surfaced by the control handlers.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The write carried anything but a single `on`/`off` token.
    #[error("invalid command {token:?}")]
    InvalidCommand { token: String },

    /// Command writes must start at offset zero.
    #[error("write at nonzero offset {offset}")]
    NonzeroOffset { offset: u64 },

    /// The command was valid but the engine transition failed.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Render the status text for a read.
pub fn render_status(state: EngineState) -> &'static str {
    match state {
        EngineState::Running => "on\n",
        EngineState::Disabled => "off\n",
    }
}

/// Apply one command write. Returns the number of bytes consumed.
///
/// `offset` models a file-like transport cursor; only writes starting at
/// zero are accepted.
pub async fn handle_command(
    engine: &Engine,
    offset: u64,
    data: &[u8],
) -> Result<usize, ControlError> {
    if offset != 0 {
        return Err(ControlError::NonzeroOffset { offset });
    }

    let token = std::str::from_utf8(data)
        .map_err(|_| ControlError::InvalidCommand {
            token: String::from_utf8_lossy(data).into_owned(),
        })?
        .trim();

    match token {
        "on" => engine.enable().await?,
        "off" => engine.disable().await?,
        _ => {
            return Err(ControlError::InvalidCommand {
                token: token.to_string(),
            })
        }
    }

    Ok(data.len())
}

/// HTTP transport for the control handlers.
pub struct ControlServer {
    addr: String,
    engine: Arc<Engine>,
    health: Arc<HealthMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Shared state for axum handlers.
struct AppState {
    engine: Arc<Engine>,
    health: Arc<HealthMetrics>,
}

impl ControlServer {
    /// Create a server bound to `addr` at start time.
    pub fn new(addr: &str, engine: Arc<Engine>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            engine,
            health,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving GET/POST /status.
    pub async fn start(&self) -> Result<()> {
        let app_state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            health: Arc::clone(&self.health),
        });

        let app = Router::new()
            .route("/status", get(status_read).post(status_write))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "control server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "control server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the control server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// GET /status - current engine state as text.
async fn status_read(State(state): State<Arc<AppState>>) -> &'static str {
    render_status(state.engine.status())
}

/// POST /status - apply an on/off command.
async fn status_write(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, String) {
    match handle_command(&state.engine, 0, &body).await {
        Ok(_) => {
            let token = String::from_utf8_lossy(&body).trim().to_string();
            state
                .health
                .control_commands
                .with_label_values(&[&token])
                .inc();

            (
                StatusCode::OK,
                render_status(state.engine.status()).to_string(),
            )
        }
        Err(err @ (ControlError::InvalidCommand { .. } | ControlError::NonzeroOffset { .. })) => {
            state
                .health
                .control_commands
                .with_label_values(&["invalid"])
                .inc();

            (StatusCode::BAD_REQUEST, format!("{err}\n"))
        }
        Err(ControlError::Engine(err)) => {
            warn!(error = %err, "control command failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}\n"))
        }
    }
}
