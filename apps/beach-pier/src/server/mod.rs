pub mod control;
pub mod pty;
pub mod relay;
pub mod routes;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use pty::SpawnConfig;

/// State shared by every request: the spawn template plus the signals used to
/// stop live sessions on shutdown.
pub struct AppState {
    /// Template cloned into every new pty session.
    pub template: SpawnConfig,
    /// Present when a Prometheus recorder is installed for this process.
    pub metrics: Option<PrometheusHandle>,
    shutdown: watch::Sender<bool>,
    sessions: watch::Sender<usize>,
}

impl AppState {
    pub fn new(template: SpawnConfig) -> Self {
        Self {
            template,
            metrics: None,
            shutdown: watch::Sender::new(false),
            sessions: watch::Sender::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Asks every live session to close its socket and stops the listeners.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    /// Waits until every session has been torn down. Returns `false` if some
    /// were still open when `grace` ran out.
    pub async fn drain_sessions(&self, grace: Duration) -> bool {
        let mut sessions = self.sessions.subscribe();
        let drained = matches!(
            tokio::time::timeout(grace, sessions.wait_for(|open| *open == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.send_modify(|open| *open += 1);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.send_modify(|open| *open = open.saturating_sub(1));
    }
}

/// Binds `addr`, failing fast when the port is taken.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.with_context(|| {
        format!("failed to bind {addr}; is another beach-pier (or ttyd) already running on that port?")
    })
}

/// Router for the optional lab-page listener.
pub fn static_router(dir: &Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
}

/// Runs the relay (and the static lab server when configured) until Ctrl-C.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let mut state = AppState::new(config.template.clone());
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    let state = Arc::new(state);

    // Bind everything before serving anything, so a taken port fails the whole start.
    let relay_listener = bind(config.listen_addr).await?;
    let static_listener = match &config.static_site {
        Some(site) => Some((bind(site.addr).await?, site.dir.clone())),
        None => None,
    };

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        signal_state.begin_shutdown();
    });

    info!(addr = %config.listen_addr, "beach-pier relay listening");
    let relay = axum::serve(relay_listener, routes::router(Arc::clone(&state)))
        .with_graceful_shutdown(wait_for_shutdown(state.shutdown_signal()));

    match static_listener {
        Some((listener, dir)) => {
            info!(
                addr = %listener.local_addr().context("static listener address")?,
                dir = %dir.display(),
                "serving lab pages"
            );
            let site = axum::serve(listener, static_router(&dir))
                .with_graceful_shutdown(wait_for_shutdown(state.shutdown_signal()));
            let (relay_result, site_result) = tokio::join!(relay, site);
            relay_result.context("relay server failed")?;
            site_result.context("static server failed")?;
        }
        None => relay.await.context("relay server failed")?,
    }

    info!(
        sessions = state.active_sessions(),
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; closing live sessions"
    );
    if !state.drain_sessions(config.shutdown_grace).await {
        warn!(
            sessions = state.active_sessions(),
            "sessions still open after the shutdown grace period"
        );
    }
    info!("beach-pier stopped");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
