use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "poolscope";

/// Prometheus metrics for agent health.
///
/// All metrics use the "poolscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Operation events received from the capture.
    pub events_received: Counter,
    /// Capture records dropped because they could not be parsed.
    pub events_dropped: Counter,
    /// Capture sessions started.
    pub sessions_started: Counter,
    /// Capture sessions that ended in failure.
    pub sessions_failed: Counter,
    /// Capture sessions that reached their window limit or ended cleanly.
    pub sessions_completed: Counter,
    /// Windows closed and handed to the publisher.
    pub windows_flushed: Counter,
    /// Samples written to the transport.
    pub samples_published: Counter,
    /// Transport errors and timeouts.
    pub publish_errors: Counter,
    /// Windows dropped because the publish queue was full.
    pub publish_windows_dropped: Counter,
    /// Identifier encodings computed (cache misses).
    pub identifier_cache_misses: Counter,
    /// Identifiers cached by the current session.
    pub identifier_cache_size: Gauge,
    /// Supervisor state (0=stopped, 1=starting, 2=running, 3=failed).
    pub supervisor_state: Gauge,
    /// Time to snapshot and enqueue one window.
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let c = Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let g = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let events_received = counter(
            "events_received_total",
            "Total operation events received from the capture.",
        )?;
        let events_dropped = counter(
            "events_dropped_total",
            "Total capture records dropped due to parse errors.",
        )?;
        let sessions_started = counter("sessions_started_total", "Total capture sessions started.")?;
        let sessions_failed = counter(
            "sessions_failed_total",
            "Total capture sessions that ended in failure.",
        )?;
        let sessions_completed = counter(
            "sessions_completed_total",
            "Total capture sessions that ended without failure.",
        )?;
        let windows_flushed = counter(
            "windows_flushed_total",
            "Total aggregation windows flushed.",
        )?;
        let samples_published = counter(
            "samples_published_total",
            "Total metric samples written to the transport.",
        )?;
        let publish_errors = counter(
            "publish_errors_total",
            "Total transport errors and timeouts while publishing.",
        )?;
        let publish_windows_dropped = counter(
            "publish_windows_dropped_total",
            "Total windows dropped because the publish queue was full.",
        )?;
        let identifier_cache_misses = counter(
            "identifier_cache_misses_total",
            "Total identifier encodings computed.",
        )?;
        let identifier_cache_size = gauge(
            "identifier_cache_size",
            "Identifiers cached by the current session.",
        )?;
        let supervisor_state = gauge(
            "supervisor_state",
            "Capture supervisor state (0=stopped, 1=starting, 2=running, 3=failed).",
        )?;

        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to snapshot and enqueue one window.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            sessions_started,
            sessions_failed,
            sessions_completed,
            windows_flushed,
            samples_published,
            publish_errors,
            publish_windows_dropped,
            identifier_cache_misses,
            identifier_cache_size,
            supervisor_state,
            flush_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
