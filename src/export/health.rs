use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for aggregator health and observability.
///
/// All metrics use the "minewatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total delta events received from the stream.
    pub events_received: Counter,
    /// Total event batches flushed toward the scheduler.
    pub batches_flushed: Counter,
    /// Total reconciliation polls completed.
    pub polls_completed: Counter,
    /// Total poll results discarded because a newer generation superseded them.
    pub stale_polls_discarded: Counter,
    /// Aggregation API requests by endpoint and status.
    pub api_requests_total: CounterVec,
    /// Aggregation API request duration by endpoint.
    pub api_request_duration: HistogramVec,
    /// Rows in the current leaderboard ledger.
    pub ledger_entries: Gauge,
    /// Retained buckets per metric series.
    pub buckets_retained: GaugeVec,
    /// Event stream sources with a live subscription.
    pub sources_active: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total delta events received from the stream.",
            )
            .namespace("minewatch"),
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new(
                "batches_flushed_total",
                "Total event batches flushed toward the scheduler.",
            )
            .namespace("minewatch"),
        )?;
        let polls_completed = Counter::with_opts(
            Opts::new(
                "polls_completed_total",
                "Total reconciliation polls completed.",
            )
            .namespace("minewatch"),
        )?;
        let stale_polls_discarded = Counter::with_opts(
            Opts::new(
                "stale_polls_discarded_total",
                "Total poll results discarded because a newer generation superseded them.",
            )
            .namespace("minewatch"),
        )?;
        let api_requests_total = CounterVec::new(
            Opts::new(
                "api_requests_total",
                "Total aggregation API requests by endpoint and status.",
            )
            .namespace("minewatch"),
            &["endpoint", "status"],
        )?;
        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Aggregation API request duration by endpoint.",
            )
            .namespace("minewatch")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;
        let ledger_entries = Gauge::with_opts(
            Opts::new("ledger_entries", "Rows in the current leaderboard ledger.")
                .namespace("minewatch"),
        )?;
        let buckets_retained = GaugeVec::new(
            Opts::new("buckets_retained", "Retained buckets per metric series.")
                .namespace("minewatch"),
            &["metric"],
        )?;
        let sources_active = Gauge::with_opts(
            Opts::new(
                "sources_active",
                "Event stream sources with a live subscription.",
            )
            .namespace("minewatch"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(polls_completed.clone()))?;
        registry.register(Box::new(stale_polls_discarded.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;
        registry.register(Box::new(ledger_entries.clone()))?;
        registry.register(Box::new(buckets_retained.clone()))?;
        registry.register(Box::new(sources_active.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            batches_flushed,
            polls_completed,
            stale_polls_discarded,
            api_requests_total,
            api_request_duration,
            ledger_entries,
            buckets_retained,
            sources_active,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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
