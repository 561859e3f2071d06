use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "relaymon";

/// Prometheus metrics describing the collector's own health.
///
/// All metrics use the "relaymon" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Snapshot ===
    /// Total snapshots published by the coordinator.
    pub snapshots_published: Counter,
    /// Whether each producer's contribution to the latest snapshot is stale.
    pub stale_producers: GaugeVec,
    /// Producer workers that terminated for good, by worker.
    pub worker_terminations: CounterVec,

    // === Resolver ===
    /// Strategy switches after repeated failures.
    pub resolver_strategy_switches: Counter,
    /// Duration of connection lookups.
    pub resolver_lookup_duration: Histogram,
    /// Current resolver polling interval.
    pub resolver_interval_seconds: Gauge,
    /// Connections in the latest listing.
    pub resolver_connections: Gauge,

    // === Events ===
    pub events_received: Counter,
    pub events_deduplicated: Counter,
    pub events_evicted: Counter,

    // === Sampler / differ / control ===
    /// Metrics that failed to sample, by metric.
    pub sampler_errors: CounterVec,
    pub confdiff_runs: Counter,
    /// Failed control channel requests by query and error kind.
    pub control_request_failures: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let snapshots_published = Counter::with_opts(
            Opts::new("snapshots_published_total", "Total snapshots published.")
                .namespace(NAMESPACE),
        )?;
        let stale_producers = GaugeVec::new(
            Opts::new(
                "stale_producers",
                "Whether the producer's latest value is stale (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["producer"],
        )?;
        let worker_terminations = CounterVec::new(
            Opts::new(
                "worker_terminations_total",
                "Producer workers terminated by a fatal condition.",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )?;

        let resolver_strategy_switches = Counter::with_opts(
            Opts::new(
                "resolver_strategy_switches_total",
                "Total connection resolver strategy switches.",
            )
            .namespace(NAMESPACE),
        )?;
        let resolver_lookup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "resolver_lookup_duration_seconds",
                "Time to list the daemon's connections.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let resolver_interval_seconds = Gauge::with_opts(
            Opts::new(
                "resolver_interval_seconds",
                "Current connection resolver polling interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let resolver_connections = Gauge::with_opts(
            Opts::new(
                "resolver_connections",
                "Connections in the latest listing.",
            )
            .namespace(NAMESPACE),
        )?;

        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total events accepted by the normalizer.")
                .namespace(NAMESPACE),
        )?;
        let events_deduplicated = Counter::with_opts(
            Opts::new(
                "events_deduplicated_total",
                "Total events collapsed into a previous entry.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_evicted = Counter::with_opts(
            Opts::new(
                "events_evicted_total",
                "Total events evicted from the bounded buffer.",
            )
            .namespace(NAMESPACE),
        )?;

        let sampler_errors = CounterVec::new(
            Opts::new("sampler_errors_total", "Total sampling failures by metric.")
                .namespace(NAMESPACE),
            &["metric"],
        )?;
        let confdiff_runs = Counter::with_opts(
            Opts::new("confdiff_runs_total", "Total configuration validation passes.")
                .namespace(NAMESPACE),
        )?;
        let control_request_failures = CounterVec::new(
            Opts::new(
                "control_request_failures_total",
                "Failed control channel requests by query and error kind.",
            )
            .namespace(NAMESPACE),
            &["query", "kind"],
        )?;

        registry.register(Box::new(snapshots_published.clone()))?;
        registry.register(Box::new(stale_producers.clone()))?;
        registry.register(Box::new(worker_terminations.clone()))?;
        registry.register(Box::new(resolver_strategy_switches.clone()))?;
        registry.register(Box::new(resolver_lookup_duration.clone()))?;
        registry.register(Box::new(resolver_interval_seconds.clone()))?;
        registry.register(Box::new(resolver_connections.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_deduplicated.clone()))?;
        registry.register(Box::new(events_evicted.clone()))?;
        registry.register(Box::new(sampler_errors.clone()))?;
        registry.register(Box::new(confdiff_runs.clone()))?;
        registry.register(Box::new(control_request_failures.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            snapshots_published,
            stale_producers,
            worker_terminations,
            resolver_strategy_switches,
            resolver_lookup_duration,
            resolver_interval_seconds,
            resolver_connections,
            events_received,
            events_deduplicated,
            events_evicted,
            sampler_errors,
            confdiff_runs,
            control_request_failures,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9091"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
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

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = HealthMetrics::new("").expect("metrics");
        metrics.snapshots_published.inc();
        metrics
            .stale_producers
            .with_label_values(&["connections"])
            .set(1.0);
        metrics
            .control_request_failures
            .with_label_values(&["pid", "timeout"])
            .inc();

        let text = metrics.render().expect("render");
        assert!(text.contains("relaymon_snapshots_published_total 1"));
        assert!(text.contains("relaymon_stale_producers{producer=\"connections\"} 1"));
        assert!(text.contains(
            "relaymon_control_request_failures_total{kind=\"timeout\",query=\"pid\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.start().await.expect("start");
        metrics.stop().await.expect("stop");
    }
}
