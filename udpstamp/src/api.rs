use crate::state::{LatencyState, PointCounters, StampCounters};
use crate::storage::Storage;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub latency: Arc<LatencyState>,
    pub storage: Arc<Storage>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

type FrameLabels = Vec<(&'static str, &'static str)>;

struct Metrics {
    registry: Registry,
    samples_total: Counter,
    malformed_samples_total: Counter,
    short_datagrams_total: Counter,
    frames_total: Family<FrameLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let samples_total = Counter::default();
        let malformed_samples_total = Counter::default();
        let short_datagrams_total = Counter::default();
        let frames_total = Family::<FrameLabels, Counter>::default();

        registry.register(
            "udpstamp_samples",
            "Timing payloads received by the collector",
            samples_total.clone(),
        );
        registry.register(
            "udpstamp_malformed_samples",
            "Collected samples with a missing or reversed stamp",
            malformed_samples_total.clone(),
        );
        registry.register(
            "udpstamp_short_datagrams",
            "Datagrams too short to carry a timing payload",
            short_datagrams_total.clone(),
        );
        registry.register(
            "udpstamp_frames",
            "Frames seen by the XDP stampers, by observation point and outcome",
            frames_total.clone(),
        );

        Self {
            registry,
            samples_total,
            malformed_samples_total,
            short_datagrams_total,
            frames_total,
        }
    }

    fn frame_counter(&self, point: &'static str, outcome: &'static str) -> Counter {
        self.frames_total
            .get_or_create(&vec![("point", point), ("outcome", outcome)])
            .clone()
    }
}

/// Advance a monotonic counter to `total`. Totals that went backwards (the
/// eBPF object was reloaded) are ignored until they catch up.
fn sync_counter(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    total_samples: u64,
    stamped_frames: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_samples: u64,
    malformed_samples: u64,
    short_datagrams: u64,
    samples_per_second: f64,
    stamps: StampCounters,
}

#[derive(Serialize)]
pub struct PortResponse {
    port: u16,
    samples: u64,
    malformed: u64,
    min_ns: Option<u64>,
    max_ns: Option<u64>,
    mean_ns: Option<f64>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/ports", get(get_ports))
        .route("/api/history", get(get_history))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::warn!("ignoring allowed_ips entry {:?}: {}", s, e);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // Served without connect info: nothing to check against.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stamps = state.latency.stamps();
    Json(HealthResponse {
        status: "ok".to_string(),
        total_samples: state.latency.total_samples.load(Ordering::Relaxed),
        stamped_frames: stamps.ingress.modified + stamps.egress.modified,
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let total_samples = state.latency.total_samples.load(Ordering::Relaxed);

    let samples_per_second = if uptime > 0 {
        total_samples as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        total_samples,
        malformed_samples: state.latency.malformed_samples.load(Ordering::Relaxed),
        short_datagrams: state.latency.short_datagrams.load(Ordering::Relaxed),
        samples_per_second,
        stamps: state.latency.stamps(),
    })
}

async fn get_ports(State(state): State<Arc<AppState>>) -> Json<Vec<PortResponse>> {
    let mut ports: Vec<_> = state
        .latency
        .ports
        .iter()
        .map(|entry| {
            let (port, stats) = entry.pair();
            PortResponse {
                port: *port,
                samples: stats.samples,
                malformed: stats.malformed,
                min_ns: stats.min_ns,
                max_ns: stats.max_ns,
                mean_ns: stats.mean_ns(),
            }
        })
        .collect();

    ports.sort_by(|a, b| b.samples.cmp(&a.samples).then(a.port.cmp(&b.port)));
    Json(ports)
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);
    match state.storage.query_history(limit) {
        Ok(data) => Json(serde_json::json!(data)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    sync_counter(
        &metrics.samples_total,
        state.latency.total_samples.load(Ordering::Relaxed),
    );
    sync_counter(
        &metrics.malformed_samples_total,
        state.latency.malformed_samples.load(Ordering::Relaxed),
    );
    sync_counter(
        &metrics.short_datagrams_total,
        state.latency.short_datagrams.load(Ordering::Relaxed),
    );

    let stamps = state.latency.stamps();
    for (point, PointCounters { pass, modified }) in
        [("ingress", stamps.ingress), ("egress", stamps.egress)]
    {
        sync_counter(&metrics.frame_counter(point, "pass"), pass);
        sync_counter(&metrics.frame_counter(point, "modified"), modified);
    }

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
