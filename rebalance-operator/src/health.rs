use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use coordination_store::util::now_seconds;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Liveness and readiness of the operator loop.
///
/// The loop reports after every tick, leader or not. If it stops reporting
/// for longer than the deadline, `/_liveness` fails so the process gets
/// restarted.
#[derive(Clone)]
pub struct OperatorHealth {
    inner: Arc<Inner>,
}

struct Inner {
    deadline_secs: i64,
    last_report: AtomicI64,
    ready: AtomicBool,
}

impl OperatorHealth {
    pub fn new(deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline_secs: deadline.as_secs() as i64,
                last_report: AtomicI64::new(now_seconds()),
                ready: AtomicBool::new(false),
            }),
        }
    }

    pub fn report_alive(&self) {
        self.inner.last_report.store(now_seconds(), Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(now_seconds())
    }

    fn is_alive_at(&self, now: i64) -> bool {
        now - self.inner.last_report.load(Ordering::Relaxed) <= self.inner.deadline_secs
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }
}

async fn liveness(State(health): State<OperatorHealth>) -> impl IntoResponse {
    if health.is_alive() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "stalled")
    }
}

async fn readiness(State(health): State<OperatorHealth>) -> impl IntoResponse {
    if health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// `/_liveness` and `/_readiness`, plus `/metrics` when a recorder is given.
pub fn router(health: OperatorHealth, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .with_state(health);

    match metrics {
        Some(handle) => router.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        ),
        None => router,
    }
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    const BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

    PrometheusBuilder::new().set_buckets(BUCKETS)?.install_recorder()
}
