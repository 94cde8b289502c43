//! Embedded health endpoint for the pod's liveness and readiness probes.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tracing::{error, info};

/// Tolerated silence from the api-server before reporting not-live.
const CONTACT_THRESHOLD: Duration = Duration::from_secs(60);

pub struct HealthState {
    ready: AtomicBool,
    last_contact: Mutex<Instant>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_contact: Mutex::new(Instant::now()),
        }
    }

    /// Marks the initial spawn as done; the pod reports ready from here on.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Records a successful interaction with the api-server.
    pub fn touch(&self) {
        if let Ok(mut last_contact) = self.last_contact.lock() {
            *last_contact = Instant::now();
        }
    }

    pub fn status(&self) -> (StatusCode, &'static str) {
        if !self.ready.load(Ordering::Relaxed) {
            return (StatusCode::SERVICE_UNAVAILABLE, "NOT READY");
        }
        let elapsed = self
            .last_contact
            .lock()
            .map(|last_contact| last_contact.elapsed())
            .unwrap_or_default();
        if elapsed > CONTACT_THRESHOLD {
            return (StatusCode::SERVICE_UNAVAILABLE, "NOT LIVE (apiserver contact lost)");
        }
        (StatusCode::OK, "OK")
    }

    #[cfg(test)]
    fn backdate(&self, by: Duration) {
        let past = Instant::now().checked_sub(by).unwrap();
        *self.last_contact.lock().unwrap() = past;
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `GET /healthz` until the process exits. Failing to bind is logged
/// but does not take the sidecar down with it.
pub async fn serve(state: Arc<HealthState>, port: u16) {
    let app = Router::new().route("/healthz", get(healthz)).with_state(state);
    let address = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind health endpoint on {address}: {err}");
            return;
        },
    };
    info!("health endpoint listening on {address}");

    if let Err(err) = axum::serve(listener, app).await {
        error!("health endpoint failed: {err}");
    }
}

async fn healthz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    state.status()
}
