//! Availability: `GET /available` always says yes, after a while.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use http::{HeaderMap, Method, StatusCode};

use super::ServerCall;
use crate::propagation::HeaderPropagator;
use crate::telemetry::Telemetry;

/// The only answer availability ever gives.
pub const AVAILABLE: &str = "GOOD!";

/// The availability service.
#[derive(Clone, Debug)]
pub struct Availability {
    telemetry: Arc<Telemetry>,
    propagator: HeaderPropagator,
    latency: Duration,
}

impl Availability {
    /// Record through `telemetry`, continuing traces read with `propagator`.
    pub fn new(telemetry: Arc<Telemetry>, propagator: HeaderPropagator) -> Self {
        Self {
            telemetry,
            propagator,
            latency: Duration::ZERO,
        }
    }

    /// Simulated work before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `GET /available`.
    pub fn router(self) -> Router {
        Router::new()
            .route("/available", get(available))
            .with_state(Arc::new(self))
    }

    /// Record a server span under the caller's trace and answer after the configured latency.
    pub async fn check(&self, headers: &HeaderMap) -> (StatusCode, &'static str) {
        let call = ServerCall::start(
            &self.telemetry,
            &self.propagator,
            Method::GET,
            "/available",
            headers,
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        call.finish(StatusCode::OK, AVAILABLE);
        (StatusCode::OK, AVAILABLE)
    }
}

async fn available(
    State(availability): State<Arc<Availability>>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    availability.check(&headers).await
}
