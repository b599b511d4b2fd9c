//! Front door: `GET /reserve` checks availability and inventory and reports both outcomes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use http::{HeaderMap, Method, StatusCode};

use super::ServerCall;
use crate::propagation::TraceContext;
use crate::transport::{self, InstrumentedTransport};

/// Answer sent when every downstream call succeeded.
pub const ALL_GOOD: &str = "GOOD!";

/// The entry point of the chain.
#[derive(Clone, Debug)]
pub struct FrontDoor {
    transport: InstrumentedTransport,
    availability_url: String,
    inventory_url: String,
    latency: Duration,
}

impl FrontDoor {
    /// Check availability at `availability_url` and inventory at `inventory_url`, both through
    /// `transport`.
    pub fn new(
        transport: InstrumentedTransport,
        availability_url: impl Into<String>,
        inventory_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            availability_url: availability_url.into(),
            inventory_url: inventory_url.into(),
            latency: Duration::ZERO,
        }
    }

    /// Simulated work before the downstream calls are made.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `GET /reserve`.
    pub fn router(self) -> Router {
        Router::new()
            .route("/reserve", get(reserve))
            .with_state(Arc::new(self))
    }

    /// Handle one reservation.
    ///
    /// Both downstream requests carry the context of the front door's own server span, so they
    /// share its trace id whether or not the caller sent one. They run concurrently; the answer
    /// is `200` only if both returned `200`, otherwise `500` with one line per failed call.
    pub async fn reserve(&self, headers: &HeaderMap) -> (StatusCode, String) {
        let call = ServerCall::start(
            self.transport.telemetry(),
            self.transport.propagator(),
            Method::GET,
            "/reserve",
            headers,
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let context = call.trace_context();
        let (availability, inventory) = tokio::join!(
            self.check("availability", &self.availability_url, &context),
            self.check("inventory", &self.inventory_url, &context),
        );

        let failures: Vec<String> = [availability, inventory]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        let (status, body) = if failures.is_empty() {
            (StatusCode::OK, ALL_GOOD.to_owned())
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, failures.join("\n"))
        };

        call.finish(status, &body);
        (status, body)
    }

    async fn check(&self, name: &str, url: &str, context: &TraceContext) -> Result<(), String> {
        let mut request = transport::get(url).map_err(|err| format!("{name}: {err}"))?;
        self.transport
            .propagator()
            .inject(request.headers_mut(), context);

        match self.transport.send(request).await {
            Ok(response) if response.status() == StatusCode::OK => Ok(()),
            Ok(response) => {
                let body = String::from_utf8_lossy(response.body());
                Err(format!(
                    "{name}: Server returned [{}] {}",
                    response.status().as_u16(),
                    body.trim()
                ))
            }
            Err(err) => Err(format!("{name}: {err}")),
        }
    }
}

async fn reserve(State(front_door): State<Arc<FrontDoor>>, headers: HeaderMap) -> (StatusCode, String) {
    front_door.reserve(&headers).await
}
