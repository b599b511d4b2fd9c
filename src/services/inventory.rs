//! Inventory: `GET /reserve` counts books, `/toggle` breaks or repairs the store.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use http::{HeaderMap, StatusCode};

use crate::propagation::HeaderPropagator;
use crate::store::InstrumentedStore;

/// The inventory service: a book store behind two routes.
#[derive(Clone, Debug)]
pub struct Inventory {
    store: Arc<InstrumentedStore>,
    propagator: HeaderPropagator,
}

impl Inventory {
    /// Serve `store`, continuing traces read with `propagator`.
    pub fn new(store: Arc<InstrumentedStore>, propagator: HeaderPropagator) -> Self {
        Self { store, propagator }
    }

    /// The store behind the routes.
    pub fn store(&self) -> &Arc<InstrumentedStore> {
        &self.store
    }

    /// `GET /reserve` and `GET|POST /toggle`.
    pub fn router(self) -> Router {
        Router::new()
            .route("/reserve", get(reserve))
            .route("/toggle", get(toggle).post(toggle))
            .with_state(Arc::new(self))
    }

    /// Run the book count under the caller's trace. Answers `{"books": N}`, or `500` with the
    /// store error.
    pub async fn reserve(&self, headers: &HeaderMap) -> (StatusCode, String) {
        let parent = self
            .propagator
            .extract_reported(headers, self.store.telemetry());
        match self.store.count_books(parent.as_ref()).await {
            Ok(books) => (StatusCode::OK, format!("{{\"books\": {books}}}")),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

async fn reserve(State(inventory): State<Arc<Inventory>>, headers: HeaderMap) -> (StatusCode, String) {
    inventory.reserve(&headers).await
}

async fn toggle(State(inventory): State<Arc<Inventory>>) -> String {
    inventory.store.toggle().to_string()
}
