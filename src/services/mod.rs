//! The services of the call chain, one per [`Role`](crate::settings::Role).

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use http::{HeaderMap, Method, StatusCode};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_PATH,
};
use tokio::net::TcpListener;

use crate::id::HexIdentifier as _;
use crate::metrics::StatusClass;
use crate::propagation::{HeaderPropagator, TraceContext};
use crate::span::SpanHandle;
use crate::telemetry::Telemetry;
use crate::transport::{CANCELLED, NO_STATUS};

pub mod availability;
pub mod client;
pub mod frontdoor;
pub mod inventory;

/// Serve `router` until Ctrl+C.
///
/// # Errors
/// Fails if the listener stops accepting connections.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "could not listen for Ctrl+C, shutting down");
    }
    tracing::info!("Shutdown signal received");
}

/// Server side bookkeeping of one inbound request: a server span parented on the propagated
/// context, then one counter sample and one log line when it is answered.
///
/// A request whose handler is dropped before answering (the caller went away) is recorded as
/// failed with [`CANCELLED`].
pub(crate) struct ServerCall {
    telemetry: Arc<Telemetry>,
    span: Option<SpanHandle>,
    method: Method,
    path: &'static str,
    started: Instant,
}

impl ServerCall {
    pub(crate) fn start(
        telemetry: &Arc<Telemetry>,
        propagator: &HeaderPropagator,
        method: Method,
        path: &'static str,
        headers: &HeaderMap,
    ) -> Self {
        let parent = propagator.extract_reported(headers, telemetry);
        let span = telemetry.recorder().start(
            format!("{method} {path}"),
            SpanKind::Server,
            vec![
                KeyValue::new(HTTP_REQUEST_METHOD, method.to_string()),
                KeyValue::new(URL_PATH, path),
            ],
            parent.as_ref(),
        );

        Self {
            telemetry: Arc::clone(telemetry),
            span: Some(span),
            method,
            path,
            started: Instant::now(),
        }
    }

    /// The context to hand to downstream calls made while serving.
    pub(crate) fn trace_context(&self) -> TraceContext {
        self.span
            .as_ref()
            .map_or_else(TraceContext::originate, SpanHandle::trace_context)
    }

    pub(crate) fn finish(mut self, status: StatusCode, detail: &str) {
        self.record(Some(status), detail);
    }

    fn record(&mut self, status: Option<StatusCode>, detail: &str) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let failed = status.map_or(true, |status| status.is_server_error());
        if let Some(status) = status {
            span.set_attribute(KeyValue::new(
                HTTP_RESPONSE_STATUS_CODE,
                i64::from(status.as_u16()),
            ));
        } else {
            span.set_attribute(KeyValue::new(ERROR_TYPE, CANCELLED));
        }
        if failed {
            span.set_status(Status::error(detail.to_owned()));
        } else {
            span.set_status(Status::Ok);
        }
        self.telemetry
            .requests()
            .add(self.method.as_str(), self.path, StatusClass::of(status));

        let trace_id = span.trace_id().encode();
        let span_id = span.span_id().encode();
        let code = status.map_or(NO_STATUS, |status| i32::from(status.as_u16()));
        let (method, path) = (&self.method, self.path);
        self.telemetry.in_span_scope(&span, || {
            if failed {
                tracing::error!(
                    trace_id = %trace_id,
                    span_id = %span_id,
                    status = code,
                    elapsed_ms,
                    "{method} {path} failed in {elapsed_ms} milliseconds: {detail}"
                );
            } else {
                tracing::info!(
                    trace_id = %trace_id,
                    span_id = %span_id,
                    status = code,
                    elapsed_ms,
                    "{method} {path} answered in {elapsed_ms} milliseconds"
                );
            }
        });
        span.end();
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        self.record(None, CANCELLED);
    }
}
