//! Instrumented HTTP transport.
//!
//! [`InstrumentedTransport`] wraps any [`HttpClient`] and, for every request, records one client
//! span, one `http.requests.total` sample and one correlated log line. The trace context travels
//! to the callee in the headers handled by [`HeaderPropagator`].
//!
//! Responses with a status other than `200` come back as `Ok`; they are only recorded as
//! failures. Deciding what a `404` or `500` means is left to the caller. A call abandoned before
//! it was answered is recorded as failed too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, SERVER_ADDRESS, URL_FULL, URL_PATH,
};
use snafu::{ResultExt as _, Snafu};

pub use opentelemetry_http::{HttpClient, HttpError};

use crate::id::HexIdentifier as _;
use crate::metrics::StatusClass;
use crate::propagation::HeaderPropagator;
use crate::span::SpanHandle;
use crate::telemetry::Telemetry;

/// Status reported in logs when no response was received at all.
pub const NO_STATUS: i32 = -1;

/// Span status detail and `error.type` of a call dropped before it was answered.
pub const CANCELLED: &str = "cancelled";

/// Transport errors
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The request URI names no host.
    #[snafu(display("Request to {uri} has no host to send it to"))]
    NoDestination {
        /// The URI as given
        uri: String,
    },

    /// The URL could not be turned into a request.
    #[snafu(display("Could not build a request for {url}: {source}"))]
    BuildRequest {
        /// The URL as given
        url: String,
        /// What `http` objected to
        source: http::Error,
    },

    /// The wrapped client came back without a response.
    #[snafu(display("{method} {uri} failed: {source}"))]
    SendRequest {
        /// Request method
        method: String,
        /// Request URI
        uri: String,
        /// The wrapped client's error
        source: HttpError,
    },
}

/// An empty-bodied `GET` request for `url`.
///
/// # Errors
/// - `BuildRequest` if `url` is not a valid URI.
pub fn get(url: &str) -> Result<Request<Bytes>, Error> {
    Request::get(url)
        .body(Bytes::new())
        .context(BuildRequestSnafu { url })
}

/// Decorates an [`HttpClient`] with spans, metrics, logs and trace propagation.
#[derive(Clone, Debug)]
pub struct InstrumentedTransport {
    inner: Arc<dyn HttpClient>,
    telemetry: Arc<Telemetry>,
    propagator: HeaderPropagator,
}

impl InstrumentedTransport {
    /// Wrap `inner`, recording through `telemetry` and propagating with `propagator`.
    pub fn new(
        inner: impl HttpClient + 'static,
        telemetry: Arc<Telemetry>,
        propagator: HeaderPropagator,
    ) -> Self {
        Self {
            inner: Arc::new(inner),
            telemetry,
            propagator,
        }
    }

    /// The client every call is recorded through.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// The header codec used for every call.
    pub fn propagator(&self) -> &HeaderPropagator {
        &self.propagator
    }

    /// Send `request` through the wrapped client.
    ///
    /// A trace context already present in the request headers is continued, otherwise the span
    /// starts a new trace. Either way the headers leave carrying the trace id and the id of the
    /// span recorded here.
    ///
    /// Dropping the returned future before the wrapped client answers still records the call,
    /// as failed with [`CANCELLED`].
    ///
    /// # Errors
    /// - `NoDestination` if the URI has no host. Nothing is recorded in that case.
    /// - `SendRequest` if the wrapped client produced no response.
    pub async fn send(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let started = Instant::now();
        let method = request.method().clone();
        let uri = request.uri().clone();
        let Some(host) = uri.host().map(str::to_owned) else {
            return NoDestinationSnafu {
                uri: uri.to_string(),
            }
            .fail();
        };
        let path = uri.path().to_owned();

        let parent = self
            .propagator
            .extract_reported(request.headers(), &self.telemetry);
        let span = self.telemetry.recorder().start(
            format!("{method} {path}"),
            SpanKind::Client,
            vec![
                KeyValue::new(SERVER_ADDRESS, host),
                KeyValue::new(HTTP_REQUEST_METHOD, method.to_string()),
                KeyValue::new(URL_PATH, path.clone()),
                KeyValue::new(URL_FULL, uri.to_string()),
            ],
            parent.as_ref(),
        );
        self.propagator
            .inject(request.headers_mut(), &span.trace_context());

        let call = OutboundCall {
            telemetry: &self.telemetry,
            span: Some(span),
            method,
            uri,
            path,
            started,
        };
        let result = self.inner.send_bytes(request).await;
        let (method, uri) = (call.method.to_string(), call.uri.to_string());
        call.finish(&result);

        result.context(SendRequestSnafu { method, uri })
    }
}

/// What became of one outbound call.
enum Outcome<'r> {
    Answered(&'r Response<Bytes>),
    Failed(&'r HttpError),
    Cancelled,
}

/// The bookkeeping of one outbound call: span status, counter sample, log line and span end.
///
/// Recorded exactly once, by [`OutboundCall::finish`] or, if the call is dropped before that,
/// as [`Outcome::Cancelled`].
struct OutboundCall<'t> {
    telemetry: &'t Telemetry,
    span: Option<SpanHandle>,
    method: Method,
    uri: Uri,
    path: String,
    started: Instant,
}

impl OutboundCall<'_> {
    fn finish(mut self, result: &Result<Response<Bytes>, HttpError>) {
        match result {
            Ok(response) => self.record(&Outcome::Answered(response)),
            Err(err) => self.record(&Outcome::Failed(err)),
        }
    }

    fn record(&mut self, outcome: &Outcome<'_>) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        let elapsed = self.started.elapsed();

        let status = match outcome {
            Outcome::Answered(response) => Some(response.status()),
            Outcome::Failed(_) | Outcome::Cancelled => None,
        };
        record_outcome(&mut span, outcome);
        self.telemetry
            .requests()
            .add(self.method.as_str(), &self.path, StatusClass::of(status));
        let (method, uri) = (&self.method, &self.uri);
        self.telemetry.in_span_scope(&span, || {
            log_outcome(&span, method, uri, outcome, elapsed);
        });
        span.end();
    }
}

impl Drop for OutboundCall<'_> {
    fn drop(&mut self) {
        self.record(&Outcome::Cancelled);
    }
}

fn record_outcome(span: &mut SpanHandle, outcome: &Outcome<'_>) {
    match outcome {
        Outcome::Answered(response) => {
            let status = response.status();
            span.set_attribute(KeyValue::new(
                HTTP_RESPONSE_STATUS_CODE,
                i64::from(status.as_u16()),
            ));
            if status == StatusCode::OK {
                span.set_status(Status::Ok);
            } else {
                span.set_attribute(KeyValue::new(ERROR_TYPE, status.as_u16().to_string()));
                span.set_status(Status::error(server_returned(status)));
            }
        }
        Outcome::Failed(err) => {
            span.set_status(Status::error(err.to_string()));
        }
        Outcome::Cancelled => {
            span.set_attribute(KeyValue::new(ERROR_TYPE, CANCELLED));
            span.set_status(Status::error(CANCELLED));
        }
    }
}

fn log_outcome(
    span: &SpanHandle,
    method: &Method,
    uri: &Uri,
    outcome: &Outcome<'_>,
    elapsed: Duration,
) {
    let trace_id = span.trace_id().encode();
    let span_id = span.span_id().encode();
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Outcome::Answered(response) if response.status() == StatusCode::OK => tracing::info!(
            trace_id = %trace_id,
            span_id = %span_id,
            status = i32::from(response.status().as_u16()),
            elapsed_ms,
            "{method} {uri} succeeded"
        ),
        Outcome::Answered(response) => tracing::error!(
            trace_id = %trace_id,
            span_id = %span_id,
            status = i32::from(response.status().as_u16()),
            elapsed_ms,
            "{method} {uri} failed: {}",
            server_returned(response.status())
        ),
        Outcome::Failed(err) => tracing::error!(
            trace_id = %trace_id,
            span_id = %span_id,
            status = NO_STATUS,
            elapsed_ms,
            "{method} {uri} failed: {err}"
        ),
        Outcome::Cancelled => tracing::error!(
            trace_id = %trace_id,
            span_id = %span_id,
            status = NO_STATUS,
            elapsed_ms,
            "{method} {uri} failed: {CANCELLED}"
        ),
    }
}

fn server_returned(status: StatusCode) -> String {
    format!("Server returned [{}]", status.as_u16())
}

/// [`HttpClient`] on top of `reqwest`. Unlike the stock implementation it hands back error
/// statuses as responses, so they can be recorded and returned to the caller.
#[derive(Clone, Debug)]
pub struct ReqwestClient(reqwest::Client);

impl ReqwestClient {
    /// A client giving up on any request after `timeout`.
    ///
    /// # Errors
    /// Fails if the TLS backend or system configuration cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        reqwest::Client::builder().timeout(timeout).build().map(Self)
    }
}

impl From<reqwest::Client> for ReqwestClient {
    fn from(client: reqwest::Client) -> Self {
        Self(client)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let request = reqwest::Request::try_from(request)?;
        let mut response = self.0.execute(request).await?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes().await?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}
