//! Shared fixtures: a telemetry client backed by in-memory exporters and stand-in HTTP clients.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use opentelemetry::logs::{AnyValue, Severity};
use opentelemetry::trace::{SpanId, SpanKind, TraceId};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::logs::InMemoryLogExporter;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use tower::ServiceExt as _;
use tracehop::telemetry::{LogSettings, Telemetry};
use tracehop::transport::{HttpClient, HttpError};

/// A telemetry client whose spans, metrics and logs can be inspected.
pub struct Harness {
    pub telemetry: Arc<Telemetry>,
    spans: InMemorySpanExporter,
    metrics: InMemoryMetricExporter,
    logs: InMemoryLogExporter,
}

/// The parts of an exported log record the tests look at.
#[derive(Debug)]
pub struct LogLine {
    pub severity: Option<Severity>,
    pub body: String,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

impl Harness {
    pub fn new() -> Self {
        let spans = InMemorySpanExporter::default();
        let metrics = InMemoryMetricExporter::default();
        let logs = InMemoryLogExporter::default();

        let reader = PeriodicReader::builder(metrics.clone()).build();
        let telemetry = Telemetry::builder(&tracehop::service_info!())
            .with_log_settings(LogSettings {
                console_level: "off".to_owned(),
                otel_level: "info".to_owned(),
                endpoint: None,
            })
            .configure_traces(|traces| traces.with_simple_exporter(spans.clone()))
            .configure_metrics(|meters| meters.with_reader(reader))
            .configure_logs(|loggers| loggers.with_simple_exporter(logs.clone()))
            .build()
            .expect("telemetry should build");

        Self {
            telemetry: Arc::new(telemetry),
            spans,
            metrics,
            logs,
        }
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.telemetry.force_flush();
        self.spans.get_finished_spans().expect("finished spans")
    }

    pub fn client_spans(&self) -> Vec<SpanData> {
        self.spans()
            .into_iter()
            .filter(|span| span.span_kind == SpanKind::Client && span.name.starts_with("GET "))
            .collect()
    }

    pub fn span(&self, name: &str, kind: SpanKind) -> SpanData {
        let mut matching: Vec<SpanData> = self
            .spans()
            .into_iter()
            .filter(|span| span.name == name && span.span_kind == kind)
            .collect();
        assert_eq!(
            matching.len(),
            1,
            "expected exactly one {kind:?} span named {name:?}"
        );
        matching.remove(0)
    }

    /// Current value of every data point of the `u64` counter `name`.
    pub fn counter_points(&self, name: &str) -> Vec<(Vec<KeyValue>, u64)> {
        self.telemetry.force_flush();
        let exported = self.metrics.get_finished_metrics().expect("finished metrics");
        let Some(latest) = exported.last() else {
            return Vec::new();
        };

        let mut points = Vec::new();
        for scope in latest.scope_metrics() {
            for metric in scope.metrics().filter(|metric| metric.name() == name) {
                if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                    for point in sum.data_points() {
                        points.push((point.attributes().cloned().collect(), point.value()));
                    }
                }
            }
        }
        points
    }

    /// Sum of the counter `name` over the data points carrying all of `attributes`.
    pub fn counter_total(&self, name: &str, attributes: &[(&str, &str)]) -> u64 {
        self.counter_points(name)
            .into_iter()
            .filter(|(point_attributes, _)| {
                attributes.iter().all(|(key, value)| {
                    point_attributes
                        .iter()
                        .any(|kv| kv.key.as_str() == *key && kv.value.as_str() == *value)
                })
            })
            .map(|(_, value)| value)
            .sum()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.telemetry.force_flush();
        self.logs
            .get_emitted_logs()
            .expect("emitted logs")
            .into_iter()
            .map(|log| {
                let record = &log.record;
                let body = match record.body() {
                    Some(AnyValue::String(body)) => body.as_str().to_owned(),
                    Some(other) => format!("{other:?}"),
                    None => String::new(),
                };
                LogLine {
                    severity: record.severity_number(),
                    body,
                    trace_id: record.trace_context().map(|cx| cx.trace_id),
                    span_id: record.trace_context().map(|cx| cx.span_id),
                }
            })
            .collect()
    }
}

pub fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

/// Answers every request with a fixed status, or fails every request when there is none.
/// Keeps the requests it was handed.
#[derive(Clone, Debug)]
pub struct StubClient {
    status: Option<StatusCode>,
    seen: Arc<Mutex<Vec<Request<Bytes>>>>,
}

impl StubClient {
    pub fn answering(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            seen: Arc::default(),
        }
    }

    pub fn refusing() -> Self {
        Self {
            status: None,
            seen: Arc::default(),
        }
    }

    pub fn seen(&self) -> Vec<Request<Bytes>> {
        self.seen
            .lock()
            .expect("lock")
            .iter()
            .map(|request| {
                let mut copy = Request::new(request.body().clone());
                *copy.method_mut() = request.method().clone();
                *copy.uri_mut() = request.uri().clone();
                *copy.headers_mut() = request.headers().clone();
                copy
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for StubClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        self.seen.lock().expect("lock").push(request);
        match self.status {
            Some(status) => Ok(Response::builder()
                .status(status)
                .body(Bytes::from_static(b"stub"))?),
            None => Err("connection refused".into()),
        }
    }
}

/// Routes requests to in-process axum routers by host name. Unknown hosts refuse the connection.
#[derive(Clone, Debug, Default)]
pub struct RouterClient {
    routes: HashMap<String, Router>,
}

impl RouterClient {
    pub fn with_route(mut self, host: &str, router: Router) -> Self {
        self.routes.insert(host.to_owned(), router);
        self
    }
}

#[async_trait]
impl HttpClient for RouterClient {
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let host = request.uri().host().unwrap_or_default().to_owned();
        let Some(router) = self.routes.get(&host) else {
            return Err(format!("connection refused by {host:?}").into());
        };

        let response = router.clone().oneshot(request.map(Body::from)).await?;
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;
        Ok(Response::from_parts(parts, body))
    }
}

/// Never answers. Calls through it only end when they are dropped.
#[derive(Clone, Debug, Default)]
pub struct SilentClient;

#[async_trait]
impl HttpClient for SilentClient {
    async fn send_bytes(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        std::future::pending().await
    }
}
