//! Instrumented transport: what each call records and what it sends.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{attribute, Harness, SilentClient, StubClient};
use http::{HeaderValue, StatusCode};
use opentelemetry::logs::Severity;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceId};
use opentelemetry::Value;
use tracehop::metrics::REQUESTS_TOTAL;
use tracehop::propagation::{HeaderPropagator, DEFAULT_SPAN_HEADER, DEFAULT_TRACE_HEADER};
use tracehop::transport::{self, Error, InstrumentedTransport, ReqwestClient, CANCELLED};

const URL: &str = "http://availability:8082/available";
const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const SPAN: &str = "00f067aa0ba902b7";

fn transport_over(harness: &Harness, client: &StubClient) -> InstrumentedTransport {
    InstrumentedTransport::new(
        client.clone(),
        harness.telemetry.clone(),
        HeaderPropagator::default(),
    )
}

#[tokio::test]
async fn ok_response_records_successful_call() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    let response = instrumented.send(transport::get(URL).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "GET /available");
    assert_eq!(span.span_kind, SpanKind::Client);
    assert_eq!(span.status, Status::Ok);
    assert!(span.end_time >= span.start_time);
    assert_eq!(attribute(span, "http.response.status_code"), Some(Value::I64(200)));
    assert_eq!(
        attribute(span, "server.address"),
        Some(Value::from("availability"))
    );
    assert_eq!(attribute(span, "url.full"), Some(Value::from(URL)));

    assert_eq!(
        harness.counter_total(
            REQUESTS_TOTAL,
            &[("method", "GET"), ("path", "/available"), ("status_class", "2xx")]
        ),
        1
    );

    let logs = harness.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, Some(Severity::Info));
    assert_eq!(logs[0].trace_id, Some(span.span_context.trace_id()));
    assert_eq!(logs[0].span_id, Some(span.span_context.span_id()));
}

#[tokio::test]
async fn error_status_is_returned_but_recorded_as_failure() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::SERVICE_UNAVAILABLE);
    let instrumented = transport_over(&harness, &client);

    let response = instrumented.send(transport::get(URL).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body().as_ref(), b"stub");

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.status, Status::error("Server returned [503]"));
    assert_eq!(attribute(&span, "http.response.status_code"), Some(Value::I64(503)));

    assert_eq!(
        harness.counter_total(REQUESTS_TOTAL, &[("status_class", "5xx")]),
        1
    );

    let logs = harness.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, Some(Severity::Error));
    assert!(logs[0].body.contains("Server returned [503]"), "{:?}", logs[0]);
}

#[tokio::test]
async fn transport_failure_has_no_status_code() {
    let harness = Harness::new();
    let client = StubClient::refusing();
    let instrumented = transport_over(&harness, &client);

    let err = instrumented
        .send(transport::get(URL).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendRequest { .. }));
    assert!(err.to_string().contains("connection refused"));

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.status, Status::error("connection refused"));
    assert_eq!(attribute(&span, "http.response.status_code"), None);

    assert_eq!(
        harness.counter_total(REQUESTS_TOTAL, &[("status_class", "error")]),
        1
    );

    let logs = harness.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, Some(Severity::Error));
    assert_eq!(logs[0].span_id, Some(span.span_context.span_id()));
}

#[tokio::test]
async fn continues_the_trace_found_in_the_request() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    let mut request = transport::get(URL).unwrap();
    request
        .headers_mut()
        .insert(DEFAULT_TRACE_HEADER, HeaderValue::from_static(TRACE));
    request
        .headers_mut()
        .insert(DEFAULT_SPAN_HEADER, HeaderValue::from_static(SPAN));
    instrumented.send(request).await.unwrap();

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.span_context.trace_id(), TraceId::from_hex(TRACE).unwrap());
    assert_eq!(span.parent_span_id, SpanId::from_hex(SPAN).unwrap());

    let sent = client.seen();
    assert_eq!(sent.len(), 1);
    let headers = sent[0].headers();
    assert_eq!(headers.get(DEFAULT_TRACE_HEADER).unwrap(), TRACE);
    assert_eq!(
        headers.get(DEFAULT_SPAN_HEADER).unwrap(),
        span.span_context.span_id().to_string().as_str()
    );
}

#[tokio::test]
async fn starts_a_trace_when_the_request_has_none() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    instrumented.send(transport::get(URL).unwrap()).await.unwrap();

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.parent_span_id, SpanId::INVALID);
    assert_ne!(span.span_context.trace_id(), TraceId::INVALID);

    let sent = client.seen();
    let headers = sent[0].headers();
    assert_eq!(
        headers.get(DEFAULT_TRACE_HEADER).unwrap(),
        span.span_context.trace_id().to_string().as_str()
    );
    assert_eq!(
        headers.get(DEFAULT_SPAN_HEADER).unwrap(),
        span.span_context.span_id().to_string().as_str()
    );
}

#[tokio::test]
async fn malformed_context_is_replaced() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    let mut request = transport::get(URL).unwrap();
    request
        .headers_mut()
        .insert(DEFAULT_TRACE_HEADER, HeaderValue::from_static("not-a-trace-id"));
    instrumented.send(request).await.unwrap();

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.parent_span_id, SpanId::INVALID);

    let logs = harness.logs();
    let ignored: Vec<_> = logs
        .iter()
        .filter(|log| log.severity == Some(Severity::Warn))
        .collect();
    assert_eq!(ignored.len(), 1, "{logs:?}");
    assert!(
        ignored[0].body.contains("ignoring propagated trace context"),
        "{:?}",
        ignored[0]
    );

    let sent = client.seen();
    let headers = sent[0].headers();
    assert_eq!(headers.get_all(DEFAULT_TRACE_HEADER).iter().count(), 1);
    assert_eq!(
        headers.get(DEFAULT_TRACE_HEADER).unwrap(),
        span.span_context.trace_id().to_string().as_str()
    );
}

#[tokio::test]
async fn request_without_host_is_rejected_before_recording() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    let err = instrumented
        .send(transport::get("/available").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoDestination { .. }));

    assert!(harness.spans().is_empty());
    assert!(client.seen().is_empty());
    assert_eq!(harness.counter_total(REQUESTS_TOTAL, &[]), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_each_record_once() {
    const CALLS: usize = 64;

    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::OK);
    let instrumented = transport_over(&harness, &client);

    let calls = (0..CALLS).map(|_| {
        let instrumented = instrumented.clone();
        tokio::spawn(async move { instrumented.send(transport::get(URL).unwrap()).await })
    });
    for outcome in futures_util::future::join_all(calls).await {
        outcome.unwrap().unwrap();
    }

    assert_eq!(
        harness.counter_total(
            REQUESTS_TOTAL,
            &[("method", "GET"), ("path", "/available"), ("status_class", "2xx")]
        ),
        CALLS as u64
    );

    let spans = harness.spans();
    assert_eq!(spans.len(), CALLS);
    let span_ids: HashSet<SpanId> = spans.iter().map(|span| span.span_context.span_id()).collect();
    assert_eq!(span_ids.len(), CALLS);
    assert_eq!(harness.logs().len(), CALLS);
}

#[tokio::test]
async fn independent_clients_do_not_share_records() {
    let first = Harness::new();
    let second = Harness::new();
    let client = StubClient::answering(StatusCode::OK);

    transport_over(&first, &client)
        .send(transport::get(URL).unwrap())
        .await
        .unwrap();

    assert_eq!(first.spans().len(), 1);
    assert!(second.spans().is_empty());
    assert!(second.logs().is_empty());
}

#[tokio::test]
async fn non_200_success_is_counted_as_2xx_but_fails_the_span() {
    let harness = Harness::new();
    let client = StubClient::answering(StatusCode::NO_CONTENT);
    let instrumented = transport_over(&harness, &client);

    let response = instrumented.send(transport::get(URL).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.status, Status::error("Server returned [204]"));
    assert_eq!(
        harness.counter_total(REQUESTS_TOTAL, &[("status_class", "2xx")]),
        1
    );
    assert_eq!(harness.logs()[0].severity, Some(Severity::Error));
}

#[tokio::test]
async fn dropped_call_is_recorded_as_cancelled() {
    let harness = Harness::new();
    let instrumented = InstrumentedTransport::new(
        SilentClient,
        Arc::clone(&harness.telemetry),
        HeaderPropagator::default(),
    );

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        instrumented.send(transport::get(URL).unwrap()),
    )
    .await;
    assert!(abandoned.is_err(), "the silent client answered");

    let span = harness.span("GET /available", SpanKind::Client);
    assert_eq!(span.status, Status::error(CANCELLED));
    assert_eq!(attribute(&span, "http.response.status_code"), None);
    assert_eq!(attribute(&span, "error.type"), Some(Value::from(CANCELLED)));

    assert_eq!(
        harness.counter_total(
            REQUESTS_TOTAL,
            &[("method", "GET"), ("path", "/available"), ("status_class", "error")]
        ),
        1
    );

    let logs = harness.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, Some(Severity::Error));
    assert!(logs[0].body.contains(CANCELLED), "{:?}", logs[0]);
    assert_eq!(logs[0].span_id, Some(span.span_context.span_id()));
}

#[tokio::test]
async fn downstream_timeout_is_a_transport_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept connections and hold them open without ever answering.
    let server = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });

    let harness = Harness::new();
    let instrumented = InstrumentedTransport::new(
        ReqwestClient::new(Duration::from_millis(100)).unwrap(),
        Arc::clone(&harness.telemetry),
        HeaderPropagator::default(),
    );

    let url = format!("http://{addr}/available");
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        instrumented.send(transport::get(&url).unwrap()),
    )
    .await
    .expect("the client timeout should fire first");
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::SendRequest { .. }), "{err}");

    let span = harness.span("GET /available", SpanKind::Client);
    assert!(matches!(span.status, Status::Error { .. }), "{:?}", span.status);
    assert_ne!(span.status, Status::error(CANCELLED));
    assert_eq!(attribute(&span, "http.response.status_code"), None);
    assert_eq!(
        harness.counter_total(REQUESTS_TOTAL, &[("status_class", "error")]),
        1
    );

    server.abort();
}
