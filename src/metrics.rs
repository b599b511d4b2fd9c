//! Counters recorded by instrumented calls.
//!
//! Counts are aggregated in-process; whatever reader the meter provider carries decides when
//! they leave (a periodic OTLP reader in the binary). Adding never exports on its own.

use http::StatusCode;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Name of the request counter.
pub const REQUESTS_TOTAL: &str = "http.requests.total";

/// Name of the data store query counter.
pub const QUERIES_TOTAL: &str = "db.queries.total";

/// Coarse outcome of an HTTP call, used as a metric attribute.
///
/// The class only buckets the status code by its hundreds. Whether a call succeeded is decided
/// by its span: an outbound call answered with `204` counts under `2xx` while its span records a
/// failure, since only `200` is success there. Filter on `status_class="2xx"` for answered-fine
/// traffic, not for calls the caller accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// `1xx`
    Informational,
    /// `2xx`
    Success,
    /// `3xx`
    Redirection,
    /// `4xx`
    ClientError,
    /// `5xx`, and anything above
    ServerError,
    /// No response at all: connection refused, timeout, cancelled, and so on.
    NoResponse,
}

impl StatusClass {
    /// Class of `status`, or [`StatusClass::NoResponse`] when there was none.
    pub fn of(status: Option<StatusCode>) -> Self {
        let Some(status) = status else {
            return Self::NoResponse;
        };
        match status.as_u16() {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            _ => Self::ServerError,
        }
    }

    /// The attribute value: `1xx` to `5xx`, or `error`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Informational => "1xx",
            Self::Success => "2xx",
            Self::Redirection => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::NoResponse => "error",
        }
    }
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `http.requests.total{method, path, status_class}`
#[derive(Clone)]
pub struct RequestCounter {
    counter: Counter<u64>,
}

impl RequestCounter {
    /// Register the counter on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            counter: meter
                .u64_counter(REQUESTS_TOTAL)
                .with_description("HTTP requests by method, path and status class")
                .build(),
        }
    }

    /// Count one request.
    pub fn add(&self, method: &str, path: &str, status_class: StatusClass) {
        self.counter.add(
            1,
            &[
                KeyValue::new("method", method.to_owned()),
                KeyValue::new("path", path.to_owned()),
                KeyValue::new("status_class", status_class.as_str()),
            ],
        );
    }
}

/// `db.queries.total{type, status}`
#[derive(Clone)]
pub struct QueryCounter {
    counter: Counter<u64>,
}

impl QueryCounter {
    /// Register the counter on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            counter: meter
                .u64_counter(QUERIES_TOTAL)
                .with_description("Data store queries by type and outcome")
                .build(),
        }
    }

    /// Count one query, as `success` or `failed`.
    pub fn add(&self, query_type: &'static str, succeeded: bool) {
        let status = if succeeded { "success" } else { "failed" };
        self.counter.add(
            1,
            &[
                KeyValue::new("type", query_type),
                KeyValue::new("status", status),
            ],
        );
    }
}
