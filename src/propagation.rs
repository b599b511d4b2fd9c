//! Trace context carried in a pair of custom HTTP headers.
//!
//! One header holds the trace id, the other the id of the caller's span. Extraction is lenient:
//! a bad trace header means "no context", a bad span header is replaced with a fresh span id.
//! Injection overwrites whatever the headers held before, so every hop re-roots propagation from
//! its own span.

use doku::Document;
use http::{HeaderMap, HeaderName};
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use opentelemetry_http::{HeaderExtractor, HeaderInjector};
use opentelemetry_sdk::trace::{IdGenerator as _, RandomIdGenerator};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

use crate::id::HexIdentifier as _;
use crate::telemetry::Telemetry;

/// Header carrying the trace id unless configured otherwise.
pub const DEFAULT_TRACE_HEADER: &str = "x-otel-custom-id";

/// Header carrying the caller's span id unless configured otherwise.
pub const DEFAULT_SPAN_HEADER: &str = "x-otel-span-id";

/// Propagation errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// A configured header name is not a legal HTTP header name.
    #[snafu(display("Invalid propagation header name {name:?}: {source}"))]
    InvalidHeaderName {
        /// The configured name
        name: String,
        /// Why `http` refused it
        source: http::header::InvalidHeaderName,
    },

    /// The trace header is present but does not hold a trace id.
    #[snafu(display("Ignoring propagated trace context: {source}"))]
    MalformedTraceId {
        /// The decoding failure
        source: crate::id::Error,
    },
}

/// Names of the propagation headers. Every service in a chain must agree on them.
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct PropagationSettings {
    /// Header carrying the 32 character trace id
    #[doku(example = "x-otel-custom-id")]
    pub trace_header: String,

    /// Header carrying the 16 character span id of the calling span
    #[doku(example = "x-otel-span-id")]
    pub span_header: String,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            trace_header: DEFAULT_TRACE_HEADER.to_owned(),
            span_header: DEFAULT_SPAN_HEADER.to_owned(),
        }
    }
}

/// The identifiers carried from one hop to the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// Shared by every hop of one request.
    pub trace_id: TraceId,
    /// The span the next hop should treat as its parent.
    pub span_id: SpanId,
}

impl TraceContext {
    /// A brand new trace, used when nothing usable was propagated.
    pub fn originate() -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            trace_id: ids.new_trace_id(),
            span_id: ids.new_span_id(),
        }
    }

    /// The context as a sampled, remote parent for spans started in this process.
    pub fn to_remote_span_context(&self) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        )
    }
}

impl From<&SpanContext> for TraceContext {
    fn from(span_context: &SpanContext) -> Self {
        Self {
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
        }
    }
}

/// Reads and writes [`TraceContext`] using the configured header names.
#[derive(Clone, Debug)]
pub struct HeaderPropagator {
    trace_header: HeaderName,
    span_header: HeaderName,
}

impl Default for HeaderPropagator {
    fn default() -> Self {
        Self {
            trace_header: HeaderName::from_static(DEFAULT_TRACE_HEADER),
            span_header: HeaderName::from_static(DEFAULT_SPAN_HEADER),
        }
    }
}

impl HeaderPropagator {
    /// Build a propagator from configured header names. Names are case-insensitive.
    ///
    /// # Errors
    /// - `InvalidHeaderName` if either name is not a legal HTTP header name.
    pub fn new(settings: &PropagationSettings) -> Result<Self, Error> {
        Ok(Self {
            trace_header: header_name(&settings.trace_header)?,
            span_header: header_name(&settings.span_header)?,
        })
    }

    /// Name of the header carrying the trace id.
    pub fn trace_header(&self) -> &HeaderName {
        &self.trace_header
    }

    /// Name of the header carrying the caller's span id.
    pub fn span_header(&self) -> &HeaderName {
        &self.span_header
    }

    /// Read the context from any carrier.
    ///
    /// `Ok(None)` when there is no trace header. A missing or malformed span header still yields
    /// the inherited trace id, paired with a freshly generated span id.
    ///
    /// # Errors
    /// - `MalformedTraceId` if the trace header does not decode.
    pub fn try_extract_from(
        &self,
        extractor: &dyn Extractor,
    ) -> Result<Option<TraceContext>, Error> {
        let Some(raw_trace_id) = extractor.get(self.trace_header.as_str()) else {
            return Ok(None);
        };
        let trace_id = TraceId::decode(raw_trace_id).context(MalformedTraceIdSnafu)?;

        let span_id = extractor
            .get(self.span_header.as_str())
            .and_then(|raw| SpanId::decode(raw).ok())
            .unwrap_or_else(|| RandomIdGenerator::default().new_span_id());

        Ok(Some(TraceContext { trace_id, span_id }))
    }

    /// Read the context from any carrier, treating a malformed trace header as absent.
    pub fn extract_from(&self, extractor: &dyn Extractor) -> Option<TraceContext> {
        self.try_extract_from(extractor).ok().flatten()
    }

    /// Write both headers to any carrier, replacing existing values.
    pub fn inject_into(&self, injector: &mut dyn Injector, context: &TraceContext) {
        injector.set(self.trace_header.as_str(), context.trace_id.encode());
        injector.set(self.span_header.as_str(), context.span_id.encode());
    }

    /// [`HeaderPropagator::try_extract_from`] over HTTP headers.
    ///
    /// # Errors
    /// - `MalformedTraceId` if the trace header does not decode.
    pub fn try_extract(&self, headers: &HeaderMap) -> Result<Option<TraceContext>, Error> {
        self.try_extract_from(&HeaderExtractor(headers))
    }

    /// The context propagated in `headers`, if there is a usable one.
    pub fn extract(&self, headers: &HeaderMap) -> Option<TraceContext> {
        self.extract_from(&HeaderExtractor(headers))
    }

    /// Like [`HeaderPropagator::extract`], logging an ignored trace header through `telemetry`.
    pub fn extract_reported(
        &self,
        headers: &HeaderMap,
        telemetry: &Telemetry,
    ) -> Option<TraceContext> {
        self.try_extract(headers).unwrap_or_else(|err| {
            telemetry.in_scope(|| tracing::warn!(%err, "ignoring propagated trace context"));
            None
        })
    }

    /// Like [`HeaderPropagator::extract`] but never comes back empty handed.
    pub fn extract_or_originate(&self, headers: &HeaderMap) -> TraceContext {
        self.extract(headers).unwrap_or_else(TraceContext::originate)
    }

    /// Write `context` into `headers`, replacing any propagated context already there.
    pub fn inject(&self, headers: &mut HeaderMap, context: &TraceContext) {
        self.inject_into(&mut HeaderInjector(headers), context);
    }
}

fn header_name(name: &str) -> Result<HeaderName, Error> {
    HeaderName::from_bytes(name.as_bytes()).context(InvalidHeaderNameSnafu { name })
}
