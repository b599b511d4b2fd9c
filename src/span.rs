//! Spans with explicit parents and a once-only lifecycle.
//!
//! A [`SpanHandle`] ends exactly once: either through [`SpanHandle::end`] or when it is dropped,
//! which covers early returns and cancelled futures. Its status can be set once; later attempts
//! are ignored. Dropping does not set a status, that is left to whoever owns the handle.

use std::borrow::Cow;

use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceContextExt as _, TraceId, Tracer as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;

use crate::propagation::TraceContext;

/// Starts spans on one tracer.
#[derive(Clone, Debug)]
pub struct SpanRecorder {
    tracer: SdkTracer,
}

impl SpanRecorder {
    /// Record with `tracer`.
    pub fn new(tracer: SdkTracer) -> Self {
        Self { tracer }
    }

    /// Start a span as a child of `parent`, or as the root of a new trace when there is none.
    ///
    /// The current OpenTelemetry context is never consulted; the parent is always explicit.
    pub fn start(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: Option<&TraceContext>,
    ) -> SpanHandle {
        let parent_cx = match parent {
            Some(parent) => Context::new().with_remote_span_context(parent.to_remote_span_context()),
            None => Context::new(),
        };

        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent_cx);

        SpanHandle {
            cx: parent_cx.with_span(span),
            status_set: false,
            ended: false,
        }
    }
}

/// An in-flight span, exclusively owned by the operation it measures.
#[derive(Debug)]
pub struct SpanHandle {
    cx: Context,
    status_set: bool,
    ended: bool,
}

impl SpanHandle {
    /// Identity of the span.
    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    /// The identifiers to hand to the next hop.
    pub fn trace_context(&self) -> TraceContext {
        TraceContext::from(&self.span_context())
    }

    /// Id of the trace the span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.cx.span().span_context().trace_id()
    }

    /// Id of the span itself.
    pub fn span_id(&self) -> SpanId {
        self.cx.span().span_context().span_id()
    }

    /// The context with this span active, for attaching while emitting correlated logs.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Add or replace an attribute.
    pub fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    /// Set the final status. Returns `false`, leaving the span untouched, if a status was
    /// already set.
    pub fn set_status(&mut self, status: Status) -> bool {
        if self.status_set {
            return false;
        }
        self.status_set = true;
        self.cx.span().set_status(status);
        true
    }

    /// Stamp the end time and hand the span to the exporter.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.cx.span().end();
        }
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        self.finish();
    }
}
