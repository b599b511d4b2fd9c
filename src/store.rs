//! The book store behind the inventory service.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use snafu::Snafu;

use crate::id::HexIdentifier as _;
use crate::propagation::TraceContext;
use crate::span::SpanHandle;
use crate::telemetry::Telemetry;
use crate::transport::CANCELLED;

/// The only query the store knows.
pub const COUNT_QUERY: &str = "SELECT * FROM books";

/// Store errors
#[derive(Debug, Snafu)]
pub enum Error {
    /// The store refuses queries, e.g. while the failure switch is on.
    #[snafu(display("too many open connections"))]
    Unavailable,
}

/// One row of the `books` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Book {
    /// Title
    pub name: String,
    /// Author
    pub author: String,
    /// Year of publication
    pub year: u16,
}

/// Where the inventory service counts its books.
#[async_trait]
pub trait BookStore: fmt::Debug + Send + Sync {
    /// Number of books, i.e. the row count of [`COUNT_QUERY`].
    async fn count_books(&self) -> Result<u64, Error>;
}

/// Books kept in memory, with an optional delay per query.
#[derive(Debug)]
pub struct MemoryStore {
    books: Vec<Book>,
    latency: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            books: vec![Book {
                name: "Harry Potter".to_owned(),
                author: "J.K. Rowling".to_owned(),
                year: 1997,
            }],
            latency: Duration::ZERO,
        }
    }
}

impl MemoryStore {
    /// A store holding exactly `books`.
    pub fn new(books: Vec<Book>) -> Self {
        Self {
            books,
            latency: Duration::ZERO,
        }
    }

    /// Wait `latency` before answering each query.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl BookStore for MemoryStore {
    async fn count_books(&self) -> Result<u64, Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.books.len() as u64)
    }
}

/// Wraps a [`BookStore`] with a span, a `db.queries.total` sample and a log line per query,
/// plus a switch that makes every query fail.
#[derive(Debug)]
pub struct InstrumentedStore {
    inner: Arc<dyn BookStore>,
    telemetry: Arc<Telemetry>,
    broken: AtomicBool,
}

impl InstrumentedStore {
    /// Wrap `inner`, recording every query through `telemetry`. The failure switch starts off.
    pub fn new(inner: impl BookStore + 'static, telemetry: Arc<Telemetry>) -> Self {
        Self {
            inner: Arc::new(inner),
            telemetry,
            broken: AtomicBool::new(false),
        }
    }

    /// Flip the failure switch and return its new position.
    pub fn toggle(&self) -> bool {
        let broken = !self.broken.fetch_xor(true, Ordering::SeqCst);
        self.telemetry
            .in_scope(|| tracing::info!(broken, "failure toggle switched"));
        broken
    }

    /// The telemetry client queries are recorded through.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Whether the failure switch is on.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Count the books, recording the query under `parent`.
    ///
    /// A query dropped before it completes is recorded as failed with
    /// [`CANCELLED`](crate::transport::CANCELLED).
    ///
    /// # Errors
    /// - `Unavailable` while the failure switch is on, or whatever the wrapped store reports.
    pub async fn count_books(&self, parent: Option<&TraceContext>) -> Result<u64, Error> {
        let span = self.telemetry.recorder().start(
            "db.query",
            SpanKind::Client,
            vec![
                KeyValue::new("db.system.name", "memory"),
                KeyValue::new("db.operation.name", "SELECT"),
                KeyValue::new("db.query.text", COUNT_QUERY),
            ],
            parent,
        );
        let query = Query {
            telemetry: &self.telemetry,
            span: Some(span),
            started: Instant::now(),
        };

        let result = if self.is_broken() {
            UnavailableSnafu.fail()
        } else {
            self.inner.count_books().await
        };
        query.finish(result.as_ref().map(|_| ()).map_err(ToString::to_string));

        result
    }
}

/// Bookkeeping of one query, recorded once: by [`Query::finish`], or as cancelled on drop.
struct Query<'t> {
    telemetry: &'t Telemetry,
    span: Option<SpanHandle>,
    started: Instant,
}

impl Query<'_> {
    fn finish(mut self, outcome: Result<(), String>) {
        self.record(outcome);
    }

    fn record(&mut self, outcome: Result<(), String>) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => span.set_status(Status::error(err.clone())),
        };
        self.telemetry.queries().add("select", outcome.is_ok());

        let trace_id = span.trace_id().encode();
        let span_id = span.span_id().encode();
        self.telemetry.in_span_scope(&span, || match &outcome {
            Ok(()) => tracing::info!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms,
                "Database query [{COUNT_QUERY}] succeeded in {elapsed_ms} milliseconds"
            ),
            Err(err) => tracing::error!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms,
                "Database query [{COUNT_QUERY}] failed in {elapsed_ms} milliseconds with [{err}]"
            ),
        });
        span.end();
    }
}

impl Drop for Query<'_> {
    fn drop(&mut self) {
        self.record(Err(CANCELLED.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_is_seeded_with_one_book() {
        let store = MemoryStore::default();
        assert_eq!(store.count_books().await.unwrap(), 1);
        assert_eq!(store.books[0].author, "J.K. Rowling");
    }

    #[tokio::test]
    async fn memory_store_counts_what_it_was_given() {
        let store = MemoryStore::new(Vec::new());
        assert_eq!(store.count_books().await.unwrap(), 0);
    }

    #[test]
    fn unavailable_reads_like_a_connection_problem() {
        assert_eq!(Error::Unavailable.to_string(), "too many open connections");
    }
}
