//! Telemetry client: tracer, meter and logger providers plus the log subscriber, owned together.
//!
//! Nothing here is registered globally. Components receive the client (usually behind an `Arc`)
//! and record through it, so several independent clients can live in one process.
//!
//! Export runs on the SDK's background paths (batch span and log processors, periodic metric
//! reader). A collector that is down or unreachable costs dropped telemetry, never a failed
//! request.

use std::fmt;
use std::time::Duration;

use doku::Document;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{
    ExporterBuildError, LogExporter, MetricExporter, SpanExporter, WithExportConfig as _,
};
use opentelemetry_sdk::logs::{LoggerProviderBuilder, SdkLoggerProvider};
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, TracerProviderBuilder};
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::Dispatch;
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::metrics::{QueryCounter, RequestCounter};
use crate::span::{SpanHandle, SpanRecorder};
use crate::ServiceInfo;

/// Targets never forwarded to the collector, so exporting logs cannot generate more logs.
const OTEL_MUTED_TARGETS: [&str; 5] = [
    "hyper=off",
    "opentelemetry=off",
    "tonic=off",
    "h2=off",
    "reqwest=off",
];

/// Telemetry initialization errors
#[derive(Debug, Snafu)]
pub enum Error {
    /// The OTLP log exporter could not be built
    #[snafu(display("Could not initialize logging: {source}"))]
    InitLog {
        /// Exporter error
        source: ExporterBuildError,
    },

    /// The OTLP metric exporter could not be built
    #[snafu(display("Could not initialize metrics: {source}"))]
    InitMetric {
        /// Exporter error
        source: ExporterBuildError,
    },

    /// The OTLP span exporter could not be built
    #[snafu(display("Could not initialize tracing: {source}"))]
    InitTrace {
        /// Exporter error
        source: ExporterBuildError,
    },

    /// A console or collector log level is not a valid filter
    #[snafu(display("Invalid log filter: {source}"))]
    LogFilter {
        /// Filter parse error
        source: ParseError,
    },
}

/// Metric export settings
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct MetricSettings {
    /// OTLP/gRPC endpoint for metrics. Metrics are aggregated but not exported when unset
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,

    /// Milliseconds between two metric exports
    #[doku(example = "5000")]
    pub export_interval_ms: u64,
}

impl Default for MetricSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            export_interval_ms: 5000,
        }
    }
}

impl MetricSettings {
    /// [`MetricSettings::export_interval_ms`] as a duration.
    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }
}

/// Log output settings
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct LogSettings {
    /// Filter for the console output
    #[doku(example = "debug,tracehop=trace")]
    pub console_level: String,

    /// Filter for logs forwarded to the collector
    #[doku(example = "warn,tracehop=info")]
    pub otel_level: String,

    /// OTLP/gRPC endpoint for logs
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_owned(),
            otel_level: "info".to_owned(),
            endpoint: None,
        }
    }
}

/// Span export settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct TraceSettings {
    /// OTLP/gRPC endpoint for spans. Spans are recorded but not exported when unset
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Telemetry settings, one section per signal
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Span settings
    pub trace: TraceSettings,
    /// Log settings
    pub log: LogSettings,
    /// Metric settings
    pub metric: MetricSettings,
}

/// Providers and instruments shared by every instrumented component of a process.
pub struct Telemetry {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: SdkLoggerProvider,
    recorder: SpanRecorder,
    requests: RequestCounter,
    queries: QueryCounter,
    dispatch: Dispatch,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("tracer_provider", &self.tracer_provider)
            .field("meter_provider", &self.meter_provider)
            .field("logger_provider", &self.logger_provider)
            .finish_non_exhaustive()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("Error shutting down Telemetry tracer provider: {err}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("Error shutting down Telemetry meter provider: {err}");
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("Error shutting down Telemetry logger provider: {err}");
        }
    }
}

impl Telemetry {
    /// Start assembling a client. [`init`] covers the OTLP case; the builder is the way in for
    /// anything else, e.g. in-memory exporters.
    pub fn builder(service_info: &ServiceInfo) -> TelemetryBuilder {
        TelemetryBuilder::new(service_info)
    }

    /// Starts the spans of this client.
    pub fn recorder(&self) -> &SpanRecorder {
        &self.recorder
    }

    /// Outbound and served HTTP requests, by method, path and status class.
    pub fn requests(&self) -> &RequestCounter {
        &self.requests
    }

    /// Data store queries, by query type and outcome.
    pub fn queries(&self) -> &QueryCounter {
        &self.queries
    }

    /// The subscriber owned by this client. The binary installs it as the process default.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run `f` with this client's subscriber and `span` active, so `tracing` events emitted by
    /// `f` are exported carrying the span's trace and span ids.
    pub fn in_span_scope<R>(&self, span: &SpanHandle, f: impl FnOnce() -> R) -> R {
        let _attached = span.context().clone().attach();
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Run `f` with this client's subscriber, for events that belong to no span.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Push everything recorded so far to the exporters. Failures are reported on stderr only.
    pub fn force_flush(&self) {
        if let Err(err) = self.tracer_provider.force_flush() {
            eprintln!("Error flushing Telemetry tracer provider: {err}");
        }
        if let Err(err) = self.meter_provider.force_flush() {
            eprintln!("Error flushing Telemetry meter provider: {err}");
        }
        if let Err(err) = self.logger_provider.force_flush() {
            eprintln!("Error flushing Telemetry logger provider: {err}");
        }
    }
}

/// Assembles a [`Telemetry`] client. Every signal is always recorded; exporters are optional.
pub struct TelemetryBuilder {
    scope: &'static str,
    traces: TracerProviderBuilder,
    metrics: MeterProviderBuilder,
    logs: LoggerProviderBuilder,
    log_settings: LogSettings,
}

impl TelemetryBuilder {
    fn new(service_info: &ServiceInfo) -> Self {
        let resource = Resource::builder()
            .with_service_name(service_info.name_in_metrics.clone())
            .with_attribute(KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                service_info.version,
            ))
            .build();

        Self {
            scope: service_info.name,
            traces: SdkTracerProvider::builder()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(resource.clone()),
            metrics: SdkMeterProvider::builder().with_resource(resource.clone()),
            logs: SdkLoggerProvider::builder().with_resource(resource),
            log_settings: LogSettings::default(),
        }
    }

    /// Console and collector log filters. Defaults to `info` for both.
    pub fn with_log_settings(mut self, log_settings: LogSettings) -> Self {
        self.log_settings = log_settings;
        self
    }

    /// Add exporters or processors to the tracer provider.
    pub fn configure_traces(
        mut self,
        configure: impl FnOnce(TracerProviderBuilder) -> TracerProviderBuilder,
    ) -> Self {
        self.traces = configure(self.traces);
        self
    }

    /// Add readers to the meter provider.
    pub fn configure_metrics(
        mut self,
        configure: impl FnOnce(MeterProviderBuilder) -> MeterProviderBuilder,
    ) -> Self {
        self.metrics = configure(self.metrics);
        self
    }

    /// Add exporters or processors to the logger provider.
    pub fn configure_logs(
        mut self,
        configure: impl FnOnce(LoggerProviderBuilder) -> LoggerProviderBuilder,
    ) -> Self {
        self.logs = configure(self.logs);
        self
    }

    /// Build the providers, instruments and log subscriber.
    ///
    /// # Errors
    /// - `LogFilter` if a configured log level does not parse.
    pub fn build(self) -> Result<Telemetry, Error> {
        let tracer_provider = self.traces.build();
        let meter_provider = self.metrics.build();
        let logger_provider = self.logs.build();

        let dispatch = log_dispatch(&logger_provider, &self.log_settings).context(LogFilterSnafu)?;
        let meter = meter_provider.meter(self.scope);

        Ok(Telemetry {
            recorder: SpanRecorder::new(tracer_provider.tracer(self.scope)),
            requests: RequestCounter::new(&meter),
            queries: QueryCounter::new(&meter),
            tracer_provider,
            meter_provider,
            logger_provider,
            dispatch,
        })
    }
}

fn log_dispatch(
    logger_provider: &SdkLoggerProvider,
    settings: &LogSettings,
) -> Result<Dispatch, ParseError> {
    let mut filter_otel = EnvFilter::try_new(&settings.otel_level)?;
    for directive in OTEL_MUTED_TARGETS {
        filter_otel = filter_otel.add_directive(directive.parse::<Directive>()?);
    }
    let otel_layer = OpenTelemetryTracingBridge::new(logger_provider).with_filter(filter_otel);

    let filter_fmt = EnvFilter::try_new(&settings.console_level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(filter_fmt);

    Ok(Dispatch::new(
        tracing_subscriber::registry().with(otel_layer).with(fmt_layer),
    ))
}

/// Build a client exporting over OTLP/gRPC to the configured endpoints.
///
/// Signals without an endpoint are still recorded, they just go nowhere.
///
/// # Errors
/// - `InitTrace`, `InitMetric`, `InitLog` if an exporter cannot be built.
/// - `LogFilter` if a configured log level does not parse.
pub fn init(service_info: &ServiceInfo, settings: &TelemetrySettings) -> Result<Telemetry, Error> {
    let mut builder = Telemetry::builder(service_info).with_log_settings(settings.log.clone());

    if let Some(endpoint) = &settings.trace.endpoint {
        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context(InitTraceSnafu)?;
        builder = builder.configure_traces(|traces| traces.with_batch_exporter(exporter));
    }

    if let Some(endpoint) = &settings.metric.endpoint {
        let exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context(InitMetricSnafu)?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(settings.metric.export_interval())
            .build();
        builder = builder.configure_metrics(|metrics| metrics.with_reader(reader));
    }

    if let Some(endpoint) = &settings.log.endpoint {
        let exporter = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context(InitLogSnafu)?;
        builder = builder.configure_logs(|logs| logs.with_batch_exporter(exporter));
    }

    builder.build()
}
