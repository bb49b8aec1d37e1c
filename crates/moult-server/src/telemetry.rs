//! Logging and OpenTelemetry export for moult-server.
//!
//! JSON logs always go to stdout. Traces and metrics are additionally exported
//! over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
    Resource,
};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type InitError = Box<dyn std::error::Error + Send + Sync>;

/// The global tracer provider, stored for shutdown.
static TRACER_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// The global meter provider, stored for shutdown.
static METER_PROVIDER: std::sync::OnceLock<SdkMeterProvider> = std::sync::OnceLock::new();

/// Set once the providers have been shut down.
static SHUT_DOWN: AtomicBool = AtomicBool::new(false);

/// Build the OpenTelemetry resource with service information.
fn build_resource() -> Resource {
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "moult-server".to_string());
    let service_version = std::env::var("OTEL_SERVICE_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", service_version),
            KeyValue::new("process.pid", i64::from(std::process::id())),
        ])
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,moult=debug,moult_server=debug")
}

fn filter_from(rust_log: Option<&str>, level_or_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = rust_log {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    match level_or_filter.map(str::trim) {
        Some(level_or_filter) if !level_or_filter.is_empty() => {
            let filter = if level_or_filter.contains('=') || level_or_filter.contains(',') {
                level_or_filter.to_string()
            } else {
                format!("{level},moult={level},moult_server={level}", level = level_or_filter)
            };
            EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter())
        }
        _ => default_filter(),
    }
}

/// `RUST_LOG`, else `MOULT_LOG_LEVEL` (a bare level or a full filter), else the default.
fn build_log_filter() -> EnvFilter {
    filter_from(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("MOULT_LOG_LEVEL").ok().as_deref(),
    )
}

/// Initialize OTLP export plus JSON logging.
///
/// Environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME`: Service name (default: moult-server)
/// - `OTEL_SERVICE_VERSION`: Service version (default: crate version)
pub fn init() -> Result<(), InitError> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let resource = build_resource();

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .with_resource(resource.clone())
        .build();
    let _ = TRACER_PROVIDER.set(tracer_provider.clone());
    let tracer = tracer_provider.tracer("moult-server");

    let metrics_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics_exporter).build())
        .with_resource(resource)
        .build();
    let _ = METER_PROVIDER.set(meter_provider.clone());
    opentelemetry::global::set_meter_provider(meter_provider);

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer())
        .with(telemetry_layer)
        .try_init()?;

    tracing::info!(endpoint = %otlp_endpoint, "OpenTelemetry initialized with OTLP export");
    Ok(())
}

/// Initialize JSON logging without OTLP export.
pub fn init_local() -> Result<(), InitError> {
    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer())
        .try_init()?;

    tracing::info!("Local telemetry initialized with JSON logging (no OTLP export)");
    Ok(())
}

fn json_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
}

/// Export buffered spans and metrics, leaving the providers running.
///
/// Exec discards anything still buffered, so this runs right before it; if the
/// exec fails, logging keeps working.
pub fn flush() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.force_flush() {
            tracing::warn!(error = %e, "Error flushing tracer provider");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.force_flush() {
            tracing::warn!(error = %e, "Error flushing meter provider");
        }
    }
}

/// Flush and shut down the providers before the process exits.
///
/// Only the first call does anything; it returns `false` afterwards.
pub fn shutdown() -> bool {
    if SHUT_DOWN.swap(true, Ordering::SeqCst) {
        return false;
    }

    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down meter provider");
        }
    }
    true
}

/// Connection metrics.
pub mod metrics {
    use opentelemetry::metrics::{Counter, Histogram, Meter};
    use std::sync::OnceLock;

    static METER: OnceLock<Meter> = OnceLock::new();

    fn meter() -> &'static Meter {
        METER.get_or_init(|| opentelemetry::global::meter("moult-server"))
    }

    /// Counter for connections handed to the echo handler.
    pub fn connections_accepted() -> Counter<u64> {
        meter()
            .u64_counter("moult.connections.accepted")
            .with_description("Total connections accepted")
            .with_unit("connection")
            .build()
    }

    /// Counter for lines echoed back to clients.
    pub fn lines_echoed() -> Counter<u64> {
        meter()
            .u64_counter("moult.echo.lines")
            .with_description("Total lines echoed")
            .with_unit("line")
            .build()
    }

    /// Histogram for connection lifetime.
    pub fn connection_duration() -> Histogram<f64> {
        meter()
            .f64_histogram("moult.connection.duration")
            .with_description("Time from accept to close")
            .with_unit("ms")
            .build()
    }
}
