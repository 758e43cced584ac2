use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context as _, Result};
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::{Context, trace::FutureExt};
use opentelemetry::{
    global,
    metrics::MeterProvider,
    trace::{TraceContextExt, Tracer, TracerProvider},
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const SERVICE_NAME: &str = "openplugin";
/// Target of the per-run summary event written to the JSON log.
const RUN_EVENT_TARGET: &str = "plugin_run";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub log_file: String,
    pub event_file: String,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: PathBuf, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level,
            log_dir,
            log_file: "openplugin.log".to_string(),
            event_file: "runs.json".to_string(),
            otel_endpoint,
        }
    }
}

/// The logging backend picked by [`init_tracing`].
pub enum TelemetryHandle {
    Otlp(OtlpTelemetry),
    Files(FileTelemetry),
}

impl TelemetryHandle {
    /// Flushes pending OTLP batches; a no-op for file logs.
    pub fn shutdown(&self) {
        if let TelemetryHandle::Otlp(t) = self {
            t.shutdown();
        }
    }

    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self {
            TelemetryHandle::Otlp(t) => t.instrument_request(name, handler).await,
            TelemetryHandle::Files(t) => t.instrument_request(name, handler).await,
        }
    }
}

/// Install the global subscriber. An OTLP endpoint wins over the log directory.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryHandle> {
    let level = config.log_level.as_directive();
    match config.otel_endpoint.as_deref() {
        Some(endpoint) => Ok(TelemetryHandle::Otlp(OtlpTelemetry::init(level, endpoint)?)),
        None => Ok(TelemetryHandle::Files(FileTelemetry::init_files(
            level,
            config.log_dir.join(&config.log_file),
            config.log_dir.join(&config.event_file),
        )?)),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn service_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn otlp_log_provider(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(service_resource())
        .build())
}

fn otlp_tracer_provider(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(service_resource())
        .build())
}

fn otlp_meter_provider(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(service_resource())
        .build())
}

fn env_filter(directives: &[&str], level: &str) -> EnvFilter {
    directives
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::new(level), |f, d| f.add_directive(d))
}

/// Counters and latency for plugin runs.
pub struct RunMetrics {
    pub runs_started: Counter<u64>,
    pub runs_succeeded: Counter<u64>,
    pub runs_failed: Counter<u64>,
    pub run_latency_ms: Histogram<f64>,
}

impl RunMetrics {
    fn new(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            runs_started: meter
                .u64_counter("plugin_runs_started")
                .with_description("Plugin pipeline runs started")
                .build(),
            runs_succeeded: meter.u64_counter("plugin_runs_succeeded").build(),
            runs_failed: meter.u64_counter("plugin_runs_failed").build(),
            run_latency_ms: meter
                .f64_histogram("plugin_run_latency_ms")
                .with_description("Wall time of one plugin pipeline run")
                .with_unit("ms")
                .build(),
        }
    }

    fn finish<T, E: std::fmt::Display>(&self, name: &str, start: Instant, result: &Result<T, E>) -> f64 {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
        self.run_latency_ms.record(elapsed_ms, &[]);
        match result {
            Ok(_) => {
                self.runs_succeeded.add(1, &[]);
                info!(run = name, elapsed_ms, "plugin run succeeded");
            }
            Err(err) => {
                self.runs_failed.add(1, &[]);
                error!(run = name, elapsed_ms, error = %err, "plugin run failed");
            }
        }
        elapsed_ms
    }
}

/// Logs, spans and metrics exported over OTLP/HTTP to one collector.
pub struct OtlpTelemetry {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    metrics: RunMetrics,
}

impl OtlpTelemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = otlp_log_provider(endpoint)?;
        let tracer_provider = otlp_tracer_provider(endpoint)?;
        let meter_provider = otlp_meter_provider(endpoint)?;

        // exporter internals would otherwise log about their own requests
        let bridge = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(env_filter(
            &["hyper=off", "tonic=off", "h2=off", "reqwest=off"],
            log_level,
        ));
        let stdout = fmt::layer()
            .with_thread_names(true)
            .with_filter(env_filter(&["opentelemetry=debug"], log_level));

        Registry::default()
            .with(bridge)
            .with(stdout)
            .try_init()
            .context("tracing subscriber already installed")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());
        let meter = meter_provider.meter(SERVICE_NAME);

        Ok(Self {
            logger_provider,
            tracer_provider,
            meter_provider,
            metrics: RunMetrics::new(&meter),
        })
    }

    /// Runs `handler` under an OTLP span named `name`.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.metrics.runs_started.add(1, &[]);
        let start = Instant::now();
        let span = self.tracer_provider.tracer(SERVICE_NAME).start(name.to_string());

        let cx: Context = Context::current_with_span(span);
        let result = handler().with_context(cx).await;
        self.metrics.finish(name, start, &result);
        result
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            error!("tracer shutdown failed: {e}");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            error!("meter shutdown failed: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            error!("logger shutdown failed: {e}");
        }
    }
}

/// Daily-rolling text log, plus one JSON line per plugin run in a separate file.
pub struct FileTelemetry {
    metrics: RunMetrics,
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let dir = anyhow::Context::with_context(path.parent(), || {
        format!("log path {} has no parent directory", path.display())
    })?;
    let file = anyhow::Context::with_context(path.file_name(), || {
        format!("log path {} has no file name", path.display())
    })?;
    Ok((dir, file))
}

impl FileTelemetry {
    /// `log_level` is an `EnvFilter` directive such as `"info"`; both files
    /// rotate daily and their directories are created when missing.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let (log_dir, log_name) = split_log_path(&log_file)?;
        std::fs::create_dir_all(log_dir)?;
        let text_layer = fmt::Layer::default()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
            .with_ansi(false);

        // only the per-run summary events land in the JSON file
        let (event_dir, event_name) = split_log_path(&event_file)?;
        std::fs::create_dir_all(event_dir)?;
        let run_layer = fmt::layer()
            .json()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
            .with_target(true)
            .with_filter(EnvFilter::new(format!("{RUN_EVENT_TARGET}=info")));

        Registry::default()
            .with(EnvFilter::new(log_level))
            .with(text_layer)
            .with(run_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        Ok(Self {
            metrics: RunMetrics::new(&global::meter(SERVICE_NAME)),
        })
    }

    /// Runs `handler`, then writes its outcome and latency as one JSON event.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.metrics.runs_started.add(1, &[]);
        let start = Instant::now();

        let result = handler().await;
        let elapsed = self.metrics.finish(name, start, &result);

        tracing::event!(
            target: RUN_EVENT_TARGET,
            tracing::Level::INFO,
            run = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }
}
