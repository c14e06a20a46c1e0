use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "EVERGREEN_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const OTEL_DISABLED_ENV: &str = "EVERGREEN_OTEL_DISABLED";
const DEFAULT_SERVICE_NAME: &str = "evergreen-agent";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static UPDATE_APPLY_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static HEALTHCHECK_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static DOWNLOAD_SECONDS_HISTOGRAM: OnceLock<Histogram<f64>> = OnceLock::new();
static DOWNLOAD_BYTES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

/// Keeps the exporters alive; flushes them on drop.
pub struct ObservabilityGuard {
    _tracer_provider: Option<SdkTracerProvider>,
    _meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let pipeline = if otel_disabled() {
            Err(anyhow::anyhow!("disabled by {}", OTEL_DISABLED_ENV))
        } else {
            setup_otel_pipeline()
        };

        match pipeline {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("evergreen-agent");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().with_target(false))
                    .with(otel_layer)
                    .try_init();

                init_instruments();
                tracing::info!(
                    otlp_endpoint = %pipeline.endpoint,
                    "observability initialized"
                );

                Self {
                    _tracer_provider: Some(pipeline.tracer_provider),
                    _meter_provider: Some(pipeline.meter_provider),
                    _tokio_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().with_target(false))
                    .try_init();
                tracing::warn!(error = %err, "observability degraded to local logging");
                Self {
                    _tracer_provider: None,
                    _meter_provider: None,
                    _tokio_runtime: None,
                }
            }
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self._meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                eprintln!(
                    "{{\"event\":\"observability_shutdown\",\"component\":\"metrics\",\"status\":\"flush_error\",\"message\":{}}}",
                    encode_message(&err.to_string())
                );
            }
            if let Err(err) = meter_provider.shutdown() {
                eprintln!(
                    "{{\"event\":\"observability_shutdown\",\"component\":\"metrics\",\"status\":\"shutdown_error\",\"message\":{}}}",
                    encode_message(&err.to_string())
                );
            }
        }

        if let Some(tracer_provider) = self._tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                eprintln!(
                    "{{\"event\":\"observability_shutdown\",\"component\":\"traces\",\"status\":\"flush_error\",\"message\":{}}}",
                    encode_message(&flush_errors.join("; "))
                );
            }
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!(
                    "{{\"event\":\"observability_shutdown\",\"component\":\"traces\",\"status\":\"shutdown_error\",\"message\":{}}}",
                    encode_message(&err.to_string())
                );
            }
        }
    }
}

fn encode_message(message: &str) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
}

fn otel_disabled() -> bool {
    env::var(OTEL_DISABLED_ENV)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

fn setup_otel_pipeline() -> Result<PipelineState> {
    let endpoint = env::var(OTLP_ENDPOINT_OVERRIDE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = env::var("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("evergreen-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn init_instruments() {
    let meter = global::meter("evergreen-agent");

    let _ = UPDATE_APPLY_COUNTER.get_or_init(|| {
        meter
            .u64_counter("update_apply_total")
            .with_description("Update level apply attempts by outcome.")
            .build()
    });
    let _ = HEALTHCHECK_COUNTER.get_or_init(|| {
        meter
            .u64_counter("healthcheck_total")
            .with_description("Post-restart health checks by outcome.")
            .build()
    });
    let _ = DOWNLOAD_SECONDS_HISTOGRAM.get_or_init(|| {
        meter
            .f64_histogram("artifact_download_seconds")
            .with_description("Artifact download latency in seconds, retries included.")
            .build()
    });
    let _ = DOWNLOAD_BYTES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("artifact_download_bytes")
            .with_description("Bytes written for verified artifacts.")
            .build()
    });
}

pub fn record_update_apply(level: u64, forced: bool, status: &str) {
    let attrs = vec![
        KeyValue::new("level", i64::try_from(level).unwrap_or(i64::MAX)),
        KeyValue::new("forced", forced),
        KeyValue::new("status", status.to_string()),
    ];
    if let Some(counter) = UPDATE_APPLY_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

pub fn record_healthcheck(healthy: bool) {
    let status = if healthy { "healthy" } else { "unhealthy" };
    if let Some(counter) = HEALTHCHECK_COUNTER.get() {
        counter.add(1, &[KeyValue::new("status", status)]);
    }
}

pub fn record_download(status: &str, attempts: u32, latency_ms: u64, bytes: u64) {
    let attrs = vec![
        KeyValue::new("status", status.to_string()),
        KeyValue::new("attempts", i64::from(attempts)),
    ];
    if let Some(histogram) = DOWNLOAD_SECONDS_HISTOGRAM.get() {
        histogram.record((latency_ms as f64) / 1000.0, &attrs);
    }
    if bytes > 0 {
        if let Some(counter) = DOWNLOAD_BYTES_COUNTER.get() {
            counter.add(bytes, &attrs);
        }
    }
}
