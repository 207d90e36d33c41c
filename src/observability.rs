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

const DEFAULT_SERVICE_NAME: &str = "genguard";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

struct Instruments {
    verifications: Counter<u64>,
    verify_latency_seconds: Histogram<f64>,
    activations: Counter<u64>,
    monitor_cycles: Counter<u64>,
}

static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

/// Keeps exporters alive for the life of the process and flushes them on
/// drop. Without an OTLP endpoint only the stderr fmt layer is installed.
pub struct ObservabilityGuard {
    pipeline: Option<PipelineState>,
}

impl ObservabilityGuard {
    pub fn init(otlp_endpoint: Option<&str>) -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let pipeline = otlp_endpoint
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|endpoint| match setup_otel_pipeline(endpoint) {
                Ok(pipeline) => Some(pipeline),
                Err(err) => {
                    eprintln!(
                        "{{\"event\":\"observability_init\",\"status\":\"degraded\",\"message\":{}}}",
                        encode_json_string(&format!("{:#}", err))
                    );
                    None
                }
            });

        let otel_layer = pipeline.as_ref().map(|pipeline| {
            tracing_opentelemetry::layer().with_tracer(pipeline.tracer_provider.tracer("genguard"))
        });
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(otel_layer)
            .try_init();

        if let Some(pipeline) = pipeline.as_ref() {
            INSTRUMENTS.get_or_init(build_instruments);
            eprintln!(
                "{{\"event\":\"observability_init\",\"status\":\"ok\",\"otlp_endpoint\":{}}}",
                encode_json_string(&pipeline.endpoint)
            );
        }
        Self { pipeline }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
    }
}

fn encode_json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
}

struct PipelineState {
    endpoint: String,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    _runtime: Runtime,
}

impl PipelineState {
    fn shutdown(self) {
        let mut failures = Vec::new();
        if let Err(err) = self.meter_provider.force_flush() {
            failures.push(("metrics", format!("flush: {}", err)));
        }
        if let Err(err) = self.meter_provider.shutdown() {
            failures.push(("metrics", format!("shutdown: {}", err)));
        }
        for result in self.tracer_provider.force_flush() {
            if let Err(err) = result {
                failures.push(("traces", format!("flush: {}", err)));
            }
        }
        if let Err(err) = self.tracer_provider.shutdown() {
            failures.push(("traces", format!("shutdown: {}", err)));
        }
        for (component, message) in failures {
            eprintln!(
                "{{\"event\":\"observability_shutdown_failed\",\"component\":\"{}\",\"message\":{}}}",
                component,
                encode_json_string(&message)
            );
        }
    }
}

fn setup_otel_pipeline(endpoint: &str) -> Result<PipelineState> {
    let endpoint = endpoint.to_string();
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
        .enable_all()
        .worker_threads(1)
        .thread_name("genguard-otel")
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
        endpoint,
        tracer_provider,
        meter_provider,
        _runtime: runtime,
    })
}

fn build_instruments() -> Instruments {
    let meter = global::meter("genguard");
    Instruments {
        verifications: meter
            .u64_counter("genguard_verifications_total")
            .with_description("Bundle and live-generation verifications by target and outcome.")
            .build(),
        verify_latency_seconds: meter
            .f64_histogram("genguard_verify_latency_seconds")
            .with_description("Time spent hashing a bundle or live generation.")
            .build(),
        activations: meter
            .u64_counter("genguard_activations_total")
            .with_description("Pointer transitions (activate, rollback, recover) by outcome.")
            .build(),
        monitor_cycles: meter
            .u64_counter("genguard_monitor_cycles_total")
            .with_description("Integrity monitor cycles by outcome.")
            .build(),
    }
}

/// Metric hooks below are no-ops until a pipeline is installed.
pub fn record_verification(target: &str, outcome: &str, latency: Duration) {
    let Some(instruments) = INSTRUMENTS.get() else {
        return;
    };
    let attrs = [
        KeyValue::new("target", target.to_string()),
        KeyValue::new("outcome", outcome.to_string()),
    ];
    instruments
        .verify_latency_seconds
        .record(latency.as_secs_f64(), &attrs);
    instruments.verifications.add(1, &attrs);
}

pub fn record_activation(kind: &str, outcome: &str) {
    if let Some(instruments) = INSTRUMENTS.get() {
        instruments.activations.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }
}

pub fn record_monitor_cycle(outcome: &str) {
    if let Some(instruments) = INSTRUMENTS.get() {
        instruments
            .monitor_cycles
            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    }
}
