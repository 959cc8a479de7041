use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging, tracing and metrics settings resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Reported as `service.name` on spans and as the `service` metric label.
    pub service_name: String,
    /// `EnvFilter` directives, e.g. `info,log_relay=debug`.
    pub log_filter: String,
    /// Also export spans to stdout through OpenTelemetry.
    pub otel_stdout: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "harbor-api".into(),
            log_filter: "info".into(),
            otel_stdout: false,
        }
    }
}

/// Process-wide telemetry. Dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(config: &TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("service", config.service_name.clone())
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let filter = EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("invalid log filter: {}", config.log_filter))?;

        let tracer_provider = config
            .otel_stdout
            .then(|| stdout_tracer_provider(&config.service_name));
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!(service = %config.service_name, "OpenTelemetry stdout exporter enabled");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider(service_name: &str) -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", service_name.to_string())])
                .build(),
        )
        .build()
}
