use data_encoding::BASE64;
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::{
    logs::LoggerProvider, metrics::SdkMeterProvider, runtime, trace as sdktrace, Resource,
};
use opentelemetry_semantic_conventions::{
    resource::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use serde::Deserialize;
use tap::Pipe;
use thiserror::Error;
use tonic::{
    metadata::{errors::InvalidMetadataValue, MetadataMap},
    transport::ClientTlsConfig,
};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{
    filter::ParseError, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Where to send logs, traces and metrics.
#[derive(Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub organization: String,
    pub stream_name: String,
}

#[derive(Deserialize)]
pub struct Config {
    pub remote: Option<RemoteConfig>,

    #[serde(default = "default_deployment_environment")]
    pub deployment_environment: String,
}

fn default_deployment_environment() -> String {
    "production".to_string()
}

// Headers required by OpenObserve.
fn otlp_metadata(config: &RemoteConfig) -> Result<MetadataMap, InvalidMetadataValue> {
    let mut map = MetadataMap::with_capacity(3);
    let authorization_value =
        BASE64.encode(format!("{}:{}", config.username, config.password).as_bytes());
    map.insert(
        "authorization",
        format!("Basic {authorization_value}").parse()?,
    );
    map.insert("organization", config.organization.parse()?);
    map.insert("stream-name", config.stream_name.parse()?);

    Ok(map)
}

fn resource(config: &Config) -> Resource {
    Resource::from_schema_url(
        [
            KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new(
                DEPLOYMENT_ENVIRONMENT_NAME,
                config.deployment_environment.clone(),
            ),
        ],
        SCHEMA_URL,
    )
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid metadata value: {0}")]
    InvalidMetadataValue(#[from] InvalidMetadataValue),

    #[error("Trace error: {0}")]
    Trace(#[from] opentelemetry::trace::TraceError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] opentelemetry::metrics::MetricsError),

    #[error("Log error: {0}")]
    Log(#[from] opentelemetry::logs::LogError),

    #[error("TryInitError error: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),

    #[error("Invalid filter directive: {0}")]
    Directive(#[from] ParseError),
}

fn exporter(remote: &RemoteConfig) -> Result<TonicExporterBuilder, Error> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_tls_config(ClientTlsConfig::new().with_enabled_roots())
        .with_endpoint(remote.endpoint.clone())
        .with_metadata(otlp_metadata(remote)?);
    Ok(exporter)
}

fn init_tracer_provider(
    resource: &Resource,
    remote: &RemoteConfig,
) -> Result<sdktrace::TracerProvider, Error> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter(remote)?)
        .with_trace_config(sdktrace::Config::default().with_resource(resource.clone()))
        .install_batch(runtime::Tokio)?
        .pipe(Ok)
}

fn init_metrics(resource: &Resource, remote: &RemoteConfig) -> Result<SdkMeterProvider, Error> {
    opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(exporter(remote)?)
        .with_resource(resource.clone())
        .build()?
        .pipe(Ok)
}

fn init_logs(resource: &Resource, remote: &RemoteConfig) -> Result<LoggerProvider, Error> {
    opentelemetry_otlp::new_pipeline()
        .logging()
        .with_resource(resource.clone())
        .with_exporter(exporter(remote)?)
        .install_batch(runtime::Tokio)?
        .pipe(Ok)
}

fn filter() -> Result<EnvFilter, Error> {
    // Events from the exporter's own HTTP stack would be exported again.
    // See https://github.com/open-telemetry/opentelemetry-rust/issues/761
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("hyper=error".parse()?)
        .add_directive("tonic=error".parse()?)
        .add_directive("reqwest=error".parse()?);
    Ok(filter)
}

/// Install the tracing subscriber, exporting to the remote collector if configured.
///
/// Keep the returned guard alive for as long as telemetry should be flushed.
///
/// # Errors
///
/// If an exporter cannot be created or a subscriber is already installed.
pub fn init_tracing_subscriber(config: &Config) -> Result<OtelGuard, Error> {
    let filter = filter()?;

    let layer = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if let Some(remote) = &config.remote {
        let resource = resource(config);
        let meter_provider = init_metrics(&resource, remote)?;
        let logger_provider = init_logs(&resource, remote)?;
        let tracer_provider = init_tracer_provider(&resource, remote)?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        let tracer = tracer_provider.tracer_builder("smart-charge-backend").build();

        layer
            .with(MetricsLayer::new(meter_provider.clone()))
            .with(OpenTelemetryLayer::new(tracer))
            .with(OpenTelemetryTracingBridge::new(&logger_provider))
            .try_init()?;

        Ok(OtelGuard {
            meter_provider: Some(meter_provider),
            logger_provider: Some(logger_provider),
        })
    } else {
        layer.init();

        Ok(OtelGuard {
            meter_provider: None,
            logger_provider: None,
        })
    }
}

/// Shuts down the telemetry providers when dropped.
pub struct OtelGuard {
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<LoggerProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();

        if let Some(provider) = self.meter_provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(provider) = self.logger_provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
