//! Log output for a federator node: compact lines on stdout, plus signing rounds and bridge
//! iterations exported as OTLP spans when a collector is configured.

use std::env;

use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Where to export spans, e.g. `http://collector:4317`. Unset keeps logs local.
pub const OTLP_URL_ENVVAR: &str = "FEDERATOR_OTLP_URL";

/// Tells federators of one deployment apart, e.g. `alpha` gives `federator%alpha`.
pub const SVC_LABEL_ENVVAR: &str = "FEDERATOR_SVC_LABEL";

/// Errors raised while installing the logging subsystem.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The OTLP span exporter could not be built.
    #[error("could not build otlp exporter: {0}")]
    Exporter(String),
}

/// How a node names itself in logs and where its spans go.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Node name, recorded as `service.name` on exported spans.
    whoami: String,

    /// Collector endpoint. `None` skips the OTLP layer.
    otel_url: Option<String>,
}

impl LoggerConfig {
    /// Logs as `whoami`, without exporting spans.
    pub const fn new(whoami: String) -> Self {
        Self {
            whoami,
            otel_url: None,
        }
    }

    /// Logs as `s`, suffixed with the deployment label when [`SVC_LABEL_ENVVAR`] is set.
    pub fn with_base_name(s: &str) -> Self {
        Self::new(get_whoami_string(s))
    }

    /// Exports spans to `url`.
    pub fn set_otlp_url(&mut self, url: String) {
        self.otel_url = Some(url);
    }

    /// The node name.
    pub fn whoami(&self) -> &str {
        &self.whoami
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self::with_base_name("(federator)")
    }
}

/// Installs the process-wide subscriber. Call once, before any bridge starts.
///
/// `RUST_LOG` filters stdout, e.g. `federator_orchestrator=debug`. `LOG_FILE=1` and
/// `LOG_LINE_NUM=1` print where each event was emitted.
pub fn init(config: LoggerConfig) -> Result<(), LoggingError> {
    let filt = tracing_subscriber::EnvFilter::from_default_env();

    let log_file = env::var("LOG_FILE").is_ok_and(|v| v == "1");
    let log_line_num = env::var("LOG_LINE_NUM").is_ok_and(|v| v == "1");

    let stdout_sub = tracing_subscriber::fmt::layer()
        .compact()
        .event_format(
            tracing_subscriber::fmt::format()
                .with_file(log_file)
                .with_line_number(log_line_num),
        )
        .with_filter(filt);

    if let Some(otel_url) = &config.otel_url {
        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", config.whoami.clone()))
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(otel_url)
            .build()
            .map_err(|e| LoggingError::Exporter(e.to_string()))?;

        let tp = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build();

        let tracer = tp.tracer("federator");
        let otel_sub = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(stdout_sub)
            .with(otel_sub)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_sub).init();
    }

    info!(whoami = %config.whoami, "logging started");
    Ok(())
}

/// The collector endpoint from [`OTLP_URL_ENVVAR`], if set.
pub fn get_otlp_url_from_env() -> Option<String> {
    env::var(OTLP_URL_ENVVAR).ok()
}

/// The deployment label from [`SVC_LABEL_ENVVAR`], if set.
pub fn get_service_label_from_env() -> Option<String> {
    env::var(SVC_LABEL_ENVVAR).ok()
}

/// `base`, or `base%label` when the deployment has a label.
pub fn get_whoami_string(base: &str) -> String {
    match get_service_label_from_env() {
        Some(label) => format!("{base}%{label}"),
        None => base.to_owned(),
    }
}
