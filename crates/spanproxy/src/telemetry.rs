use std::io::IsTerminal;
use std::sync::Mutex;

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace as sdktrace;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("SPANPROXY_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Logging for one-shot commands. Logs go to stderr so stdout stays
/// parseable.
pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact()
        .try_init();
}

pub fn init_run_tracing(format: LogFormat) {
    let compact_layer = (format == LogFormat::Compact).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .compact()
    });
    let json_layer = (format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(compact_layer)
        .with(json_layer)
        .with(build_otlp_layer())
        .try_init();
}

/// Exporter provider kept alive for the process so pending spans can be
/// flushed on exit.
static OTLP_PROVIDER: Mutex<Option<sdktrace::SdkTracerProvider>> = Mutex::new(None);

/// Flushes and stops the OTLP exporter, if one was started.
pub fn shutdown_tracing() {
    let provider = OTLP_PROVIDER.lock().ok().and_then(|mut slot| slot.take());
    if let Some(provider) = provider
        && let Err(err) = provider.shutdown()
    {
        eprintln!("spanproxy: otlp exporter shutdown failed: {err}");
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn build_otlp_layer<S>() -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT")?;

    // Endpoint and headers come from the standard OTEL_EXPORTER_OTLP_* vars.
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("spanproxy: otlp export disabled: {err}");
            return None;
        }
    };
    let provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("spanproxy"));
    if let Ok(mut slot) = OTLP_PROVIDER.lock() {
        slot.replace(provider);
    }
    Some(layer)
}
