use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{GatewayError, GatewayResult};

/// Initialize tracing: OTLP exporter when `OTEL_ENABLED` is unset/true, plain
/// `tracing-subscriber` output otherwise.
pub fn init_tracing() -> GatewayResult<()> {
    let service_name =
        env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "agon-orchestration-core".to_string());
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let enabled = env::var("OTEL_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);

    if !enabled {
        init_basic_tracing()?;
        return Ok(());
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| GatewayError::InternalError(format!("failed to create exporter: {e}")))?;

    let tracer_provider = trace::TracerProvider::builder()
        .with_resource(Resource::new(vec![
            opentelemetry::KeyValue::new(SERVICE_NAME, service_name.clone()),
            opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer("agon-orchestration-core"));

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agon_orchestrator_core=info,agon_gateway_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer);

    subscriber.init();

    tracing::info!(service = service_name, endpoint = endpoint, "tracing initialized");

    Ok(())
}

fn init_basic_tracing() -> GatewayResult<()> {
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "agon_orchestrator_core=info,agon_gateway_core=info".into()),
    );

    if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}

/// Shut down the OpenTelemetry tracer provider gracefully.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

/// Extract trace context from HTTP headers, for the (out-of-scope) HTTP
/// facade to forward into this core when it calls in.
pub fn extract_trace_context(headers: &http::HeaderMap) -> opentelemetry::Context {
    use opentelemetry::propagation::{Extractor, TextMapPropagator};
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    struct HeaderExtractor<'a>(&'a http::HeaderMap);

    impl<'a> Extractor for HeaderExtractor<'a> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).and_then(|v| v.to_str().ok())
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(|k| k.as_str()).collect()
        }
    }

    let propagator = TraceContextPropagator::new();
    propagator.extract(&HeaderExtractor(headers))
}

/// Get the current trace id from the active span, for correlating a turn's
/// log lines with the request that triggered it.
pub fn get_current_trace_id() -> Option<String> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let current_span = tracing::Span::current();
    let context = current_span.context();
    let span = context.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        Some(format!("{:032x}", span_context.trace_id()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_basic_tracing() {
        // SAFETY: test-local environment variable.
        unsafe {
            env::set_var("OTEL_ENABLED", "false");
        }
        let result = init_tracing();
        assert!(result.is_ok());
        // SAFETY: see above.
        unsafe {
            env::remove_var("OTEL_ENABLED");
        }
    }

    #[test]
    fn test_header_extraction() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
                .parse()
                .unwrap(),
        );

        let _context = extract_trace_context(&headers);
    }
}
