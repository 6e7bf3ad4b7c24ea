//! Tracing (logging)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to enable debug
/// logging for this crate and tower_http if not set. With `enable_jaeger` set, spans are also
/// exported to a Jaeger agent.
pub fn init_tracing(enable_jaeger: bool) {
    let jaeger_layer = if enable_jaeger {
        opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        let tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name("analogcast")
            .install_batch(opentelemetry::runtime::Tokio)
            .expect("failed to install Jaeger tracing pipeline");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analogcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(jaeger_layer)
        .init();
}

/// Flush pending spans and shut down the tracer provider.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
