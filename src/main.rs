//! Entry point of the analogcast server.

use analogcast::app;
use analogcast::cli;
use analogcast::metrics;
use analogcast::server;
use analogcast::tracing;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(args.enable_jaeger);
    ::tracing::debug!(?args, "starting");
    metrics::register_metrics();
    let service = app::service(&args);
    server::serve(&args, service).await;
    tracing::shutdown_tracing();
}
