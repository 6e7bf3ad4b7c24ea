//! Entry point of the warmup tool, which precomputes the warm cache of recent forecasts.
//!
//! The tool always exits successfully: failures of single entries are logged and counted.

use analogcast::cli::WarmupArgs;
use analogcast::tracing;
use analogcast::warmup::Warmup;

use std::time::SystemTime;

use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = WarmupArgs::parse();
    tracing::init_tracing(args.enable_jaeger);
    ::tracing::info!(
        data_dir = %args.data_dir.display(),
        days = args.days,
        dry_run = args.dry_run,
        "starting warmup"
    );
    let warmup = Warmup::new(args);
    match tokio::task::spawn_blocking(move || warmup.run(SystemTime::now())).await {
        Ok(summary) => ::tracing::info!(
            planned = summary.planned,
            built = summary.built,
            up_to_date = summary.up_to_date,
            busy = summary.busy,
            failed = summary.failed,
            no_sources = summary.no_sources,
            "warmup finished"
        ),
        Err(error) => ::tracing::error!(%error, "warmup aborted"),
    }
    tracing::shutdown_tracing();
}
