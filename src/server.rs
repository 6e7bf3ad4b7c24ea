//! Web server

use crate::cli;

use std::{net::SocketAddr, path::PathBuf, process::exit, str::FromStr, time::Duration};

use axum::ServiceExt;
use axum_server::{tls_rustls::RustlsConfig, Handle};
use expanduser::expanduser;
use thiserror::Error;
use tokio::signal;

/// Reasons the server could not start or stopped serving.
#[derive(Debug, Error)]
enum ServerError {
    #[error("invalid listen address {0}")]
    Address(String),

    #[error("TLS {kind} file {path} unusable: {source}")]
    TlsFile {
        kind: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("failed to load TLS certificate files: {0}")]
    TlsConfig(#[source] std::io::Error),

    #[error("{0}")]
    Serve(#[source] std::io::Error),
}

/// Serve the analogcast service until a shutdown signal, exiting the process on failure.
///
/// # Arguments
///
/// * `args`: Command line arguments
/// * `service`: The [crate::app::Service] to serve
pub async fn serve(args: &cli::CommandLineArgs, service: crate::app::Service) {
    if let Err(error) = run(args, service).await {
        tracing::error!(%error, "server failed");
        exit(1)
    }
}

async fn run(
    args: &cli::CommandLineArgs,
    service: crate::app::Service,
) -> Result<(), ServerError> {
    let addr = listen_addr(&args.host, args.port)?;
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(
        handle.clone(),
        args.graceful_shutdown_timeout,
    ));
    let service = service.into_make_service();

    let served = if args.https {
        let cert_file = tls_file("certificate", &args.cert_file)?;
        let key_file = tls_file("key", &args.key_file)?;
        let tls_config = RustlsConfig::from_pem_file(cert_file, key_file)
            .await
            .map_err(ServerError::TlsConfig)?;
        tracing::info!(%addr, "serving HTTPS");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service)
            .await
    } else {
        tracing::info!(%addr, "serving HTTP");
        axum_server::bind(addr).handle(handle).serve(service).await
    };
    served.map_err(ServerError::Serve)
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let addr = format!("{host}:{port}");
    SocketAddr::from_str(&addr).map_err(|_| ServerError::Address(addr))
}

/// Absolute path of a TLS file given on the command line, which may start with `~`.
fn tls_file(kind: &'static str, path: &str) -> Result<PathBuf, ServerError> {
    expanduser(path)
        .and_then(|expanded| expanded.canonicalize())
        .map_err(|source| ServerError::TlsFile {
            kind,
            path: path.to_string(),
            source,
        })
}

/// Waits for Ctrl-C or SIGTERM, then shuts the server down, forcibly after `timeout` seconds.
async fn shutdown_signal(handle: Handle, timeout: u64) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(timeout, "signal received, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(timeout)));
}
