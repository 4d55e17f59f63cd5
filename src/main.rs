//! OTA firmware server binary.
//!
//! Accepts `.bin` firmware uploads, stores them on disk, records each upload
//! in a CSV ledger and serves the binaries back to devices by filename.

mod atomic;
mod config;
mod error;
mod firmware;
mod http;
mod ledger;
mod locking;
mod logging;
mod routes;
mod store;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{Args, DEFAULT_LOCK_WAIT_TIMEOUT_SECS, SHUTDOWN_GRACE_SECS};
use crate::firmware::UploadConfig;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::ledger::Ledger;
use crate::locking::LockManager;
use crate::routes::{ENDPOINTS, build_router};
use crate::store::FirmwareStore;

shadow!(build);

/// Starts the OTA server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.log_format);

    let store = Arc::new(FirmwareStore::new(PathBuf::from(&args.firmware_dir)));
    store.ensure_root().await?;
    store.remove_stale_temp_files().await?;
    let ledger = Ledger::initialize(PathBuf::from(&args.ledger_file))
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let ledger = Arc::new(ledger);
    let upload_config = Arc::new(UploadConfig {
        base_url: args.advertised_base_url(),
        default_version: args.default_version.clone(),
        max_upload_size: args.max_upload_size,
        lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
    });
    let lock_manager = Arc::new(LockManager::new());

    let mut app = build_router(
        store.clone(),
        ledger.clone(),
        lock_manager,
        upload_config.clone(),
    ).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip());
                let client_ip = resolve_client_ip(request.headers(), connect_ip)
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    client_ip,
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    let firmware_dir = std::fs::canonicalize(store.root_path())
        .unwrap_or_else(|_| store.root_path().to_path_buf());
    info!("🚀 Starting OTA server at {}", addr);
    info!(firmware_dir = ?firmware_dir, ledger = ?ledger.path(), base_url = upload_config.base_url, "storage ready");
    for endpoint in ENDPOINTS {
        info!("  {:<4} {:<22} : {}", endpoint.method, endpoint.path, endpoint.summary);
    }

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle));
    server.await?;
    info!("OTA server stopped");

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
