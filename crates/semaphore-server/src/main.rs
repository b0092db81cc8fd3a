//! semaphore-server entry point.

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use semaphore_server::config::{Cli, Config};
use semaphore_server::http::{self, AppState};
use semaphore_server::hub::Hub;
use semaphore_server::tls;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Budget for draining in-flight connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::from(cli);

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        "starting semaphore-server"
    );

    if config.require_tls && config.auto_generate_certs {
        match tls::ensure_self_signed_cert(config.cert_file.take(), config.key_file.take()) {
            Ok((cert, key)) => {
                info!(cert = %cert.display(), key = %key.display(), "development certificate ready");
                config.cert_file = Some(cert);
                config.key_file = Some(key);
            }
            Err(e) => {
                error!(error = %e, "failed to provision self-signed certificate");
                process::exit(1);
            }
        }
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        process::exit(1);
    }

    let addr: SocketAddr = match config.host.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %config.host, error = %e, "invalid listen address");
            process::exit(1);
        }
    };

    let hub = Hub::new();
    let config = Arc::new(config);
    let state = AppState::new(hub, Arc::clone(&config));

    // Keep the observer rate limiter from accumulating idle addresses.
    let gc_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            gc_state.gc_limiter();
        }
    });

    let app = http::router(state).into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    let served = if config.require_tls {
        let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) else {
            error!("TLS required but certificates are not configured");
            process::exit(1);
        };
        let tls_config = match tls::load_tls_config(cert, key) {
            Ok(tls_config) => tls_config,
            Err(e) => {
                error!(error = %e, "failed to load TLS configuration");
                process::exit(1);
            }
        };
        info!(address = %addr, "listening for wss connections");
        axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls_config)))
            .handle(handle)
            .serve(app)
            .await
    } else {
        warn!("TLS disabled, serving plaintext (development only)");
        info!(address = %addr, "listening for ws connections");
        axum_server::bind(addr).handle(handle).serve(app).await
    };

    if let Err(e) = served {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("semaphore-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
