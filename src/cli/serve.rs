//! HTTP API server command.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use leasepool::api::create_router;
use leasepool::pool::Pool;
use leasepool::supervisor::LeaseSupervisor;
use leasepool::vm::backend::SharedResources;
use leasepool::{Error, Result};

/// Start the REST server.
#[derive(Args, Debug)]
#[command(after_long_help = "\
Leases, snapshot bindings and the catalog live as JSON files under data_dir.
Send SIGHUP to re-read devices.json and users.json without restarting.

API ENDPOINTS (under /{context_root}):
  GET    /health                    Health check
  GET    /devices/:lessor           List devices
  GET    /status/:name              VM state and activity
  GET    /ip/:name                  VM address
  POST   /lease/by-name             Lease by name
  POST   /lease/by-os               Lease by OS
  POST   /lease/by-contents         Lease by contents, OS and bits
  POST   /unlease                   Release a device
  POST   /start | /stop | /restore  VM lifecycle
  POST   /snapshot/take|rename|update|bind
  POST   /devices/add | /devices/remove
  POST   /reload                    Re-read the catalog

EXAMPLES:
  leasepool serve                          Use ./leasepool.toml
  leasepool serve -c /etc/leasepool.toml   Explicit config file
  leasepool serve -l 0.0.0.0:9000          Override the listen address")]
pub struct ServeCmd {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address and port to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<String>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self) -> Result<()> {
        let mut config = super::load_config(self.config.as_ref())?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }

        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            Error::Config(format!("invalid listen address '{}': {}", config.listen, e))
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        runtime.block_on(async move {
            let pool = Arc::new(Pool::from_config(&config, &SharedResources::new(config.command_timeout))?);
            run_server(pool, addr, &config.context_root, config.lease.sweep_interval).await
        })
    }
}

async fn run_server(
    pool: Arc<Pool>,
    addr: SocketAddr,
    context_root: &str,
    sweep_interval: Duration,
) -> Result<()> {
    // Create shutdown channel for supervisor
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor = LeaseSupervisor::new(pool.clone(), sweep_interval, shutdown_rx);
    let supervisor_handle = tokio::spawn(supervisor.run());

    #[cfg(unix)]
    let reload_handle = tokio::spawn(reload_on_hangup(pool.clone()));

    let app = create_router(pool, context_root);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Io)?;

    tracing::info!(address = %addr, root = %context_root, "starting HTTP API server");
    println!("leasepool listening on http://{}/{}", addr, context_root);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    // Signal supervisor to stop
    let _ = shutdown_tx.send(true);
    #[cfg(unix)]
    reload_handle.abort();

    // Wait for supervisor to finish (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor_handle).await;

    Ok(())
}

/// Re-read the catalog each time the process receives SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(pool: Arc<Pool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGHUP handler, catalog reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match pool.reload_catalog() {
            Ok(result) => tracing::info!(msg = %result.msg, "catalog reloaded on SIGHUP"),
            Err(e) => tracing::warn!(error = %e, "catalog reload failed, keeping previous catalog"),
        }
    }
}

/// Wait for shutdown signal.
/// VMs keep their state; only the REST surface and supervisor stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

    tracing::info!("shutdown signal received");
}
