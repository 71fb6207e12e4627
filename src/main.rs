//! beamline-tcp server binary.
//!
//! Loads configuration, opens the selected backend, binds the listener and
//! serves until a client sends `QUIT`, a backend requests shutdown, or the
//! operator interrupts the process.

use beamline_tcp::backends;
use beamline_tcp::config::Config;
use beamline_tcp::server::{Server, ShutdownHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.server.listen,
        backend = ?config.backend.kind,
        mode = ?config.server.mode,
        workers = ?config.workers,
        "Starting beamline-tcp server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    let runtime = builder.build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = backends::build(&config.backend);

    let server = match Server::bind(&config.server, dispatcher.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            dispatcher.close();
            return Err(e.into());
        }
    };

    tokio::spawn(shutdown_on_signal(server.shutdown_handle()));

    server.run().await?;
    info!("Server stopped");
    Ok(())
}

/// Trigger shutdown on Ctrl-C.
async fn shutdown_on_signal(shutdown: ShutdownHandle) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.shutdown();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        },
        _ = shutdown.cancelled() => {}
    }
}
