//! pixelflood server binary.
//!
//! Loads configuration, binds the listener and serves until Ctrl-C.

use pixelflood::config::Config;
use pixelflood::{Framebuffer, Server};
use std::sync::Arc;
use tracing::{error, info};
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
        listen = %config.listen,
        width = config.width,
        height = config.height,
        max_connections = config.max_connections,
        max_line_length = config.max_line_length,
        "Starting pixelflood server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let framebuffer = Arc::new(Framebuffer::new(config.width, config.height)?);

    // Failing to bind is fatal
    let server = Server::bind(&config, framebuffer)?;
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                handle.stop();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let framebuffer = Arc::clone(server.framebuffer());
    server.run().await?;

    info!(
        width = framebuffer.width(),
        height = framebuffer.height(),
        "Server stopped"
    );
    Ok(())
}
