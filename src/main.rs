//! Tool Runtime Server Entry Point
//!
//! Initializes logging, loads configuration, performs the initial load of
//! the descriptor store, starts hot reload and serves the configured
//! transport until it ends or Ctrl-C is received.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tool_runtime_server::core::{Config, McpServer, TransportService};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_logging(&config.logging.level, config.logging.with_timestamps);

    info!("Starting {} v{}", config.server.name, config.server.version);

    let server = McpServer::new(config.clone()).context("failed to build tool runtime")?;

    // A missing store is not fatal: the reload loop keeps trying.
    if let Err(e) = server.runtime().load().await {
        warn!("Initial load failed, starting with an empty registry: {}", e);
    }

    let shutdown = CancellationToken::new();
    let reload = server.runtime().spawn_reload(shutdown.child_token());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
        });
    }

    let transport = TransportService::new(config.transport);
    let served = transport.run(server, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = reload.await {
        warn!("Reload task ended abnormally: {}", e);
    }
    served?;

    info!("Stopped");
    Ok(())
}

/// Route `tracing` output to stderr; stdout belongs to the STDIO transport.
///
/// `RUST_LOG` wins over `MCP_LOG_LEVEL` when both are set.
fn init_logging(level: &str, with_timestamps: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if with_timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
