//! # jchat-server
//!
//! Chat server binary. Runs the blocking reactor loop on a dedicated thread
//! and stops it on Ctrl+C.

use jchat_server::{ChatServer, ServerConfig};
use jchat_shared::constants::APP_NAME;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,jchat_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Bind and initialize subsystems
    // -----------------------------------------------------------------------
    let server = ChatServer::bind(&config)?;
    let handle = server.handle();
    info!(
        addr = %server.local_addr(),
        workers = config.worker_threads,
        dispatchers = config.notify_threads,
        "Server bound"
    );

    // -----------------------------------------------------------------------
    // 4. Run the reactor (blocks a pool thread until shutdown)
    // -----------------------------------------------------------------------
    let mut reactor = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        result = &mut reactor => {
            if let Err(e) = result? {
                tracing::error!(error = %e, "Reactor failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            handle.shutdown();
            reactor.await??;
        }
    }

    info!("Shutdown complete");
    Ok(())
}
