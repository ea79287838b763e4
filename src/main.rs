//! DWC Relay Server
//!
//! Runs the matchmaking and presence services side by side until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dwc_relay::{
    gpcm::ProfileDirectory, Config, MatchmakingServer, MemoryDirectory, PresenceServer, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("DWC Relay v{}", VERSION);

    let config = Config::from_env();

    let directory: Arc<dyn ProfileDirectory> = match &config.presence.profiles_path {
        Some(path) => Arc::new(
            MemoryDirectory::from_json_file(path)
                .with_context(|| format!("Failed to load profiles from {}", path.display()))?,
        ),
        None => {
            info!("No profile seed configured; starting with an empty directory");
            Arc::new(MemoryDirectory::new())
        }
    };

    let matchmaking = Arc::new(
        MatchmakingServer::bind(config.matchmaking.clone())
            .await
            .context("Failed to start matchmaking server")?,
    );
    let presence = Arc::new(
        PresenceServer::bind(config.presence.clone(), directory)
            .await
            .context("Failed to start presence server")?,
    );

    let matchmaking_handle = {
        let server = matchmaking.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Matchmaking server stopped: {}", e);
            }
        })
    };
    let presence_handle = {
        let server = presence.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Presence server stopped: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    matchmaking.shutdown();
    presence.shutdown();
    let _ = tokio::join!(matchmaking_handle, presence_handle);

    Ok(())
}
