//! GRIS PONG Game Server
//!
//! Matchmaking and authoritative Pong matches over WebSocket.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gris_pong::{
    network::{AuthConfig, MatchmakingConfig, SessionConfig},
    GameServer, MemoryStore, ServerConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let session_config = SessionConfig::from_env();
    let matchmaking_config = MatchmakingConfig::from_env();

    info!("GRIS PONG Server v{}", VERSION);
    info!(
        "Tick Rate: {} Hz, first to {}, reconnect grace {:?}",
        session_config.tick_rate, session_config.win_score, session_config.grace
    );

    let store = Arc::new(MemoryStore::new());
    match &config.users_file {
        Some(path) => {
            let loaded = store
                .load_users_file(path)
                .await
                .with_context(|| format!("loading users from {}", path.display()))?;
            info!("Loaded {} users from {}", loaded, path.display());
        }
        None => warn!("GRIS_USERS_FILE not set, starting with no users"),
    }

    let server = Arc::new(GameServer::new(
        config,
        AuthConfig::from_env(),
        session_config,
        matchmaking_config,
        store,
    ));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("game server failed")?;
    info!("Server stopped");
    Ok(())
}
