//! The shepherd is the long-lived process that owns PTY sessions, so the
//! user-facing server can restart without killing them. It serves the framed
//! protocol over a Unix socket under the data directory.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::DataPaths;

pub mod client;
pub mod daemon;

pub use client::ShepherdClient;

const SPAWN_POLL_ATTEMPTS: u32 = 40;
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// A ping bounded by a deadline, so a wedged socket cannot stall startup.
async fn ping_with_timeout(client: &ShepherdClient) -> bool {
    matches!(
        tokio::time::timeout(PING_TIMEOUT, client.ping()).await,
        Ok(Ok(()))
    )
}

/// Connect to a running shepherd, or launch one and wait for it to answer.
/// Returns an error when no shepherd could be reached within the poll window;
/// callers fall back to the in-process manager.
pub async fn connect_or_spawn(paths: &DataPaths) -> Result<ShepherdClient> {
    let socket = paths.shepherd_socket();

    if let Ok(client) = ShepherdClient::connect(&socket).await {
        if ping_with_timeout(&client).await {
            info!("connected to existing shepherd");
            return Ok(client);
        }
        client.close().await;
    }

    info!("starting shepherd process");
    let exe = std::env::current_exe().context("resolve own executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("shepherd");
    // Detach into its own session so it survives this process.
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    cmd.spawn().context("spawn shepherd")?;

    for _ in 0..SPAWN_POLL_ATTEMPTS {
        tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
        if let Ok(client) = ShepherdClient::connect(&socket).await {
            if ping_with_timeout(&client).await {
                info!("shepherd started and connected");
                return Ok(client);
            }
            client.close().await;
        }
    }

    anyhow::bail!("shepherd did not become available within 2s")
}
