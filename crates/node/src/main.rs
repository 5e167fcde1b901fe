mod bridge;
mod store;

use anyhow::Context;
use bridge::Bridge;
use clap::Parser;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::Arc};
use store::BlockStore;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "hive-node", version, about = "chunkhive storage peer agent")]
struct Args {
    /// Coordinator swarm endpoint.
    #[arg(long, default_value = "ws://localhost:3002")]
    coordinator_url: String,

    #[arg(long, default_value = "./node-data")]
    storage_path: PathBuf,

    /// Storage allocated to the swarm, in whole gigabytes.
    #[arg(long, default_value_t = 50)]
    max_gb: u64,

    #[arg(long)]
    credentials_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Credentials {
    user_id: i64,
    peer_secret: String,
}

/// Stable identity for this node: generated once, persisted beside the
/// block store, and presented on every auth thereafter.
fn load_or_create_credentials(path: &PathBuf) -> anyhow::Result<Credentials> {
    if path.exists() {
        let raw = fs::read_to_string(path).context("failed to read credentials file")?;
        let creds: Credentials =
            serde_json::from_str(&raw).context("invalid credentials file")?;
        return Ok(creds);
    }

    let mut rng = rand::thread_rng();
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    let creds = Credentials {
        user_id: rng.gen_range(1_000_000..10_000_000),
        peer_secret: hex::encode(secret),
    };
    fs::write(path, serde_json::to_string_pretty(&creds)?)
        .context("failed to persist credentials")?;
    info!("generated new node credentials at {}", path.display());
    Ok(creds)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    fs::create_dir_all(&args.storage_path)?;

    let credentials_path = args
        .credentials_path
        .unwrap_or_else(|| args.storage_path.join("credentials.json"));
    let credentials = load_or_create_credentials(&credentials_path)?;
    info!("node starting as user {}", credentials.user_id);

    let store = Arc::new(BlockStore::open(
        &args.storage_path.join("blocks"),
        args.max_gb,
    )?);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    let bridge = Bridge {
        url: args.coordinator_url,
        user_id: credentials.user_id,
        peer_secret: credentials.peer_secret,
        store,
    };
    bridge.run(shutdown_rx).await
}
