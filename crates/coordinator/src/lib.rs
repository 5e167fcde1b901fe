pub mod cache;
pub mod config;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod replication;
pub mod retrieval;
pub mod swarm;

use std::str::FromStr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::OverflowCache;
use crate::config::Config;
use crate::notify::AccountNotifier;
use crate::reconciler::Reconciler;
use crate::swarm::{SwarmCommand, SwarmHub};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub struct AppState {
    pub db: SqlitePool,
    pub hub_tx: mpsc::Sender<SwarmCommand>,
    pub cache: OverflowCache,
    pub notifier: AccountNotifier,
    pub jwt_secret: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/readyz", get(health_check))
        .route("/upload/init", post(handlers::upload::upload_init))
        .route("/upload/chunk", post(handlers::upload::upload_chunk))
        .route("/download/:file_id", get(handlers::files::download_manifest))
        .route("/files/user/:user_id", get(handlers::files::list_user_files))
        .route(
            "/files/user/:user_id/all",
            delete(handlers::files::delete_user_files),
        )
        .route("/files/:file_id", delete(handlers::files::delete_file))
        .layer(axum::extract::DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chunkhive-coordinator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Full coordinator startup: ledger, swarm transport, reconciler, HTTP API.
/// The only fatal-error surface in the process; everything past startup
/// degrades and logs instead of aborting.
pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(path) = config.database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    info!("connecting to ledger at {}...", config.database_url);
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    info!("ledger ready");

    let cache = OverflowCache::new(pool.clone());
    let notifier = AccountNotifier::new(
        config.account_service_url.clone(),
        config.internal_api_key.clone(),
    );

    let (hub_tx, hub_rx) = mpsc::channel(256);
    let swarm_listener = TcpListener::bind(config.swarm_addr).await?;
    let hub = SwarmHub::new(pool.clone(), cache.clone(), notifier.clone());
    tokio::spawn(async move {
        if let Err(e) = hub.run(swarm_listener, hub_rx).await {
            tracing::error!("fatal swarm transport crash: {}", e);
        }
    });

    let reconciler = Reconciler::new(pool.clone(), cache.clone(), hub_tx.clone());
    tokio::spawn(async move {
        reconciler.start().await;
    });

    let state = Arc::new(AppState {
        db: pool,
        hub_tx,
        cache,
        notifier,
        jwt_secret: config.jwt_secret.clone(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(config.http_addr).await?;
    info!("coordinator HTTP listening on {}", config.http_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
