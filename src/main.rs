use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use raphael::config::AppConfig;
use raphael::hub::Hub;
use raphael::pruner::{self, PrunerConfig};
use raphael::secrets::Secrets;
use raphael::store::{Store, StoreOptions};
use raphael::{AppState, auth, handlers, usage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("raphael=debug,tower_http=debug")),
        )
        .init();

    let cfg = AppConfig::from_env();
    std::fs::create_dir_all(&cfg.data_dir)?;

    let secrets = Arc::new(Secrets::load(&cfg.data_dir, cfg.secret_key_env.as_deref())?);
    let store = Arc::new(Store::open(
        &cfg.db_path,
        &StoreOptions {
            synchronous: cfg.synchronous,
            busy_timeout_ms: cfg.busy_timeout_ms,
            wal_autocheckpoint_pages: cfg.wal_autocheckpoint_pages,
        },
    )?);
    tracing::info!("row store opened at {}", cfg.db_path);

    let usage = usage::spawn(store.clone());
    pruner::spawn_pruner(
        store.clone(),
        PrunerConfig {
            interval: Duration::from_secs(cfg.prune_interval_secs),
            batch_size: cfg.prune_batch_size,
            max_runtime: Duration::from_millis(cfg.prune_max_runtime_ms),
        },
    );

    let port = cfg.port;
    let state = AppState {
        cfg: Arc::new(cfg),
        store,
        hub: Arc::new(Hub::new()),
        sessions: Arc::new(auth::NoSessions),
        usage,
        secrets,
    };

    let app = handlers::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("raphael listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
