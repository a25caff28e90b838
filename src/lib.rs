pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod ingest;
pub mod migrations;
pub mod models;
pub mod pruner;
pub mod query_builder;
pub mod secrets;
pub mod store;
pub mod usage;

use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<config::AppConfig>,
    pub store: Arc<store::Store>,
    pub hub: Arc<hub::Hub>,
    pub sessions: Arc<dyn auth::SessionResolver>,
    pub usage: usage::UsageLogger,
    pub secrets: Arc<secrets::Secrets>,
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    test_state_with_config(config::AppConfig::default())
}

#[cfg(test)]
pub(crate) fn test_state_with_config(cfg: config::AppConfig) -> AppState {
    let (usage, _rx) = usage::test_logger();
    AppState {
        cfg: Arc::new(cfg),
        store: Arc::new(store::Store::open_in_memory().unwrap()),
        hub: Arc::new(hub::Hub::new()),
        sessions: Arc::new(auth::NoSessions),
        usage,
        secrets: Arc::new(secrets::Secrets::from_key([0u8; 32])),
    }
}
