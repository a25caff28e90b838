use std::path::PathBuf;

/// Runtime configuration, read once from the environment at startup.
/// Every knob has a local-first default so `raphael` starts with no
/// configuration at all.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: String,
    pub data_dir: PathBuf,

    pub auth_enabled: bool,
    pub admin_email: Option<String>,
    pub password_login_enabled: bool,
    pub secret_key_env: Option<String>,

    pub synchronous: Synchronous,
    pub busy_timeout_ms: u64,
    pub wal_autocheckpoint_pages: u32,

    pub broadcast_max_items: usize,
    pub broadcast_batch_size: usize,

    pub prune_batch_size: i64,
    pub prune_max_runtime_ms: u64,
    pub prune_interval_secs: u64,
}

/// SQLite `PRAGMA synchronous` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronous {
    Full,
    Normal,
    Off,
}

impl Synchronous {
    pub fn as_pragma(self) -> &'static str {
        match self {
            Synchronous::Full => "FULL",
            Synchronous::Normal => "NORMAL",
            Synchronous::Off => "OFF",
        }
    }

    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "full" => Synchronous::Full,
            "off" => Synchronous::Off,
            _ => Synchronous::Normal,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let db_path = env_string("RAPHAEL_DB_PATH", "./data/raphael.db");
        let data_dir = PathBuf::from(&db_path)
            .parent()
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            port: env_parse("PORT", 6274),
            db_path,
            data_dir,
            auth_enabled: env_bool("RAPHAEL_AUTH_ENABLED", false),
            admin_email: env_opt("RAPHAEL_ADMIN_EMAIL").map(|e| e.to_lowercase()),
            password_login_enabled: env_bool("RAPHAEL_PASSWORD_LOGIN_ENABLED", true),
            secret_key_env: env_opt("RAPHAEL_SECRET_KEY"),
            synchronous: Synchronous::parse(&env_string("RAPHAEL_SYNCHRONOUS", "normal")),
            busy_timeout_ms: env_parse("RAPHAEL_BUSY_TIMEOUT_MS", 5_000),
            wal_autocheckpoint_pages: env_parse("RAPHAEL_WAL_AUTOCHECKPOINT_PAGES", 1_000),
            broadcast_max_items: env_parse("RAPHAEL_BROADCAST_MAX_ITEMS", 500),
            broadcast_batch_size: env_parse("RAPHAEL_BROADCAST_BATCH_SIZE", 200),
            prune_batch_size: env_parse("RAPHAEL_PRUNE_BATCH_SIZE", 5_000),
            prune_max_runtime_ms: env_parse("RAPHAEL_PRUNE_MAX_RUNTIME_MS", 250),
            prune_interval_secs: env_parse("RAPHAEL_PRUNE_INTERVAL_SECS", 60),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 6274,
            db_path: "./data/raphael.db".to_string(),
            data_dir: PathBuf::from("./data"),
            auth_enabled: false,
            admin_email: None,
            password_login_enabled: true,
            secret_key_env: None,
            synchronous: Synchronous::Normal,
            busy_timeout_ms: 5_000,
            wal_autocheckpoint_pages: 1_000,
            broadcast_max_items: 500,
            broadcast_batch_size: 200,
            prune_batch_size: 5_000,
            prune_max_runtime_ms: 250,
            prune_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_parses_known_levels() {
        assert_eq!(Synchronous::parse("FULL"), Synchronous::Full);
        assert_eq!(Synchronous::parse("off"), Synchronous::Off);
        assert_eq!(Synchronous::parse("normal"), Synchronous::Normal);
        assert_eq!(Synchronous::parse("garbage"), Synchronous::Normal);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 6274);
        assert_eq!(cfg.broadcast_max_items, 500);
        assert_eq!(cfg.broadcast_batch_size, 200);
        assert_eq!(cfg.prune_batch_size, 5_000);
        assert_eq!(cfg.prune_max_runtime_ms, 250);
    }
}
