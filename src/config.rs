use crate::cat::CatConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite:cat_engine.db?mode=rwc";

/// Process configuration for the service binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub database_url: String,
    pub cat: CatConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        Self {
            log_level,
            database_url,
            cat: CatConfig::from_env(),
        }
    }
}
