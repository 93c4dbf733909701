//! API server configuration

use anyhow::Context;

/// Configuration loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Optional direct (non-pooler) URL used for migrations
    pub database_direct_url: Option<String>,
    pub bind_address: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
        })
    }
}
