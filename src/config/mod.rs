//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

use crate::ws::protocol::Region;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Deployment environment (development, production)
    pub app_env: String,

    /// Allowed client origins for CORS (comma-separated)
    pub client_url: String,
    /// Regions accepted by the connection gateway
    pub valid_regions: Vec<Region>,
    /// Maximum players placed into one match
    pub max_players_per_match: usize,

    /// Persistence endpoint for bug reports and daily rollups (optional)
    pub store_url: Option<String>,
    /// API key sent to the persistence endpoint
    pub store_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env::var("PORT").unwrap_or_else(|_| "3001".to_string());
        let server_addr = format!("0.0.0.0:{}", port);

        let valid_regions = env::var("VALID_REGIONS")
            .unwrap_or_else(|_| "NA,EU,ASIA".to_string())
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<Region>()
                    .map_err(|_| ConfigError::InvalidRegion(s.trim().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let max_players_per_match = match env::var("MAX_PLAYERS_PER_MATCH") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidMaxPlayers)?,
            Err(_) => 10,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),

            client_url: env::var("CLIENT_URL").unwrap_or_else(|_| "http://localhost:5173".to_string()),
            valid_regions,
            max_players_per_match,

            store_url: env::var("STORE_URL").ok(),
            store_api_key: env::var("STORE_API_KEY").ok(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Unknown region in VALID_REGIONS: {0}")]
    InvalidRegion(String),

    #[error("MAX_PLAYERS_PER_MATCH must be a positive integer")]
    InvalidMaxPlayers,
}
