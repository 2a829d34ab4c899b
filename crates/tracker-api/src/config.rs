//! # API Configuration
//!
//! Environment-based configuration for the tracker API service. Backend
//! credentials are only ever read from the environment and held as secrets.

use std::env;
use std::net::SocketAddr;

use secrecy::SecretString;
use tracker_core::{TrackerConfig, TrackerError};

/// Owner scope used by the in-memory backend when none is configured
const LOCAL_OWNER: &str = "local";

/// API server configuration
#[derive(Debug)]
pub struct Config {
    /// Server bind address
    pub server_addr: SocketAddr,

    /// Enable GraphQL Playground
    pub enable_playground: bool,

    /// Maximum query depth
    pub max_query_depth: usize,

    /// Maximum query complexity
    pub max_query_complexity: usize,

    /// Logging level
    pub log_level: String,

    /// CORS allowed origins, `*` for any
    pub cors_origins: Vec<String>,

    /// Owner whose devices this instance tracks
    pub owner_id: String,

    /// Where device state comes from
    pub backend: BackendConfig,

    /// Reconciliation and alerting knobs
    pub tracker: TrackerConfig,
}

/// Backend selection
#[derive(Debug)]
pub enum BackendConfig {
    /// In-process store, for local runs and demos
    Memory,
    /// Hosted REST store
    Rest { url: String, api_key: SecretString },
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Config`] for an unparsable address, an unknown
    /// backend kind, or a REST backend without URL, key or owner.
    pub fn from_env() -> Result<Self, TrackerError> {
        Self::from_lookup(|key| env::var(key).ok(), TrackerConfig::from_env()?)
    }

    /// Build from any key lookup
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        tracker: TrackerConfig,
    ) -> Result<Self, TrackerError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str, default: bool| {
            var(key).map_or(default, |v| v == "true" || v == "1")
        };

        let raw_addr = var("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let server_addr = raw_addr
            .parse()
            .map_err(|_| TrackerError::Config(format!("invalid SERVER_ADDR: {raw_addr:?}")))?;

        let backend = match var("TRACKER_BACKEND").as_deref().unwrap_or("memory") {
            "memory" => BackendConfig::Memory,
            "rest" => BackendConfig::Rest {
                url: var("BACKEND_URL").ok_or_else(|| missing("BACKEND_URL"))?,
                api_key: SecretString::from(
                    var("BACKEND_API_KEY").ok_or_else(|| missing("BACKEND_API_KEY"))?,
                ),
            },
            other => {
                return Err(TrackerError::Config(format!(
                    "unknown TRACKER_BACKEND {other:?}, expected rest or memory"
                )));
            }
        };

        let owner_id = match (&backend, var("OWNER_ID")) {
            (_, Some(owner)) => owner,
            (BackendConfig::Memory, None) => LOCAL_OWNER.to_string(),
            (BackendConfig::Rest { .. }, None) => return Err(missing("OWNER_ID")),
        };

        Ok(Self {
            server_addr,
            enable_playground: flag("ENABLE_PLAYGROUND", true),
            max_query_depth: var("MAX_QUERY_DEPTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_query_complexity: var("MAX_QUERY_COMPLEXITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            cors_origins: var("CORS_ORIGINS")
                .unwrap_or_else(|| "*".to_string())
                .split(',')
                .map(|o| o.trim().to_string())
                .collect(),
            owner_id,
            backend,
            tracker,
        })
    }
}

fn missing(key: &str) -> TrackerError {
    TrackerError::Config(format!("{key} is required for the rest backend"))
}
