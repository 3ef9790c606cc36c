//! Configuration loading for mosaic-watch.
//!
//! Connection, identity and persistence fields are required. The `[engine]`
//! table is optional; any field left out keeps the engine default.

use chrono::{DateTime, Utc};
use mosaic_core::{EngineConfig, UserId};
use mosaic_storage::{
    FilterPersistence, InMemoryFilterPersistence, JsonFileFilterPersistence,
    LmdbFilterPersistence, UserContext,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ClientError;

pub const CONFIG_ENV: &str = "MOSAIC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    pub user_id: String,
    pub account_created_at: DateTime<Utc>,
    pub request_timeout_ms: u64,
    pub auth: AuthConfig,
    pub reconnect: ReconnectConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

/// Where filter criteria survive restarts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case", deny_unknown_fields)]
pub enum PersistenceConfig {
    Memory,
    Json { path: PathBuf },
    Lmdb { path: PathBuf, max_size_mb: usize },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    pub fetch_timeout_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub max_debounce_ms: Option<u64>,
    pub active_page_size: Option<u32>,
    pub trashed_page_sizes: Option<Vec<u32>>,
    pub default_trashed_page_size: Option<u32>,
    pub entry_ttl_ms: Option<u64>,
    pub invalidate_on_reconnect: Option<bool>,
    pub max_placements: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or {CONFIG_ENV})")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error(transparent)]
    Engine(#[from] mosaic_core::ConfigError),
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if reqwest::Url::parse(&self.api_base_url).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must be an absolute URL".to_string(),
            });
        }
        if !(self.ws_endpoint.starts_with("ws://") || self.ws_endpoint.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must use ws:// or wss://".to_string(),
            });
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "user_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.account_created_at > Utc::now() {
            return Err(ConfigError::InvalidValue {
                field: "account_created_at",
                reason: "must not be in the future".to_string(),
            });
        }
        if self.auth.api_key.is_none() && self.auth.jwt.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "auth",
                reason: "api_key or jwt must be provided".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        match &self.persistence {
            PersistenceConfig::Memory => {}
            PersistenceConfig::Json { path } | PersistenceConfig::Lmdb { path, .. }
                if path.as_os_str().is_empty() =>
            {
                return Err(ConfigError::InvalidValue {
                    field: "persistence.path",
                    reason: "must not be empty".to_string(),
                });
            }
            PersistenceConfig::Lmdb { max_size_mb: 0, .. } => {
                return Err(ConfigError::InvalidValue {
                    field: "persistence.max_size_mb",
                    reason: "must be > 0".to_string(),
                });
            }
            _ => {}
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.filter",
                reason: "must not be empty".to_string(),
            });
        }
        self.engine_config().validate()?;
        Ok(())
    }

    pub fn user(&self) -> UserContext {
        UserContext::new(UserId::new(self.user_id.trim()), self.account_created_at)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Engine defaults overlaid with the `[engine]` table.
    pub fn engine_config(&self) -> EngineConfig {
        let section = &self.engine;
        let mut config = EngineConfig::default();
        if let Some(ms) = section.fetch_timeout_ms {
            config = config.with_fetch_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = section.debounce_ms {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        if let Some(ms) = section.max_debounce_ms {
            config = config.with_max_debounce(Duration::from_millis(ms));
        }
        if let Some(size) = section.active_page_size {
            config = config.with_active_page_size(size);
        }
        if section.trashed_page_sizes.is_some() || section.default_trashed_page_size.is_some() {
            let sizes = section
                .trashed_page_sizes
                .clone()
                .unwrap_or_else(|| config.trashed_page_sizes.clone());
            let default = section
                .default_trashed_page_size
                .unwrap_or(config.default_trashed_page_size);
            config = config.with_trashed_page_sizes(sizes, default);
        }
        if let Some(ms) = section.entry_ttl_ms {
            config = config.with_ttl(Duration::from_millis(ms));
        }
        if let Some(enabled) = section.invalidate_on_reconnect {
            config = config.with_invalidate_on_reconnect(enabled);
        }
        if let Some(max) = section.max_placements {
            config = config.with_max_placements(max);
        }
        config
    }
}

impl PersistenceConfig {
    /// Open the configured backend.
    pub fn open(&self) -> Result<Box<dyn FilterPersistence>, ClientError> {
        let backend: Box<dyn FilterPersistence> = match self {
            PersistenceConfig::Memory => Box::new(InMemoryFilterPersistence::new()),
            PersistenceConfig::Json { path } => Box::new(JsonFileFilterPersistence::new(path)),
            PersistenceConfig::Lmdb { path, max_size_mb } => {
                std::fs::create_dir_all(path)?;
                Box::new(LmdbFilterPersistence::open(path, *max_size_mb)?)
            }
        };
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PersistenceConfig::Memory => "memory",
            PersistenceConfig::Json { .. } => "json",
            PersistenceConfig::Lmdb { .. } => "lmdb",
        }
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
