//! Worker configuration.
//!
//! All tunables live in one immutable struct handed to each worker at
//! construction time. Nothing reads ambient globals; the environment is
//! consulted exactly once, in [`Config::apply_env`], for the secrets that
//! should not sit in a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Local storage settings.
    pub storage: StorageConfig,
    /// Remote API settings.
    pub api: ApiConfig,
    /// Sync orchestrator settings.
    pub sync: SyncConfig,
    /// Backfill engine settings.
    pub backfill: BackfillConfig,
    /// Archival engine settings.
    pub archive: ArchiveConfig,
    /// Sites to process. Empty means discover from the remote API.
    #[serde(default)]
    pub sites: Vec<String>,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Overlay secrets and endpoint overrides from the environment.
    ///
    /// `VITALS_API_TOKEN` and `VITALS_API_BASE` take precedence over the
    /// file so tokens never have to be written to disk.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("VITALS_API_TOKEN") {
            if !token.is_empty() {
                self.api.token = token;
            }
        }
        if let Ok(base) = std::env::var("VITALS_API_BASE") {
            if !base.is_empty() {
                self.api.base_url = base;
            }
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.api.validate());
        errors.extend(self.sync.validate());
        errors.extend(self.backfill.validate());
        errors.extend(self.archive.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let parts: Vec<&str> = self.bind.rsplitn(2, ':').collect();
        if parts.len() != 2 || parts[0].parse::<u16>().map_or(true, |p| p == 0) {
            errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: format!("invalid bind address '{}': expected 'host:port'", self.bind),
            });
        }

        errors
    }
}

/// Local storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Hot store database path.
    pub db_path: PathBuf,
    /// Cold storage root directory.
    pub cold_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/vitals.db"),
            cold_root: PathBuf::from("data/cold"),
        }
    }
}

/// Remote API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API base URL.
    pub base_url: String,
    /// Bearer token. Usually supplied via `VITALS_API_TOKEN`.
    #[serde(skip_serializing)]
    pub token: String,
    /// Samples per page requested from the paginated endpoint.
    pub page_size: usize,
    /// Largest point-name filter sent on the wire.
    pub point_chunk_size: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://flightdeck.aceiot.cloud/api".to_string(),
            token: String::new(),
            page_size: 5000,
            point_chunk_size: 400,
            request_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.base_url.is_empty() {
            errors.push(ValidationError {
                field: "api.base_url".to_string(),
                message: "base URL cannot be empty".to_string(),
            });
        }
        if self.page_size == 0 {
            errors.push(ValidationError {
                field: "api.page_size".to_string(),
                message: "page size must be at least 1".to_string(),
            });
        }

        errors
    }
}

/// Sync orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Cap on one sync window's length, in minutes.
    pub window_cap_minutes: u64,
    /// Overlap subtracted from the last cursor when deriving the next
    /// window's lower bound, in seconds.
    pub lookback_buffer_secs: u64,
    /// Window for a site that has never synced, in hours.
    pub first_run_lookback_hours: u64,
    /// Most sites processed in one invocation.
    pub max_sites_per_run: usize,
    /// Most pages fetched per site per window.
    pub max_pages_per_window: usize,
    /// Freshness lag at or under which a site needs no work, in seconds.
    pub target_lag_secs: i64,
    /// Freshness lag beyond which a site jumps the selection queue, in
    /// seconds.
    pub urgent_lag_secs: i64,
    /// Most extra catch-up cycles after the first.
    pub catchup_max_cycles: u32,
    /// Wall-clock budget for the catch-up loop, in seconds.
    pub catchup_budget_secs: u64,
    /// Run lock TTL, in seconds.
    pub lock_ttl_secs: u64,
    /// Rows per upsert statement batch.
    pub upsert_batch_size: usize,
    /// Optional point-name filter applied to fetched windows. Empty means
    /// all points.
    #[serde(default)]
    pub point_names: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_cap_minutes: 30,
            lookback_buffer_secs: 300,
            first_run_lookback_hours: 24,
            max_sites_per_run: 6,
            max_pages_per_window: 100,
            target_lag_secs: 90,
            urgent_lag_secs: 600,
            catchup_max_cycles: 3,
            catchup_budget_secs: 90,
            lock_ttl_secs: 120,
            upsert_batch_size: 250,
            point_names: Vec::new(),
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.window_cap_minutes == 0 {
            errors.push(ValidationError {
                field: "sync.window_cap_minutes".to_string(),
                message: "window cap must be at least 1 minute".to_string(),
            });
        }
        if self.max_sites_per_run == 0 {
            errors.push(ValidationError {
                field: "sync.max_sites_per_run".to_string(),
                message: "site cap must be at least 1".to_string(),
            });
        }
        if self.urgent_lag_secs < self.target_lag_secs {
            errors.push(ValidationError {
                field: "sync.urgent_lag_secs".to_string(),
                message: "urgent threshold cannot be below the target lag".to_string(),
            });
        }

        errors
    }
}

/// Backfill engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Pages processed per trigger invocation.
    pub pages_per_run: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { pages_per_run: 5 }
    }
}

impl BackfillConfig {
    fn validate(&self) -> Vec<ValidationError> {
        if self.pages_per_run == 0 {
            vec![ValidationError {
                field: "backfill.pages_per_run".to_string(),
                message: "pages per run must be at least 1".to_string(),
            }]
        } else {
            Vec::new()
        }
    }
}

/// Archival engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Rows stay hot for this many days.
    pub retention_days: u64,
    /// Rows fetched from the hot store per page while draining a partition.
    pub fetch_batch_size: usize,
    /// Upload retry attempt cap.
    pub upload_max_retries: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            fetch_batch_size: 5000,
            upload_max_retries: 4,
        }
    }
}

impl ArchiveConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.retention_days == 0 {
            errors.push(ValidationError {
                field: "archive.retention_days".to_string(),
                message: "retention must be at least 1 day".to_string(),
            });
        }
        if self.fetch_batch_size == 0 {
            errors.push(ValidationError {
                field: "archive.fetch_batch_size".to_string(),
                message: "fetch batch size must be at least 1".to_string(),
            });
        }

        errors
    }
}

/// A single validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Dotted field path.
    pub field: String,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the config file.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// One or more fields failed validation.
    #[error("Invalid configuration: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Validation(Vec<ValidationError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let mut config = Config::default();
        config.server.bind = "nonsense".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = Config::default();
        config.sync.max_sites_per_run = 0;
        config.backfill.pages_per_run = 0;
        config.archive.retention_days = 0;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_urgent_below_target() {
        let mut config = Config::default();
        config.sync.target_lag_secs = 600;
        config.sync.urgent_lag_secs = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vitals.toml");
        std::fs::write(
            &path,
            r#"
            sites = ["hq", "annex"]

            [server]
            bind = "0.0.0.0:9090"

            [sync]
            window_cap_minutes = 10
            max_sites_per_run = 2

            [archive]
            retention_days = 14
            "#,
        )
        .unwrap();

        let config = Config::load_validated(&path).unwrap();
        assert_eq!(config.sites, vec!["hq", "annex"]);
        assert_eq!(config.server.bind, "0.0.0.0:9090");
        assert_eq!(config.sync.window_cap_minutes, 10);
        assert_eq!(config.sync.max_sites_per_run, 2);
        assert_eq!(config.archive.retention_days, 14);
        // Unspecified sections keep their defaults.
        assert_eq!(config.backfill.pages_per_run, 5);
    }

    #[test]
    fn test_token_is_not_serialized() {
        let mut config = Config::default();
        config.api.token = "secret".to_string();
        let out = toml::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }
}
