//! Configuration module for the portsnap engine

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-user configuration file looked up in the home directory
pub const DEFAULT_CONFIG_FILE: &str = ".portsnap.toml";

/// Main configuration structure for a scan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers
    pub threads: usize,

    /// Per-host timeout handed to the probe, in seconds
    pub host_timeout: u64,

    /// Extra seconds allowed on top of the host timeout before the probe is killed
    pub timeout_grace: u64,

    /// Arguments for the primary (structured) probe
    pub primary_args: Vec<String>,

    /// Number of top ports probed by the fallback strategy
    pub fallback_top_ports: u16,

    /// Path to the nmap binary
    pub nmap_path: String,

    /// How many failing hosts the run summary lists
    pub failure_preview: usize,

    /// Only scan validators with at least this much activated stake (lamports)
    pub min_activated_stake: Option<u64>,

    /// Database connection settings
    pub database: DatabaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 20,
            host_timeout: 30,
            timeout_grace: 15,
            primary_args: vec!["-Pn".to_string(), "-F".to_string()],
            fallback_top_ports: 100,
            nmap_path: "nmap".to_string(),
            failure_preview: 10,
            min_activated_stake: None,
            database: DatabaseConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the number of workers
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the per-host timeout in seconds
    pub fn with_host_timeout(mut self, secs: u64) -> Self {
        self.host_timeout = secs;
        self
    }

    /// Set the fallback port count
    pub fn with_fallback_top_ports(mut self, n: u16) -> Self {
        self.fallback_top_ports = n;
        self
    }

    /// Set the nmap binary path
    pub fn with_nmap_path(mut self, path: impl Into<String>) -> Self {
        self.nmap_path = path.into();
        self
    }

    /// Set the activated stake filter
    pub fn with_min_activated_stake(mut self, lamports: Option<u64>) -> Self {
        self.min_activated_stake = lamports;
        self
    }

    /// Host timeout as Duration
    pub fn host_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.host_timeout)
    }

    /// Hard deadline for one probe subprocess
    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.host_timeout + self.timeout_grace)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    /// Load `~/.portsnap.toml` if present, otherwise defaults
    pub fn load_default_config() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            let config = Self::from_toml_file(&path)?;
            log::info!("Loaded config from {}", path.display());
            return Ok(config);
        }
        Ok(Self::default())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid(
                "thread count must be greater than 0".to_string(),
            ));
        }

        if self.host_timeout == 0 {
            return Err(ConfigError::Invalid(
                "host timeout must be at least one second".to_string(),
            ));
        }

        if self.fallback_top_ports == 0 {
            return Err(ConfigError::Invalid(
                "fallback must probe at least one port".to_string(),
            ));
        }

        if self.nmap_path.trim().is_empty() {
            return Err(ConfigError::Invalid("nmap path cannot be empty".to_string()));
        }

        Ok(())
    }
}

/// PostgreSQL connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL; wins over the individual fields when set
    pub url: Option<String>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Upper bound on pooled connections
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: "validator_timescale".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5433,
            max_connections: 10,
            acquire_timeout: 10,
        }
    }
}

impl DatabaseConfig {
    /// Overlay `DATABASE_URL` and `DB_*` environment variables
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.url = Some(url);
        }
        if let Some(name) = lookup("DB_NAME") {
            self.name = name;
        }
        if let Some(user) = lookup("DB_USER") {
            self.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.password = password;
        }
        if let Some(host) = lookup("DB_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("DB_PORT is not a port: {}", port)))?;
        }
        Ok(())
    }

    /// sqlx connection options.
    ///
    /// Individual fields go in as separate parameters, so credentials need no
    /// URL escaping. `url` is parsed as a whole when set.
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        match &self.url {
            Some(url) => url
                .trim()
                .parse::<PgConnectOptions>()
                .map_err(|e| ConfigError::Invalid(format!("invalid DATABASE_URL: {}", e))),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.name)),
        }
    }

    /// Host/port/database description without credentials, for logs
    pub fn describe(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.name),
        }
    }
}
