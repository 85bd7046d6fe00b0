//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. explicit path (e.g. the daemon's `--config <path>` flag)
//! 2. `~/.muninn/config.toml` (user)
//! 3. `/etc/muninn/config.toml` (system)
//!
//! When no file is found the built-in defaults are used. Environment
//! variables are applied on top via [`Config::with_env_overrides`], so a
//! deployment can run from the environment alone.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::pool::{ApiConfig, DatabaseConfig, RetryMode};
use crate::warming::WarmingConfig;
use crate::{MuninnError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub warming: WarmingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Runtime and deployment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Deployment mode (default: "development"). Periodic warming only
    /// runs in "production".
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Upper bound on threads used for blocking cache, database and API work.
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            max_blocking_threads: default_max_blocking_threads(),
        }
    }
}

impl RuntimeConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_max_blocking_threads() -> usize {
    32
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, the user and system
    /// locations are tried in turn and the defaults are used if neither
    /// exists.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                info!("no config file found, using defaults");
                Ok(Config::default())
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MuninnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MuninnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MuninnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".muninn").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/muninn/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable numeric or boolean values are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.cache.redis_url = Some(url);
        }

        if let Some(host) = lookup("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = parse_var(&lookup, "DB_PORT") {
            self.database.port = port;
        }
        if let Some(name) = lookup("DB_NAME") {
            self.database.database = name;
        }
        if let Some(user) = lookup("DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(min) = parse_var(&lookup, "DB_POOL_MIN_CONNECTIONS") {
            self.database.min_connections = min;
        }
        if let Some(max) = parse_var(&lookup, "DB_POOL_MAX_CONNECTIONS") {
            self.database.max_connections = max;
        }

        if let Some(region) = lookup("AWS_REGION") {
            self.api.region = region;
        }
        if let Some(attempts) = parse_var(&lookup, "MUNINN_API_MAX_ATTEMPTS") {
            self.api.max_attempts = attempts;
        }
        if let Some(mode) = lookup("MUNINN_API_RETRY_MODE") {
            match mode.parse::<RetryMode>() {
                Ok(mode) => self.api.retry_mode = mode,
                Err(e) => warn!(value = %mode, error = %e, "ignoring MUNINN_API_RETRY_MODE"),
            }
        }
        if let Some(max) = parse_var(&lookup, "MUNINN_API_MAX_POOL_CONNECTIONS") {
            self.api.max_pool_connections = max;
        }
        if let Some(keepalive) = parse_var(&lookup, "MUNINN_API_KEEPALIVE") {
            self.api.tcp_keepalive = keepalive;
        }
        if let Some(key) = lookup("MUNINN_API_KEY") {
            self.api.api_key = Some(key);
        }
        if let Some(kb) = lookup("KNOWLEDGE_BASE_ID") {
            self.api.knowledge_base_id = Some(kb);
        }
        if let Some(model) = lookup("BEDROCK_MODEL_ID") {
            self.api.model_id = model;
        }

        if let Some(env) = lookup("ENVIRONMENT") {
            self.runtime.environment = env;
        }
        if let Some(secs) = parse_var(&lookup, "MUNINN_WARM_INTERVAL_SECS") {
            self.warming.interval_secs = secs;
        }

        self
    }

    /// Periodic warming interval when running in production, otherwise `None`.
    ///
    /// A zero interval disables periodic warming.
    pub fn periodic_warming(&self) -> Option<Duration> {
        if !self.runtime.is_production() {
            return None;
        }
        let every = self.warming.interval();
        if every.is_zero() {
            warn!("warming interval is zero, periodic warming disabled");
            return None;
        }
        Some(every)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(variable = name, value = %raw, error = %e, "ignoring unparseable override");
            None
        }
    }
}
