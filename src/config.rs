use std::env;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use anyhow::{Context, Result};

/// Origins allowed when `ALLOWED_ORIGINS` is absent or empty.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:8123"];

static SETTINGS: OnceLock<Arc<Settings>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub app_name: String,
    pub version: String,
    pub environment: String,
    pub log_level: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
    pub max_overflow: usize,
    pub pool_timeout: Duration,
}

/// Raw shape of the allowed-origins setting before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum OriginsInput<'a> {
    Absent,
    Delimited(&'a str),
    List(Vec<String>),
}

/// Returns the process-wide settings, loading them from the environment on first use.
///
/// Every call after the first successful one hands back the same `Arc`.
pub fn get_settings() -> Result<Arc<Settings>> {
    if let Some(settings) = SETTINGS.get() {
        return Ok(Arc::clone(settings));
    }

    let loaded = Arc::new(Settings::from_env()?);
    Ok(Arc::clone(SETTINGS.get_or_init(|| loaded)))
}

/// Normalizes the allowed-origins input.
///
/// Absent or empty input yields [`DEFAULT_ALLOWED_ORIGINS`]. A delimited string is
/// split on `,`, trimmed, and stripped of empty segments. A non-empty list passes through.
pub fn parse_allowed_origins(input: OriginsInput<'_>) -> Vec<String> {
    let origins = match input {
        OriginsInput::Absent => Vec::new(),
        OriginsInput::Delimited(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect(),
        OriginsInput::List(list) => list,
    };

    if origins.is_empty() {
        DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect()
    } else {
        origins
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = string_or("PORT", "8123")
            .parse::<u16>()
            .context("PORT must be a valid port number")?;

        let raw_origins = lookup("ALLOWED_ORIGINS");
        let allowed_origins = parse_allowed_origins(match raw_origins.as_deref() {
            Some(raw) => OriginsInput::Delimited(raw),
            None => OriginsInput::Absent,
        });

        let settings = Settings {
            app_name: string_or("APP_NAME", "Obsidian Agent Project"),
            version: string_or("VERSION", "0.1.0"),
            environment: string_or("ENVIRONMENT", "development"),
            log_level: string_or("LOG_LEVEL", "INFO"),
            api_prefix: string_or("API_PREFIX", "/api"),
            host: string_or("HOST", "0.0.0.0"),
            port,
            database: DatabaseConfig::from_lookup(&lookup)?,
            allowed_origins,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than 0");
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .context("DATABASE_URL environment variable is required")?;

        let pool_size = lookup("DATABASE_POOL_SIZE")
            .unwrap_or_else(|| "5".to_string())
            .parse::<usize>()
            .context("DATABASE_POOL_SIZE must be a valid number")?;

        let max_overflow = lookup("DATABASE_MAX_OVERFLOW")
            .unwrap_or_else(|| "10".to_string())
            .parse::<usize>()
            .context("DATABASE_MAX_OVERFLOW must be a valid number")?;

        let pool_timeout_secs = lookup("DATABASE_POOL_TIMEOUT_SECS")
            .unwrap_or_else(|| "30".to_string())
            .parse::<u64>()
            .context("DATABASE_POOL_TIMEOUT_SECS must be a valid number of seconds")?;

        Ok(DatabaseConfig {
            url,
            pool_size,
            max_overflow,
            pool_timeout: Duration::from_secs(pool_timeout_secs),
        })
    }

    /// Upper bound on pooled connections: the steady pool plus its overflow.
    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}
