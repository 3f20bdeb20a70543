//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Global request-body ceiling (§1 calls this out-of-scope for the
    /// pipeline proper, but the router still needs one).
    #[serde(default = "default_max_body_bytes")]
    pub max_request_body_bytes: usize,
}

/// Database configuration for the Client Store (component C).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_db_pool_max_size")]
    pub pool_max_size: u32,
}

/// Connection-admission configuration (components F, G, I).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// IP/CIDR allow-list (component F). Empty means "allow all".
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Optional static API keys (component I). Empty disables the
    /// secondary authenticator entirely.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Override for the compiled-in requests-per-minute default. The fixed
    /// constant in `latchkey_types::RPM` remains the default; this is
    /// validated the same way the rest of this config is (§10.K).
    #[serde(default)]
    pub rpm_override: Option<u64>,
    /// Override for the compiled-in burst default (`latchkey_types::BURST`).
    #[serde(default)]
    pub burst_override: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    8787
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_db_path() -> String {
    "latchkey.db".to_string()
}

fn default_db_busy_timeout_ms() -> u64 {
    5_000
}

fn default_db_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_db_busy_timeout_ms(),
            pool_max_size: default_db_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: &'static str, reason: String },
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

const MIN_DB_BUSY_TIMEOUT_MS: u64 = 1;
const MAX_DB_BUSY_TIMEOUT_MS: u64 = 60_000;
const MIN_DB_POOL_MAX_SIZE: u32 = 1;
const MAX_DB_POOL_MAX_SIZE: u32 = 64;
const MIN_RPM: u64 = 1;
const MAX_RPM: u64 = 100_000;
const MIN_BURST: u64 = 1;
const MAX_BURST: u64 = 10_000;

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if !(MIN_DB_BUSY_TIMEOUT_MS..=MAX_DB_BUSY_TIMEOUT_MS).contains(&config.database.busy_timeout_ms)
    {
        return Err(ConfigError::InvalidValue {
            field: "database.busy_timeout_ms",
            reason: format!(
                "must be in range {MIN_DB_BUSY_TIMEOUT_MS}..={MAX_DB_BUSY_TIMEOUT_MS}, got {}",
                config.database.busy_timeout_ms
            ),
        });
    }

    if !(MIN_DB_POOL_MAX_SIZE..=MAX_DB_POOL_MAX_SIZE).contains(&config.database.pool_max_size) {
        return Err(ConfigError::InvalidValue {
            field: "database.pool_max_size",
            reason: format!(
                "must be in range {MIN_DB_POOL_MAX_SIZE}..={MAX_DB_POOL_MAX_SIZE}, got {}",
                config.database.pool_max_size
            ),
        });
    }

    if let Some(rpm) = config.security.rpm_override {
        if !(MIN_RPM..=MAX_RPM).contains(&rpm) {
            return Err(ConfigError::InvalidValue {
                field: "security.rpm_override",
                reason: format!("must be in range {MIN_RPM}..={MAX_RPM}, got {rpm}"),
            });
        }
    }

    if let Some(burst) = config.security.burst_override {
        if !(MIN_BURST..=MAX_BURST).contains(&burst) {
            return Err(ConfigError::InvalidValue {
                field: "security.burst_override",
                reason: format!("must be in range {MIN_BURST}..={MAX_BURST}, got {burst}"),
            });
        }
    }

    Ok(())
}

fn parse_env_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw.parse::<T>().map_err(|err| ConfigError::InvalidEnvVar {
                name,
                reason: err.to_string(),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            let parsed = match normalized.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
            .ok_or_else(|| ConfigError::InvalidEnvVar {
                name,
                reason: format!("expected one of [true,false,1,0,yes,no,on,off], got '{raw}'"),
            })?;
            Ok(Some(parsed))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_env_csv(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `LATCHKEY_HOST` overrides `server.host`
/// - `LATCHKEY_PORT` overrides `server.port`
/// - `LATCHKEY_MAX_REQUEST_BODY_BYTES` overrides `server.max_request_body_bytes`
/// - `LATCHKEY_DB_PATH` overrides `database.path`
/// - `LATCHKEY_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `LATCHKEY_DB_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `LATCHKEY_ALLOWED_IPS` overrides `security.allowed_ips` (comma-separated)
/// - `LATCHKEY_API_KEYS` overrides `security.api_keys` (comma-separated)
/// - `LATCHKEY_RPM_OVERRIDE` overrides `security.rpm_override`
/// - `LATCHKEY_BURST_OVERRIDE` overrides `security.burst_override`
/// - `LATCHKEY_LOG_LEVEL` overrides `logging.level`
/// - `LATCHKEY_LOG_JSON` overrides `logging.json`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if an override fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(host) = parse_env_var("LATCHKEY_HOST")? {
        config.server.host = host;
    }
    if let Some(port) = parse_env_var("LATCHKEY_PORT")? {
        config.server.port = port;
    }
    if let Some(max_body) = parse_env_var("LATCHKEY_MAX_REQUEST_BODY_BYTES")? {
        config.server.max_request_body_bytes = max_body;
    }
    if let Some(db_path) = parse_env_var::<String>("LATCHKEY_DB_PATH")? {
        config.database.path = db_path;
    }
    if let Some(timeout) = parse_env_var("LATCHKEY_DB_BUSY_TIMEOUT_MS")? {
        config.database.busy_timeout_ms = timeout;
    }
    if let Some(max_size) = parse_env_var("LATCHKEY_DB_POOL_MAX_SIZE")? {
        config.database.pool_max_size = max_size;
    }
    if let Some(ips) = parse_env_csv("LATCHKEY_ALLOWED_IPS") {
        config.security.allowed_ips = ips;
    }
    if let Some(keys) = parse_env_csv("LATCHKEY_API_KEYS") {
        config.security.api_keys = keys;
    }
    if let Some(rpm) = parse_env_var("LATCHKEY_RPM_OVERRIDE")? {
        config.security.rpm_override = Some(rpm);
    }
    if let Some(burst) = parse_env_var("LATCHKEY_BURST_OVERRIDE")? {
        config.security.burst_override = Some(burst);
    }
    if let Some(level) = parse_env_var::<String>("LATCHKEY_LOG_LEVEL")? {
        config.logging.level = level;
    }
    if let Some(json) = parse_env_bool("LATCHKEY_LOG_JSON")? {
        config.logging.json = json;
    }

    validate_config(&config)?;

    Ok(config)
}
