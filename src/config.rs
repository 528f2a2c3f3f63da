//! Configuration management for Ratekeeper.
//!
//! Settings come from the process environment, optionally layered over a
//! `KEY=VALUE` env file, or from a YAML file with `server`, `limits` and
//! `redis` sections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::LimiterConfig;

/// Env file read when no explicit path is given.
pub const DEFAULT_ENV_FILE: &str = "config.env";

const IP_LIMIT_VAR: &str = "DEFAULT_IP_LIMIT";
const IP_BLOCK_DURATION_VAR: &str = "DEFAULT_IP_BLOCK_DURATION";
const TOKEN_LIMIT_VAR: &str = "DEFAULT_TOKEN_LIMIT";
const TOKEN_BLOCK_DURATION_VAR: &str = "DEFAULT_TOKEN_BLOCK_DURATION";
const REDIS_HOST_VAR: &str = "REDIS_HOST";
const REDIS_PORT_VAR: &str = "REDIS_PORT";
const REDIS_PASSWORD_VAR: &str = "REDIS_PASSWORD";
const REDIS_DB_VAR: &str = "REDIS_DB";
const SERVER_PORT_VAR: &str = "SERVER_PORT";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limit thresholds
    #[serde(default)]
    pub limits: LimiterConfig,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the listener to
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP` when present
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,

    /// Upper bound on one rate limit decision, in milliseconds
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_server_port(),
            trust_proxy_headers: default_trust_proxy_headers(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Socket address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Deadline for a single rate limit decision.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_server_port() -> u16 {
    8080
}

fn default_trust_proxy_headers() -> bool {
    true
}

fn default_check_timeout_ms() -> u64 {
    2000
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Empty means no authentication
    #[serde(default)]
    pub password: String,

    /// Database index
    #[serde(default)]
    pub db: i64,

    /// Per-command deadline in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_command_timeout_ms() -> u64 {
    1000
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from the environment, layered over an env file.
    ///
    /// An explicitly given env file must exist; otherwise [`DEFAULT_ENV_FILE`]
    /// is read when present. Process environment variables win over the file.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let file = match env_file {
            Some(path) => File::from(path).format(FileFormat::Ini).required(true),
            None => File::new(DEFAULT_ENV_FILE, FileFormat::Ini).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::default())
            .build()
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;

        Self::from_settings(&settings)
    }

    /// Build the configuration from already assembled settings.
    ///
    /// Limit and block duration values that are missing or not a
    /// non-negative integer become `0`. A zero limit blocks from the first
    /// request on, so a typo in these variables is effectively a lockout.
    /// Ports must parse when present.
    pub fn from_settings(settings: &Config) -> Result<Self> {
        let limits = LimiterConfig {
            ip_limit: int_or_zero(settings, IP_LIMIT_VAR),
            ip_block_duration_secs: int_or_zero(settings, IP_BLOCK_DURATION_VAR),
            token_limit: int_or_zero(settings, TOKEN_LIMIT_VAR),
            token_block_duration_secs: int_or_zero(settings, TOKEN_BLOCK_DURATION_VAR),
        };

        let redis_defaults = RedisConfig::default();
        let redis = RedisConfig {
            host: lookup(settings, REDIS_HOST_VAR)
                .filter(|host| !host.is_empty())
                .unwrap_or(redis_defaults.host),
            port: parse_port(settings, REDIS_PORT_VAR)?.unwrap_or(redis_defaults.port),
            password: lookup(settings, REDIS_PASSWORD_VAR).unwrap_or_default(),
            db: lookup(settings, REDIS_DB_VAR)
                .and_then(|db| db.parse().ok())
                .unwrap_or(0),
            command_timeout_ms: redis_defaults.command_timeout_ms,
        };

        let server = ServerConfig {
            port: parse_port(settings, SERVER_PORT_VAR)?.unwrap_or_else(default_server_port),
            ..ServerConfig::default()
        };

        debug!(
            ip_limit = limits.ip_limit,
            ip_block_duration_secs = limits.ip_block_duration_secs,
            token_limit = limits.token_limit,
            token_block_duration_secs = limits.token_block_duration_secs,
            "Limiter thresholds loaded"
        );

        Ok(Self {
            server,
            limits,
            redis,
        })
    }
}

fn lookup(settings: &Config, key: &str) -> Option<String> {
    settings.get_string(&key.to_lowercase()).ok()
}

fn int_or_zero(settings: &Config, key: &str) -> u64 {
    lookup(settings, key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn parse_port(settings: &Config, key: &str) -> Result<Option<u16>> {
    match lookup(settings, key).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| RatekeeperError::Config(format!("{} is not a valid port: {:?}", key, value))),
    }
}
