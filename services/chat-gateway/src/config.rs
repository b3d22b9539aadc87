//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Session tokens may be supplied through `GATEWAY_TOKENS` (comma-separated)
//! so they need not live in the TOML file.

use common::Secret;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upstream::RoleSimulation;

/// Env var that replaces `pool.tokens` when set and non-blank.
const TOKENS_ENV: &str = "GATEWAY_TOKENS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Caller bearer tokens. Empty disables the access gate.
    #[serde(default)]
    pub access_tokens: Vec<Secret<String>>,
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub upstream: UpstreamConfig,
    /// Caller-facing model name → upstream bot id. Built-in table when absent.
    #[serde(default)]
    pub bot: Option<BTreeMap<String, String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub tokens: Vec<Secret<String>>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub cool_down_secs: u64,
}

/// Upstream gateway settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub gateway_url: String,
    /// Longest allowed gap between streamed fragments.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Bound on a whole blocking exchange.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 0 disabled, 1 enabled, 2 auto.
    #[serde(default = "default_simulate_roles")]
    pub simulate_roles: u8,
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_concurrency() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    120
}

fn default_simulate_roles() -> u8 {
    2
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.pool.tokens = non_blank(&config.pool.tokens);
        config.access_tokens = non_blank(&config.access_tokens);

        if let Ok(raw) = std::env::var(TOKENS_ENV) {
            let tokens = parse_token_list(&raw);
            if !tokens.is_empty() {
                config.pool.tokens = tokens;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = &self.upstream.gateway_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(common::Error::invalid(
                "upstream.gateway_url",
                format!("must start with http:// or https://, got: {url}"),
            ));
        }
        if self.upstream.idle_timeout_secs == 0 {
            return Err(common::Error::invalid(
                "upstream.idle_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.upstream.request_timeout_secs == 0 {
            return Err(common::Error::invalid(
                "upstream.request_timeout_secs",
                "must be greater than 0",
            ));
        }
        if RoleSimulation::from_level(self.upstream.simulate_roles).is_none() {
            return Err(common::Error::invalid(
                "upstream.simulate_roles",
                format!("must be 0, 1 or 2, got: {}", self.upstream.simulate_roles),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }
        if self.pool.max_concurrency == 0 {
            return Err(common::Error::invalid(
                "pool.max_concurrency",
                "must be greater than 0",
            ));
        }
        if self.pool.tokens.is_empty() {
            return Err(common::Error::Config(format!(
                "no session tokens configured (set pool.tokens or {TOKENS_ENV})"
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.pool.cool_down_secs)
    }

    pub fn role_simulation(&self) -> RoleSimulation {
        RoleSimulation::from_level(self.upstream.simulate_roles).unwrap_or_default()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-gateway.toml")
    }
}

fn parse_token_list(raw: &str) -> Vec<Secret<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| Secret::new(t.to_string()))
        .collect()
}

/// Trimmed copies of the non-blank tokens.
fn non_blank(tokens: &[Secret<String>]) -> Vec<Secret<String>> {
    tokens
        .iter()
        .map(|t| t.expose().trim())
        .filter(|t| !t.is_empty())
        .map(|t| Secret::new(t.to_string()))
        .collect()
}
