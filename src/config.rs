//! Environment-driven configuration.
//!
//! `from_env` reads the process environment (after `.env` has been loaded by
//! the binary); `from_vars` takes an explicit map so tests do not touch the
//! global environment.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 3000;

/// Interval between WebSocket pings on each relay connection.
pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 30;

/// Bound on both the WebSocket connect and the `create` round-trip.
pub const DEFAULT_SIGNALING_TIMEOUT_SECONDS: u64 = 10;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000/ws";

pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.services.mozilla.com",
    "stun:stun.l.google.com:19302",
];

/// Allowed cross-origin callers of the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub cors_origins: CorsOrigins,
    /// Directory served as static assets; nothing is served when unset.
    pub static_dir: Option<PathBuf>,
    pub ping_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let port = parse_or(vars, "PORT", DEFAULT_PORT)?;

        let cors_origins = match vars.get("CORS_ORIGINS").map(|v| v.trim()) {
            None | Some("") | Some("*") => CorsOrigins::Any,
            Some(list) => CorsOrigins::List(split_list(list)),
        };

        let static_dir = vars
            .get("STATIC_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let ping_seconds = parse_or(vars, "PING_INTERVAL_SECONDS", DEFAULT_PING_INTERVAL_SECONDS)?;
        if ping_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PING_INTERVAL_SECONDS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bind_address,
            port,
            cors_origins,
            static_dir,
            ping_interval: Duration::from_secs(ping_seconds),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .trim()
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                name: "BIND_ADDRESS",
                reason: format!("'{}': {e}", self.bind_address),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Client-side signaling configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub create_timeout: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_SIGNALING_TIMEOUT_SECONDS),
            create_timeout: Duration::from_secs(DEFAULT_SIGNALING_TIMEOUT_SECONDS),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = vars
            .get("VOICE_SERVER_URL")
            .map(|url| websocket_url(url))
            .unwrap_or(defaults.server_url);

        let connect_timeout = parse_or(
            vars,
            "CONNECT_TIMEOUT_SECONDS",
            DEFAULT_SIGNALING_TIMEOUT_SECONDS,
        )?;
        let create_timeout = parse_or(
            vars,
            "CREATE_TIMEOUT_SECONDS",
            DEFAULT_SIGNALING_TIMEOUT_SECONDS,
        )?;

        let ice_servers = match vars.get("ICE_SERVERS") {
            Some(list) if !list.trim().is_empty() => split_list(list),
            _ => defaults.ice_servers,
        };

        Ok(Self {
            server_url,
            connect_timeout: Duration::from_secs(connect_timeout),
            create_timeout: Duration::from_secs(create_timeout),
            ice_servers,
        })
    }
}

/// Turns an `http(s)://host` deployment URL into the relay's WebSocket
/// endpoint. URLs that already use a `ws` scheme are kept as given.
fn websocket_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return url.to_string();
    }
    let base = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{url}")
    };
    format!("{base}/ws")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_or<T>(vars: &HashMap<String, String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
