//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    BACKLOG_ENQUEUE_TIMEOUT_MS, DEFAULT_HTTP_PORT, HUB_COMMAND_CAPACITY, OUTBOUND_QUEUE_CAPACITY,
    PING_INTERVAL_SECS, READ_DEADLINE_SECS, WRITE_DEADLINE_SECS,
};

use crate::hub::HubConfig;
use crate::liveness::Liveness;
use crate::session::SessionConfig;

/// Where messages are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite(PathBuf),
    /// Process-local store; contents are lost on exit.
    Memory,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR` (or `PORT` to only change the port)
    /// Default: `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH` (`:memory:` selects the in-memory store)
    /// Default: `./courier.db`
    pub store: StoreBackend,

    /// CORS origin allowed to call the API.
    /// Env: `ALLOWED_ORIGIN`
    /// Default: `*`
    pub allowed_origin: String,

    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub outbound_queue_capacity: usize,

    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,

    /// Env: `READ_DEADLINE_SECS`
    pub read_deadline: Duration,

    /// Env: `WRITE_DEADLINE_SECS`
    pub write_deadline: Duration,

    /// Env: `BACKLOG_ENQUEUE_TIMEOUT_MS`
    pub backlog_enqueue_timeout: Duration,

    /// Env: `HUB_COMMAND_CAPACITY`
    pub hub_command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            store: StoreBackend::Sqlite(PathBuf::from("./courier.db")),
            allowed_origin: "*".to_string(),
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            read_deadline: Duration::from_secs(READ_DEADLINE_SECS),
            write_deadline: Duration::from_secs(WRITE_DEADLINE_SECS),
            backlog_enqueue_timeout: Duration::from_millis(BACKLOG_ENQUEUE_TIMEOUT_MS),
            hub_command_capacity: HUB_COMMAND_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            if let Some(port) = parse_or_warn::<u16>("PORT", &port) {
                config.http_addr.set_port(port);
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Some(addr) = parse_or_warn::<SocketAddr>("HTTP_ADDR", &addr) {
                config.http_addr = addr;
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            match path.trim() {
                "" => {}
                ":memory:" => config.store = StoreBackend::Memory,
                path => config.store = StoreBackend::Sqlite(PathBuf::from(path)),
            }
        }

        if let Some(origin) = lookup("ALLOWED_ORIGIN") {
            if !origin.trim().is_empty() {
                config.allowed_origin = origin.trim().to_string();
            }
        }

        if let Some(n) = positive::<usize>(&lookup, "OUTBOUND_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = n;
        }
        if let Some(n) = positive::<usize>(&lookup, "HUB_COMMAND_CAPACITY") {
            config.hub_command_capacity = n;
        }
        if let Some(secs) = positive::<u64>(&lookup, "PING_INTERVAL_SECS") {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = positive::<u64>(&lookup, "READ_DEADLINE_SECS") {
            config.read_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = positive::<u64>(&lookup, "WRITE_DEADLINE_SECS") {
            config.write_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = positive::<u64>(&lookup, "BACKLOG_ENQUEUE_TIMEOUT_MS") {
            config.backlog_enqueue_timeout = Duration::from_millis(ms);
        }

        if config.ping_interval >= config.read_deadline {
            tracing::warn!(
                ping_interval = ?config.ping_interval,
                read_deadline = ?config.read_deadline,
                "Ping interval is not shorter than the read deadline; quiet peers will be dropped"
            );
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.hub_command_capacity,
            backlog_timeout: self.backlog_enqueue_timeout,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.outbound_queue_capacity,
            liveness: Liveness {
                ping_interval: self.ping_interval,
                read_deadline: self.read_deadline,
                write_deadline: self.write_deadline,
            },
        }
    }
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

/// Parse a strictly positive number; zero falls back to the default.
fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialEq + Default,
{
    let value = lookup(key)?;
    let parsed = parse_or_warn::<T>(key, &value)?;
    if parsed == T::default() {
        tracing::warn!(key, "Zero is not allowed, using default");
        return None;
    }
    Some(parsed)
}
