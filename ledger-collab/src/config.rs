//! Server and per-room configuration.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `LEDGER_BIND_ADDR` | `bind_addr` | `127.0.0.1:3000` |
//! | `PORT` | `bind_addr` as `0.0.0.0:<PORT>` | — |
//! | `LEDGER_RETENTION_SECS` | `retention` | 86400 |
//! | `LEDGER_SWEEP_INTERVAL_SECS` | `sweep_interval` | 3600 |
//! | `LEDGER_PRESENCE_WINDOW_SECS` | `presence_window` | 10 |
//! | `LEDGER_HISTORY_LIMIT` | `history_limit` | 500 |
//!
//! `LEDGER_BIND_ADDR` wins over `PORT` when both are set.

use std::str::FromStr;
use std::time::Duration;

use ledger_core::history::DEFAULT_LOG_LIMIT;
use ledger_core::presence::DEFAULT_ONLINE_WINDOW;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Settings handed to every room actor.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Pending commands buffered per room before senders wait
    pub command_queue_depth: usize,
    pub presence_window: Duration,
    pub history_limit: usize,
    /// Age after which an empty room is swept
    pub retention: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            command_queue_depth: 64,
            presence_window: DEFAULT_ONLINE_WINDOW,
            history_limit: DEFAULT_LOG_LIMIT,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub sweep_interval: Duration,
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:3000")
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            room: RoomConfig::default(),
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Unparseable values
    /// are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LEDGER_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LEDGER_RETENTION_SECS") {
            config.room.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LEDGER_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LEDGER_PRESENCE_WINDOW_SECS") {
            config.room.presence_window = Duration::from_secs(secs);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "LEDGER_HISTORY_LIMIT") {
            config.room.history_limit = limit;
        }
        config
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.room.retention = retention;
        self
    }

    pub fn with_presence_window(mut self, window: Duration) -> Self {
        self.room.presence_window = window;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.room.history_limit = limit;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.room.broadcast_capacity = capacity;
        self
    }

    pub fn with_command_queue_depth(mut self, depth: usize) -> Self {
        self.room.command_queue_depth = depth;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
