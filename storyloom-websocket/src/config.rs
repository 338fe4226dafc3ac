//! Sync server configuration.

use crate::error::{SyncServerError, SyncServerResult};
use std::net::SocketAddr;
use std::time::Duration;
use storyloom_collab::EngineConfig;
use storyloom_config::{ConfigService, ConfigValidator, Validate};

/// Sync server configuration.
///
/// Keys: `sync.bind_addr`, `sync.max_message_size`. The read idle timeout and
/// outbox size follow the engine's `heartbeat_window_ms` and `session_buffer`.
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Largest accepted text frame in bytes
    pub max_message_size: usize,
    /// A connection that sends nothing for this long is closed
    pub read_idle_timeout: Duration,
    /// Outbound messages buffered per connection
    pub session_buffer: usize,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            max_message_size: 1024 * 1024, // 1MB
            read_idle_timeout: engine.heartbeat_window,
            session_buffer: engine.session_buffer,
        }
    }
}

impl SyncServerConfig {
    /// Read from a loaded config service.
    pub fn from_service(config: &ConfigService, engine: &EngineConfig) -> SyncServerResult<Self> {
        let defaults = Self::default();
        let bind_addr = match config.get::<String>("sync.bind_addr") {
            Ok(addr) => addr
                .parse()
                .map_err(|e| SyncServerError::InvalidAddress(format!("{}: {}", addr, e)))?,
            Err(_) => defaults.bind_addr,
        };
        let server = Self {
            bind_addr,
            max_message_size: config.get_or("sync.max_message_size", defaults.max_message_size),
            read_idle_timeout: engine.heartbeat_window,
            session_buffer: engine.session_buffer,
        };
        server.validate()?;
        Ok(server)
    }
}

impl Validate for SyncServerConfig {
    fn validate(&self) -> storyloom_config::Result<()> {
        ConfigValidator::positive(self.max_message_size as u64, "sync.max_message_size")?;
        ConfigValidator::positive(self.session_buffer as u64, "session_buffer")?;
        ConfigValidator::positive(
            self.read_idle_timeout.as_millis() as u64,
            "heartbeat_window_ms",
        )
    }
}

/// Builder for [`SyncServerConfig`].
#[derive(Debug, Default)]
pub struct SyncServerBuilder {
    pub(crate) config: SyncServerConfig,
}

impl SyncServerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: SyncServerConfig) -> Self {
        Self { config }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the bind address from a string.
    pub fn bind(mut self, addr: &str) -> SyncServerResult<Self> {
        self.config.bind_addr = addr
            .parse()
            .map_err(|e| SyncServerError::InvalidAddress(format!("{}: {}", addr, e)))?;
        Ok(self)
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the read idle timeout.
    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_idle_timeout = timeout;
        self
    }

    /// Set the per-connection outbound buffer.
    pub fn session_buffer(mut self, size: usize) -> Self {
        self.config.session_buffer = size;
        self
    }

    /// Finish, validating the result.
    pub fn build(self) -> SyncServerResult<SyncServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
