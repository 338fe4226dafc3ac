//! Engine tuning knobs, loaded through `storyloom-config`.

use crate::persistence::RetryPolicy;
use crate::CollabResult;
use std::time::Duration;
use storyloom_config::{ConfigService, ConfigValidator, Validate};

/// Timing and sizing for document actors and sessions.
///
/// Keys (under the `STORYLOOM_` environment prefix, or in a config file):
/// `idle_grace_ms`, `heartbeat_window_ms`, `snapshot_every_ops`,
/// `snapshot_interval_ms`, `actor_tick_ms`, `call_timeout_ms`,
/// `merge_chapter_timeout_ms`, `command_queue`, `session_buffer`,
/// `pending_ops_max`, `retry.max_attempts`, `retry.initial_delay_ms`,
/// `retry.max_delay_ms`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an actor with no sessions stays alive
    pub idle_grace: Duration,
    /// A session silent for longer than this is detached
    pub heartbeat_window: Duration,
    /// Snapshot after this many integrated operations
    pub snapshot_every_ops: u64,
    /// Snapshot at least this often while there are unsnapshotted operations
    pub snapshot_interval: Duration,
    /// Actor housekeeping period (reaping, periodic snapshots, eviction)
    pub actor_tick: Duration,
    /// Upper bound on one request/response round trip to an actor
    pub call_timeout: Duration,
    /// Per-chapter budget during a branch merge
    pub merge_chapter_timeout: Duration,
    /// Actor mailbox capacity
    pub command_queue: usize,
    /// Outbound messages buffered per session before it is dropped as lagging
    pub session_buffer: usize,
    /// Remote operations a client holds while waiting for dependencies
    pub pending_ops_max: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            heartbeat_window: Duration::from_secs(45),
            snapshot_every_ops: 200,
            snapshot_interval: Duration::from_secs(10),
            actor_tick: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
            merge_chapter_timeout: Duration::from_secs(10),
            command_queue: 256,
            session_buffer: 1024,
            pending_ops_max: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

fn millis(config: &ConfigService, key: &str, default: Duration) -> Duration {
    Duration::from_millis(config.get_or(key, default.as_millis() as u64))
}

impl EngineConfig {
    /// Read from a loaded config service, falling back to defaults per key.
    pub fn from_service(config: &ConfigService) -> CollabResult<Self> {
        let defaults = Self::default();
        let engine = Self {
            idle_grace: millis(config, "idle_grace_ms", defaults.idle_grace),
            heartbeat_window: millis(config, "heartbeat_window_ms", defaults.heartbeat_window),
            snapshot_every_ops: config.get_or("snapshot_every_ops", defaults.snapshot_every_ops),
            snapshot_interval: millis(config, "snapshot_interval_ms", defaults.snapshot_interval),
            actor_tick: millis(config, "actor_tick_ms", defaults.actor_tick),
            call_timeout: millis(config, "call_timeout_ms", defaults.call_timeout),
            merge_chapter_timeout: millis(
                config,
                "merge_chapter_timeout_ms",
                defaults.merge_chapter_timeout,
            ),
            command_queue: config.get_or("command_queue", defaults.command_queue),
            session_buffer: config.get_or("session_buffer", defaults.session_buffer),
            pending_ops_max: config.get_or("pending_ops_max", defaults.pending_ops_max),
            retry: RetryPolicy {
                max_attempts: config.get_or("retry.max_attempts", defaults.retry.max_attempts),
                initial_delay: millis(config, "retry.initial_delay_ms", defaults.retry.initial_delay),
                max_delay: millis(config, "retry.max_delay_ms", defaults.retry.max_delay),
                multiplier: defaults.retry.multiplier,
            },
        };
        engine.validate()?;
        Ok(engine)
    }

    /// Environment and `.env` under `STORYLOOM_`.
    pub fn from_env() -> CollabResult<Self> {
        Self::from_service(&ConfigService::from_env()?)
    }
}

impl Validate for EngineConfig {
    fn validate(&self) -> storyloom_config::Result<()> {
        let ms = |d: Duration| d.as_millis() as u64;
        ConfigValidator::positive(ms(self.actor_tick), "actor_tick_ms")?;
        ConfigValidator::positive(ms(self.call_timeout), "call_timeout_ms")?;
        ConfigValidator::positive(self.snapshot_every_ops, "snapshot_every_ops")?;
        ConfigValidator::positive(self.command_queue as u64, "command_queue")?;
        ConfigValidator::positive(self.session_buffer as u64, "session_buffer")?;
        ConfigValidator::positive(self.pending_ops_max as u64, "pending_ops_max")?;
        ConfigValidator::in_range(self.retry.max_attempts, 1, 20, "retry.max_attempts")?;
        ConfigValidator::less_than(
            ms(self.actor_tick),
            ms(self.heartbeat_window),
            "actor_tick_ms",
            "heartbeat_window_ms",
        )
    }
}
