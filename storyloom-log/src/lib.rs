//! Storyloom logging.
//!
//! Lightweight leveled logging shared by the sync engine and branch services.
//! Output defaults to one JSON object per line on stderr so records can be
//! shipped as-is; set `STORYLOOM_LOG_SINK=facade` to hand records to whatever
//! `log` implementation the host application installed instead.
//!
//! # Usage
//!
//! ```rust
//! use storyloom_log::{debug, info, warn};
//!
//! info!("document actor started");
//! let replica = "7f3c";
//! debug!(target: "storyloom_collab::actor", "integrated op from {}", replica);
//! warn!("persistence retry {}", 2);
//! ```
//!
//! # Environment Variables
//!
//! - `STORYLOOM_DEBUG=1` - Enable debug logging
//! - `STORYLOOM_LOG_LEVEL=trace|debug|info|warn|error|off` - Minimum level
//! - `STORYLOOM_LOG_FORMAT=json|pretty|compact` - Output format (default `json`)
//! - `STORYLOOM_LOG_SINK=stderr|facade` - Destination (default `stderr`)
//! - `STORYLOOM_LOG_COLOR=1|0` - Colors for pretty output
//! - `STORYLOOM_LOG_TIMESTAMPS=1|0` - Timestamps in pretty/compact output
//! - `STORYLOOM_LOG_TARGET=1|0` - Show the module target

mod config;
mod level;
mod output;

pub use config::{Format, LogConfig, Sink};
pub use level::Level;

use config::{CONFIG, DEBUG_ENABLED, LOG_LEVEL};
use std::sync::atomic::Ordering;

/// Force the environment to be read now rather than on the first record.
pub fn init() {
    once_cell::sync::Lazy::force(&CONFIG);
}

/// Whether `STORYLOOM_DEBUG` (or [`set_debug`]) turned debug output on.
#[inline]
pub fn is_debug_enabled() -> bool {
    init();
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Whether records at `level` pass the current threshold.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    init();
    level != Level::Off && level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Current threshold.
pub fn current_level() -> Level {
    init();
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the threshold at runtime.
pub fn set_level(level: Level) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Toggle debug output at runtime. Enabling also lowers the threshold to debug.
pub fn set_debug(enabled: bool) {
    init();
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled && current_level() > Level::Debug {
        set_level(Level::Debug);
    }
}

/// The configuration read from the environment.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    if !is_level_enabled(level) {
        return;
    }
    output::emit(level, target, message, config());
}

#[doc(hidden)]
#[macro_export]
macro_rules! __emit {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::$level) {
            $crate::log($crate::Level::$level, $target, &format!($($arg)+));
        }
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::__emit!($level, target: module_path!(), $($arg)+)
    };
}

/// Log at trace level. Accepts an optional leading `target: "..."`.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { $crate::__emit!(Trace, $($arg)+) };
}

/// Log at debug level.
///
/// Emitted when `STORYLOOM_DEBUG=1` or `STORYLOOM_LOG_LEVEL=debug`.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::__emit!(Debug, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::__emit!(Info, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::__emit!(Warn, $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::__emit!(Error, $($arg)+) };
}

#[cfg(feature = "tracing")]
pub mod tracing_compat {
    //! `tracing` subscriber honoring the `STORYLOOM_*` threshold.
    //!
    //! Used by the WebSocket transport, which logs through `tracing`.

    use super::*;

    /// Subscriber filtered by `RUST_LOG` when set, otherwise by `STORYLOOM_LOG_LEVEL`.
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{fmt, EnvFilter};

        let config = config();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(config.color))
    }
}
