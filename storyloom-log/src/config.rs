//! Logging configuration read from `STORYLOOM_*` environment variables.

use crate::Level;
use once_cell::sync::Lazy;
use std::env;
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human readable, one record per line with timestamp and target
    Pretty,
    /// Short single-letter level and time only
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Where formatted records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Write directly to stderr
    Stderr,
    /// Forward to the `log` facade so the host application's logger receives them
    Facade,
}

impl FromStr for Sink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stderr" => Ok(Sink::Stderr),
            "facade" | "log" => Ok(Sink::Facade),
            other => Err(format!("unknown log sink: {}", other)),
        }
    }
}

pub(crate) static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
pub(crate) static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
pub(crate) static CONFIG: Lazy<LogConfig> = Lazy::new(LogConfig::from_env);

/// Resolved logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `STORYLOOM_DEBUG`
    pub debug: bool,
    /// `STORYLOOM_LOG_LEVEL`
    pub level: Level,
    /// `STORYLOOM_LOG_FORMAT`
    pub format: Format,
    /// `STORYLOOM_LOG_SINK`
    pub sink: Sink,
    /// `STORYLOOM_LOG_COLOR`
    pub color: bool,
    /// `STORYLOOM_LOG_TIMESTAMPS`
    pub timestamps: bool,
    /// `STORYLOOM_LOG_TARGET`
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            sink: Sink::Stderr,
            color: false,
            timestamps: true,
            show_target: true,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl LogConfig {
    /// Read the configuration from the environment and publish level/debug to the
    /// global atomics consulted by the macros.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let debug = env_flag("STORYLOOM_DEBUG").unwrap_or(false);
        let level = env_parsed("STORYLOOM_LOG_LEVEL").unwrap_or(if debug {
            Level::Debug
        } else {
            defaults.level
        });
        let color = env_flag("STORYLOOM_LOG_COLOR").unwrap_or_else(|| {
            env::var("NO_COLOR").is_err() && std::io::stderr().is_terminal()
        });

        let config = Self {
            debug,
            level,
            format: env_parsed("STORYLOOM_LOG_FORMAT").unwrap_or(defaults.format),
            sink: env_parsed("STORYLOOM_LOG_SINK").unwrap_or(defaults.sink),
            color,
            timestamps: env_flag("STORYLOOM_LOG_TIMESTAMPS").unwrap_or(defaults.timestamps),
            show_target: env_flag("STORYLOOM_LOG_TARGET").unwrap_or(defaults.show_target),
        };

        DEBUG_ENABLED.store(config.debug, Ordering::SeqCst);
        LOG_LEVEL.store(config.level as u8, Ordering::SeqCst);
        config
    }
}
