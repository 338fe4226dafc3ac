use thiserror::Error;

/// Configuration failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("cannot convert `{key}`: {message}")]
    Conversion { key: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("environment variable error: {0}")]
    Env(#[from] std::env::VarError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
