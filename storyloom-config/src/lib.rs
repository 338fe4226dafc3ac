//! Layered configuration for Storyloom services.
//!
//! Values are resolved from, in increasing precedence: defaults set in code,
//! config files (JSON, TOML, `.env` syntax), a `.env` file, and finally the
//! process environment under a prefix (`STORYLOOM_` by default).
//!
//! ```rust
//! use storyloom_config::ConfigService;
//!
//! let config = ConfigService::builder()
//!     .with_prefix("STORYLOOM")
//!     .default_value("snapshot_every", 200)
//!     .build()
//!     .unwrap();
//!
//! let every: u64 = config.get_or("snapshot_every", 100);
//! assert!(every > 0);
//! ```

pub mod config_service;
pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use config_service::{ConfigService, ConfigServiceBuilder};
pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Prefix used by every Storyloom component.
pub const DEFAULT_PREFIX: &str = "STORYLOOM";

/// Key/value store behind [`ConfigService`].
///
/// Keys are lower-case and dotted (`retry.max_attempts`). A lookup that misses
/// the stored values falls back to the prefixed environment variable, so values
/// exported after the manager was built are still seen.
#[derive(Clone, Default)]
pub struct ConfigManager {
    values: Arc<RwLock<HashMap<String, Value>>>,
    env: EnvLoader,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            values: Arc::default(),
            env: EnvLoader::new(Some(prefix.into())),
        }
    }

    /// Copy every prefixed environment variable into the store. A variable also
    /// replaces any dotted key it spells (`RETRY_MAX_ATTEMPTS` for `retry.max_attempts`).
    pub fn load_env(&self) {
        let vars = self.env.load();
        let mut values = self.values.write();
        for (key, value) in vars {
            let shadowed: Vec<String> = values
                .keys()
                .filter(|existing| existing.contains('.') && existing.replace('.', "_") == key)
                .cloned()
                .collect();
            for existing in shadowed {
                values.insert(existing, Value::String(value.clone()));
            }
            values.insert(key, Value::String(value));
        }
    }

    /// Read a `.env` file into the process environment, then reload the environment.
    /// A missing default `.env` is not an error; a missing explicit path is.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::Load(e.to_string()))?;
            }
            None => {
                let _ = dotenvy::dotenv();
            }
        }
        self.load_env();
        Ok(())
    }

    pub fn load_file(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let entries = ConfigLoader::new(format).load_file(path)?;
        self.values.write().extend(entries);
        Ok(())
    }

    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| ConfigError::Conversion {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.values.write().insert(key.to_lowercase(), value);
        Ok(())
    }

    /// Insert only when the key has no value yet.
    pub fn set_default<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        if self.values.read().contains_key(&key.to_lowercase()) {
            return Ok(());
        }
        self.set(key, value)
    }

    fn raw(&self, key: &str) -> Option<Value> {
        let key = key.to_lowercase();
        if let Some(value) = self.values.read().get(&key) {
            return Some(value.clone());
        }
        self.env.load_var(&key).ok().map(Value::String)
    }

    /// Typed lookup. String values (from the environment or `.env` files) are
    /// parsed as JSON scalars when they do not deserialize directly, so
    /// `STORYLOOM_SNAPSHOT_EVERY=50` reads as a number.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .raw(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        match serde_json::from_value::<T>(value.clone()) {
            Ok(typed) => Ok(typed),
            Err(first) => {
                let Value::String(text) = &value else {
                    return Err(ConfigError::Conversion {
                        key: key.to_string(),
                        message: first.to_string(),
                    });
                };
                serde_json::from_str(text).map_err(|_| ConfigError::Conversion {
                    key: key.to_string(),
                    message: first.to_string(),
                })
            }
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Overlay `other`'s stored values onto this manager.
    pub fn merge(&self, other: &ConfigManager) {
        let theirs = other.values.read().clone();
        self.values.write().extend(theirs);
    }
}
