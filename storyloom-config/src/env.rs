//! Prefixed environment variable lookup.

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Reads `PREFIX_KEY` style variables and exposes them under lower-case `key`.
#[derive(Debug, Clone, Default)]
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Full variable name for a config key: `snapshot_every` -> `STORYLOOM_SNAPSHOT_EVERY`.
    pub fn var_name(&self, key: &str) -> String {
        let key = key.to_uppercase().replace('.', "_");
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key),
            None => key,
        }
    }

    /// All variables carrying the prefix, keyed by the lower-cased remainder.
    pub fn load(&self) -> HashMap<String, String> {
        env::vars()
            .filter_map(|(key, value)| match &self.prefix {
                Some(prefix) => key
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .map(|rest| (rest.to_lowercase(), value)),
                None => Some((key.to_lowercase(), value)),
            })
            .collect()
    }

    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.var_name(key)).map_err(ConfigError::Env)
    }

    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_name_with_prefix() {
        let loader = EnvLoader::new(Some("STORYLOOM".to_string()));
        assert_eq!(loader.var_name("idle_grace_ms"), "STORYLOOM_IDLE_GRACE_MS");
        assert_eq!(loader.var_name("retry.max_attempts"), "STORYLOOM_RETRY_MAX_ATTEMPTS");
    }

    #[test]
    fn test_var_name_without_prefix() {
        let loader = EnvLoader::default();
        assert_eq!(loader.var_name("path"), "PATH");
    }

    #[test]
    fn test_missing_var_falls_back() {
        let loader = EnvLoader::new(Some("STORYLOOM_UNIT".to_string()));
        assert!(loader.load_var("NOT_SET_4417").is_err());
        assert_eq!(loader.load_var_or("NOT_SET_4417", "fallback"), "fallback");
    }
}
