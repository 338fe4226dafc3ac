use crate::{ConfigManager, FileFormat, Result, Validate, DEFAULT_PREFIX};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// Read-only facade over a loaded [`ConfigManager`].
#[derive(Clone, Default)]
pub struct ConfigService {
    manager: ConfigManager,
}

impl ConfigService {
    pub fn from_manager(manager: ConfigManager) -> Self {
        Self { manager }
    }

    pub fn builder() -> ConfigServiceBuilder {
        ConfigServiceBuilder::new()
    }

    /// Defaults, `.env`, and the environment under `STORYLOOM_`.
    pub fn from_env() -> Result<Self> {
        Self::builder()
            .with_prefix(DEFAULT_PREFIX)
            .load_dotenv(None)
            .load_env()
            .build()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.manager.get(key)
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.manager.get_or(key, default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.manager.has(key)
    }

    pub fn manager(&self) -> &ConfigManager {
        &self.manager
    }

    /// Deserialize a typed config from all stored values and validate it.
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let object = self
            .manager
            .keys()
            .into_iter()
            .filter_map(|key| {
                let value = self.manager.get::<serde_json::Value>(&key).ok()?;
                Some((key, value))
            })
            .collect();
        let typed: T = serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| {
            crate::ConfigError::Conversion {
                key: std::any::type_name::<T>().to_string(),
                message: e.to_string(),
            }
        })?;
        typed.validate()?;
        Ok(typed)
    }
}

/// Builder that applies sources in precedence order on [`build`](Self::build).
#[derive(Default)]
pub struct ConfigServiceBuilder {
    prefix: Option<String>,
    defaults: Vec<(String, serde_json::Value)>,
    files: Vec<(PathBuf, Option<FileFormat>)>,
    dotenv: Option<Option<PathBuf>>,
    env: bool,
}

impl ConfigServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn default_value(mut self, key: &str, value: impl serde::Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.defaults.push((key.to_lowercase(), value));
        }
        self
    }

    /// Add a config file. The format is taken from the extension when `None`.
    pub fn add_file(mut self, path: impl Into<PathBuf>, format: Option<FileFormat>) -> Self {
        self.files.push((path.into(), format));
        self
    }

    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.dotenv = Some(path);
        self
    }

    pub fn load_env(mut self) -> Self {
        self.env = true;
        self
    }

    pub fn build(self) -> Result<ConfigService> {
        let manager = match self.prefix {
            Some(prefix) => ConfigManager::with_prefix(prefix),
            None => ConfigManager::new(),
        };

        for (key, value) in self.defaults {
            manager.set(&key, value)?;
        }

        for (path, format) in self.files {
            let format = match format {
                Some(format) => format,
                None => FileFormat::detect(&path)?,
            };
            manager.load_file(&path, format)?;
        }

        if let Some(path) = self.dotenv {
            manager.load_dotenv(path.as_deref())?;
        }

        if self.env {
            manager.load_env();
        }

        Ok(ConfigService::from_manager(manager))
    }
}
