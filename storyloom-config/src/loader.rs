//! File parsing into a flat JSON object.

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    Env,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            "env" => Some(FileFormat::Env),
            _ => None,
        }
    }

    /// Detect the format from a path's extension.
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::Load(format!("no extension on {}", path.display())))?;
        Self::from_extension(ext)
            .ok_or_else(|| ConfigError::Load(format!("unsupported format: {}", ext)))
    }
}

/// Parses one config source. Nested tables are flattened to dotted keys
/// (`[retry] max_attempts = 3` becomes `retry.max_attempts`).
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Vec<(String, Value)>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> Result<Vec<(String, Value)>> {
        let tree = match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::Parse(format!("json: {}", e)))?,
            FileFormat::Toml => {
                let value: toml::Value = toml::from_str(content)
                    .map_err(|e| ConfigError::Parse(format!("toml: {}", e)))?;
                serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            FileFormat::Env => parse_env(content),
        };

        let mut out = Vec::new();
        flatten(None, tree, &mut out)?;
        Ok(out)
    }
}

fn parse_env(content: &str) -> Value {
    let map = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_lowercase(), Value::String(value.to_string()))
        })
        .collect();
    Value::Object(map)
}

fn flatten(prefix: Option<&str>, value: Value, out: &mut Vec<(String, Value)>) -> Result<()> {
    match (prefix, value) {
        (prefix, Value::Object(map)) => {
            for (key, child) in map {
                let key = match prefix {
                    Some(p) => format!("{}.{}", p, key),
                    None => key,
                };
                flatten(Some(&key), child, out)?;
            }
            Ok(())
        }
        (Some(key), value) => {
            out.push((key.to_string(), value));
            Ok(())
        }
        (None, _) => Err(ConfigError::Parse("top level must be a table".to_string())),
    }
}
