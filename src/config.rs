//! Harness configuration.
//!
//! Layers, later wins: built-in defaults, an optional JSON file, then
//! `QUALCODE_*` environment variables. Gateway credentials are read
//! separately by the OpenRouter adapter (`OPENROUTER_*`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::{SqliteCodingCache, CACHE_PATH_ENV};
use crate::codebook::{CategoryError, Codebook};
use crate::coding::{CodingOptions, MAX_CONCURRENCY};

pub const MODEL_ENV: &str = "QUALCODE_MODEL";
pub const CONCURRENCY_ENV: &str = "QUALCODE_CONCURRENCY";
pub const TEMPERATURE_ENV: &str = "QUALCODE_TEMPERATURE";
pub const MAX_TOKENS_ENV: &str = "QUALCODE_MAX_TOKENS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{var}={value:?} is not valid: {reason}")]
    BadEnv {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("codebook: {0}")]
    Codebook(#[from] CategoryError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub coding: CodingOptions,
    pub concurrency: usize,
    pub cache_path: Option<PathBuf>,
    /// JSON codebook; the built-in trust framework when absent.
    pub codebook_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            coding: CodingOptions::default(),
            concurrency: 4,
            cache_path: None,
            codebook_path: None,
        }
    }
}

impl HarnessConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.coding.model = model.trim().to_string();
        }
        if let Some(raw) = lookup(CONCURRENCY_ENV) {
            let n: usize = parse_env(CONCURRENCY_ENV, &raw, "expected a positive integer")?;
            if n == 0 || n > MAX_CONCURRENCY {
                return Err(ConfigError::BadEnv {
                    var: CONCURRENCY_ENV,
                    value: raw,
                    reason: "must be between 1 and 16",
                });
            }
            self.concurrency = n;
        }
        if let Some(raw) = lookup(TEMPERATURE_ENV) {
            let t: f32 = parse_env(TEMPERATURE_ENV, &raw, "expected a number")?;
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::BadEnv {
                    var: TEMPERATURE_ENV,
                    value: raw,
                    reason: "must be within 0.0..=2.0",
                });
            }
            self.coding.temperature = t;
        }
        if let Some(raw) = lookup(MAX_TOKENS_ENV) {
            self.coding.max_tokens = Some(parse_env(MAX_TOKENS_ENV, &raw, "expected an integer")?);
        }
        if let Some(path) = lookup(CACHE_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            self.cache_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(SqliteCodingCache::default_path)
    }

    pub fn codebook(&self) -> Result<Codebook, ConfigError> {
        match &self.codebook_path {
            Some(path) => Ok(Codebook::from_json_file(path)?),
            None => Ok(Codebook::trust_framework()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    raw: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::BadEnv {
        var,
        value: raw.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = HarnessConfig::default();
        config
            .apply_env(env(&[
                (MODEL_ENV, "openai/gpt-4o-mini"),
                (CONCURRENCY_ENV, "8"),
                (TEMPERATURE_ENV, "0.2"),
                (MAX_TOKENS_ENV, "32"),
                (CACHE_PATH_ENV, "/tmp/q.sqlite"),
            ]))
            .unwrap();
        assert_eq!(config.coding.model, "openai/gpt-4o-mini");
        assert_eq!(config.concurrency, 8);
        assert!((config.coding.temperature - 0.2).abs() < 1e-6);
        assert_eq!(config.coding.max_tokens, Some(32));
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/q.sqlite"));
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = HarnessConfig::default();
        let err = config.apply_env(env(&[(CONCURRENCY_ENV, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::BadEnv { var: CONCURRENCY_ENV, .. }));
        let err = config.apply_env(env(&[(TEMPERATURE_ENV, "hot")])).unwrap_err();
        assert!(err.to_string().contains("QUALCODE_TEMPERATURE"));
    }

    #[test]
    fn file_layer_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qualcode.json");
        std::fs::write(&path, r#"{"concurrency": 2, "coding": {"model": "m"}}"#).unwrap();
        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.coding.model, "m");
        assert_eq!(config.coding.template_slug, "coding_v1");
        assert!(config.codebook().is_ok());
    }
}
