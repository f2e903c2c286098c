use crate::error::{AuditError, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub paths: PathConfig,
}

/// Vision model endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_url")]
    pub base_url: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    /// Whole-audit ceiling: a hung oracle call aborts the audit.
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

fn default_oracle_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_oracle_timeout() -> u64 {
    120
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_url(),
            model: default_oracle_model(),
            timeout_secs: default_oracle_timeout(),
        }
    }
}

/// Danish CVR registry endpoint.
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    /// Cached verdicts younger than this skip the network entirely.
    #[serde(default = "default_cache_days")]
    pub cache_days: i64,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

fn default_registry_url() -> String {
    "https://cvrapi.dk/api".to_string()
}

fn default_cache_days() -> i64 {
    7
}

fn default_registry_timeout() -> u64 {
    5
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            cache_days: default_cache_days(),
            timeout_secs: default_registry_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_rules_path")]
    pub vat_rules: PathBuf,
    #[serde(default = "default_cache_path")]
    pub cvr_cache: PathBuf,
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("data/vat_rules.json")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("data/cvr_cache.json")
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            vat_rules: default_rules_path(),
            cvr_cache: default_cache_path(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults so the
    /// binary works out of the box.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file found — using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AuditError::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let cfg = Config::load("does/not/exist.toml").unwrap();
        assert_eq!(cfg.registry.cache_days, 7);
        assert_eq!(cfg.registry.timeout_secs, 5);
        assert_eq!(cfg.oracle.model, "gpt-4o-mini");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [registry]
            cache_days = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.registry.cache_days, 1);
        assert_eq!(cfg.registry.base_url, "https://cvrapi.dk/api");
        assert_eq!(cfg.paths.vat_rules, PathBuf::from("data/vat_rules.json"));
    }
}
