//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`, wrapped in `SecretString`
//! so they never land in debug output.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

use crate::types::ModelTier;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub market_data: MarketDataConfig,
    /// Keyed by backend id ("claude", "gpt", "grok", ...).
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    /// Cadence of the outcome-resolver sweep.
    pub resolve_interval_secs: u64,
    /// Cadence of the calibration due-check.
    pub calibration_interval_secs: u64,
    pub database_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key_env: Option<String>,
    /// Hard pacing floor between provider calls — the provider rate
    /// limits and exposes no batch endpoint.
    pub min_call_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub enabled: bool,
    /// Transport family: "anthropic" | "openai" | "grok".
    pub provider: String,
    pub tier: ModelTier,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    2048
}

/// Outcome-classification thresholds. Fixed heuristics, kept
/// configurable rather than hard-coded.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Minimum return at expiry to call a directional pick a WIN (%).
    pub expiry_win_threshold_pct: f64,
    /// Band around zero within which a HOLD pick wins at expiry (%).
    pub hold_band_pct: f64,
    /// Days past expiry after which an unresolvable pick settles EXPIRED.
    pub expiry_grace_days: i64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            expiry_win_threshold_pct: 2.0,
            hold_band_pct: 3.0,
            expiry_grace_days: 7,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Trailing window of settled picks to aggregate.
    pub window_days: i64,
    /// Minimum settled picks before a calibration is produced.
    pub min_picks: usize,
    /// Minimum picks per sector to qualify for best/worst lists.
    pub min_sector_picks: usize,
    /// Factor win rate below which the factor is flagged "avoid".
    pub factor_avoid_threshold: f64,
    /// Minimum observations before a factor can be flagged.
    pub factor_min_observations: usize,
    /// New settlements within `due_window_days` that make a backend due.
    pub due_settlements: usize,
    pub due_window_days: i64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            min_picks: 5,
            min_sector_picks: 3,
            factor_avoid_threshold: 0.40,
            factor_min_observations: 5,
            due_settlements: 10,
            due_window_days: 7,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to a secret value.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        let value = std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))?;
        Ok(SecretString::new(value))
    }

    /// Backend ids that are enabled, sorted for deterministic fan-out
    /// ordering in logs.
    pub fn enabled_backends(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .backends
            .iter()
            .filter(|(_, b)| b.enabled)
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[service]
name = "QUORUM-001"
resolve_interval_secs = 3600
calibration_interval_secs = 86400
database_path = "quorum.db"

[server]
enabled = true
port = 8080

[market_data]
base_url = "https://quotes.example.com"
api_key_env = "MARKET_DATA_API_KEY"
min_call_interval_ms = 250

[backends.claude]
enabled = true
provider = "anthropic"
tier = "large"
model = "claude-sonnet-4-20250514"
api_key_env = "ANTHROPIC_API_KEY"
timeout_secs = 45

[backends.gpt]
enabled = true
provider = "openai"
tier = "large"
model = "gpt-4o"
api_key_env = "OPENAI_API_KEY"
timeout_secs = 45
max_tokens = 4096

[backends.grok]
enabled = false
provider = "grok"
tier = "medium"
model = "grok-3"
api_key_env = "XAI_API_KEY"
timeout_secs = 60
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.service.name, "QUORUM-001");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.backends.len(), 3);
        assert_eq!(cfg.backends["claude"].tier, ModelTier::Large);
        assert_eq!(cfg.backends["grok"].tier, ModelTier::Medium);
        assert!(!cfg.backends["grok"].enabled);
        assert_eq!(cfg.backends["claude"].max_tokens, 2048); // default
        assert_eq!(cfg.backends["gpt"].max_tokens, 4096);
    }

    #[test]
    fn test_enabled_backends_sorted() {
        let cfg: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.enabled_backends(), vec!["claude", "gpt"]);
    }

    #[test]
    fn test_threshold_defaults() {
        let cfg: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert!((cfg.resolution.expiry_win_threshold_pct - 2.0).abs() < 1e-10);
        assert!((cfg.resolution.hold_band_pct - 3.0).abs() < 1e-10);
        assert_eq!(cfg.calibration.min_picks, 5);
        assert_eq!(cfg.calibration.min_sector_picks, 3);
        assert!((cfg.calibration.factor_avoid_threshold - 0.40).abs() < 1e-10);
    }

    #[test]
    fn test_threshold_overrides() {
        let toml_str = format!(
            "{SAMPLE}\n[resolution]\nexpiry_win_threshold_pct = 1.5\nhold_band_pct = 3.0\nexpiry_grace_days = 7\n"
        );
        let cfg: AppConfig = toml::from_str(&toml_str).unwrap();
        assert!((cfg.resolution.expiry_win_threshold_pct - 1.5).abs() < 1e-10);
    }

    #[test]
    fn test_resolve_secret_missing() {
        assert!(AppConfig::resolve_secret("QUORUM_TEST_UNSET_ENV_VAR_XYZ").is_err());
    }

    #[test]
    fn test_load_config_file() {
        // This test requires config.toml to be in the working directory.
        // If it isn't present in a given test environment, that's fine.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(!cfg.backends.is_empty());
            assert!(cfg.service.resolve_interval_secs > 0);
        }
    }
}
