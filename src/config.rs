//! Layered configuration: defaults -> TOML file -> environment variables ->
//! validation. Mirrors the `NetworkSettings`/`DetectionSettings`/
//! `LoggingSettings` split of `original_source/src/skada_ids/settings.py`,
//! and the range/grammar checks of
//! `original_source/src/scada_ids/config_validator.py`'s
//! `ConfigurationValidator`.
//!
//! This module is the "Configuration parsing" collaborator named out of
//! scope for THE CORE in spec §1 — the coordinator only ever sees the
//! already-validated, immutable `Config` this module produces.

use serde::Deserialize;

use crate::capture::{validate_filter_expression, validate_interface_id};
use crate::error::{Result, SynwatchError};

pub const DEFAULT_BPF_FILTER: &str = "tcp and tcp[13]=2";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: Option<String>,
    pub bpf_filter: String,
    pub promiscuous_mode: bool,
    pub capture_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            interface: None,
            bpf_filter: DEFAULT_BPF_FILTER.to_string(),
            promiscuous_mode: true,
            capture_timeout: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub prob_threshold: f64,
    pub window_seconds: u64,
    pub max_queue_size: usize,
    pub worker_count: usize,
    pub alert_cooldown_seconds: u64,
    pub model_path: String,
    pub scaler_path: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            prob_threshold: 0.7,
            window_seconds: 60,
            max_queue_size: 10_000,
            worker_count: 1,
            alert_cooldown_seconds: 30,
            model_path: "models/syn_model.joblib".to_string(),
            scaler_path: Some("models/syn_scaler.joblib".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: "INFO".to_string(),
        }
    }
}

/// Statistics-thread cadence; broken out of `DetectionConfig` in the spec's
/// own table (§6) even though it travels with detection settings here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub statistics_interval_s: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            statistics_interval_s: 5,
        }
    }
}

/// The frozen, validated struct handed to the coordinator at construction
/// (spec §3, §6). Produced only by `Config::load`, never constructed
/// piecemeal by the coordinator itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub detection: DetectionConfig,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkConfig::default(),
            detection: DetectionConfig::default(),
            logging: LoggingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Resolution order per spec §6: built-in defaults, then an optional
    /// TOML file (path from `SYNWATCH_CONFIG` or `synwatch.toml` beside the
    /// binary; silently absent is not an error), then `SYNWATCH_*`
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SYNWATCH_CONFIG").unwrap_or_else(|_| "synwatch.toml".to_string());
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(_) => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `SYNWATCH_DETECTION__PROB_THRESHOLD`-style overrides (spec
    /// §6). Only the handful of scalar options most often tuned at deploy
    /// time are wired; unknown `SYNWATCH_*` variables are ignored rather
    /// than treated as errors, matching the original's permissive
    /// `env_nested_delimiter` behaviour.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SYNWATCH_NETWORK__INTERFACE") {
            self.network.interface = Some(v);
        }
        if let Ok(v) = std::env::var("SYNWATCH_NETWORK__BPF_FILTER") {
            self.network.bpf_filter = v;
        }
        if let Ok(v) = std::env::var("SYNWATCH_NETWORK__PROMISCUOUS_MODE") {
            if let Ok(parsed) = v.parse() {
                self.network.promiscuous_mode = parsed;
            }
        }
        if let Ok(v) = std::env::var("SYNWATCH_DETECTION__PROB_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.detection.prob_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("SYNWATCH_DETECTION__WINDOW_SECONDS") {
            if let Ok(parsed) = v.parse() {
                self.detection.window_seconds = parsed;
            }
        }
        if let Ok(v) = std::env::var("SYNWATCH_DETECTION__WORKER_COUNT") {
            if let Ok(parsed) = v.parse() {
                self.detection.worker_count = parsed;
            }
        }
        if let Ok(v) = std::env::var("SYNWATCH_LOGGING__LOG_LEVEL") {
            self.logging.log_level = v;
        }
    }

    /// Validates every range/grammar rule from spec §6, plus the
    /// filter-expression allow-list and interface-identifier grammar from
    /// `capture`. A failure here is a `Configuration{option, reason}` error
    /// and the process exits with code 2 before a coordinator ever exists.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        range_check("prob_threshold", d.prob_threshold, 0.0, 1.0)?;
        range_check("window_seconds", d.window_seconds as f64, 1.0, 3600.0)?;
        range_check(
            "max_queue_size",
            d.max_queue_size as f64,
            100.0,
            1_000_000.0,
        )?;
        range_check("worker_count", d.worker_count as f64, 1.0, 8.0)?;
        range_check(
            "alert_cooldown_seconds",
            d.alert_cooldown_seconds as f64,
            0.0,
            3600.0,
        )?;
        range_check(
            "capture_read_timeout_s",
            self.network.capture_timeout as f64,
            1.0,
            60.0,
        )?;
        range_check(
            "statistics_interval_s",
            self.telemetry.statistics_interval_s as f64,
            1.0,
            60.0,
        )?;

        validate_filter_expression(&self.network.bpf_filter)?;
        if let Some(interface) = &self.network.interface {
            validate_interface_id(interface)?;
        }

        let valid_levels = ["DEBUG", "INFO", "WARN", "ERROR", "TRACE"];
        if !valid_levels.contains(&self.logging.log_level.to_ascii_uppercase().as_str()) {
            return Err(SynwatchError::Configuration {
                option: "log_level".to_string(),
                reason: format!("must be one of {:?}", valid_levels),
            });
        }

        Ok(())
    }
}

fn range_check(option: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value < min || value > max {
        return Err(SynwatchError::Configuration {
            option: option.to_string(),
            reason: format!("must be between {} and {}, got {}", min, max, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn prob_threshold_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.detection.prob_threshold = 1.5;
        match config.validate() {
            Err(SynwatchError::Configuration { option, .. }) => assert_eq!(option, "prob_threshold"),
            other => panic!("expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn worker_count_above_eight_is_rejected() {
        let mut config = Config::default();
        config.detection.worker_count = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsafe_bpf_filter_is_rejected() {
        let mut config = Config::default();
        config.network.bpf_filter = "tcp; rm -rf /".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults_without_error() {
        let config = Config::load_from_path("/nonexistent/path/synwatch.toml").unwrap();
        assert_eq!(config.detection.prob_threshold, 0.7);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "synwatch-config-test-{:?}",
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("synwatch.toml");
        std::fs::write(
            &path,
            "[detection]\nprob_threshold = 0.9\nworker_count = 4\n",
        )
        .unwrap();

        let config = Config::load_from_path(path.to_str().unwrap()).unwrap();
        assert_eq!(config.detection.prob_threshold, 0.9);
        assert_eq!(config.detection.worker_count, 4);

        std::fs::remove_dir_all(&dir).ok();
    }
}
