//! Karma Configuration - column names, aggregation specs and scoring constants
//!
//! Every tunable of the pipeline is a field in this module. Each struct
//! implements `Default`, so an empty or missing TOML file yields the
//! built-in behaviour.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::features::{AggregateStat, AggregationSpec};

/// Environment variable pointing at a TOML config file.
pub const CONFIG_ENV_VAR: &str = "KARMA_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "karma_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `KarmaConfig::load()` which searches:
/// 1. `$KARMA_CONFIG` env var
/// 2. `./karma_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarmaConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub columns: ColumnsConfig,

    #[serde(default)]
    pub laps: LapConfig,

    /// Per-signal aggregates computed for every lap
    #[serde(default = "default_aggregations")]
    pub aggregation: Vec<AggregationSpec>,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub karma: KarmaStreamConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for KarmaConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            columns: ColumnsConfig::default(),
            laps: LapConfig::default(),
            aggregation: default_aggregations(),
            inference: InferenceConfig::default(),
            karma: KarmaStreamConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl KarmaConfig {
    /// Load configuration using the standard search order:
    /// 1. `$KARMA_CONFIG` environment variable
    /// 2. `./karma_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded karma config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded karma config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Directory holding processed feature / karma tables.
    pub fn processed_dir(&self) -> PathBuf {
        self.paths.data_root.join("processed")
    }

    /// Validate all settings for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        // Columns
        let c = &self.columns;
        if c.vehicle.trim().is_empty() {
            errors.push("columns.vehicle must not be empty".to_string());
        }
        if c.timestamp_candidates.iter().all(|s| s.trim().is_empty()) {
            errors.push("columns.timestamp_candidates must name at least one column".to_string());
        }
        if c.signal_name == c.signal_value {
            errors.push(format!(
                "columns.signal_name and columns.signal_value must differ (both '{}')",
                c.signal_name
            ));
        }

        // Lap windowing
        if !self.laps.window_seconds.is_finite() || self.laps.window_seconds <= 0.0 {
            errors.push(format!(
                "laps.window_seconds must be a positive finite number, got {}",
                self.laps.window_seconds
            ));
        }

        // Aggregations
        let mut seen: HashSet<&str> = HashSet::new();
        for spec in &self.aggregation {
            if spec.signal.trim().is_empty() {
                errors.push("aggregation entries must name a signal".to_string());
            } else if !seen.insert(spec.signal.as_str()) {
                errors.push(format!("aggregation signal '{}' listed more than once", spec.signal));
            }
            if spec.stats.is_empty() {
                errors.push(format!("aggregation '{}' must list at least one stat", spec.signal));
            }
        }

        // Inference
        let inf = &self.inference;
        Self::check_unit_interval(inf.materiality_threshold, "inference.materiality_threshold", &mut errors);
        Self::check_unit_interval(inf.medium_risk_threshold, "inference.medium_risk_threshold", &mut errors);
        Self::check_unit_interval(inf.high_risk_threshold, "inference.high_risk_threshold", &mut errors);
        if inf.medium_risk_threshold > inf.high_risk_threshold {
            errors.push(format!(
                "inference.medium_risk_threshold ({:.2}) must be <= high_risk_threshold ({:.2})",
                inf.medium_risk_threshold, inf.high_risk_threshold
            ));
        }

        // Karma
        let k = &self.karma;
        if !(0.0..1.0).contains(&k.smoothing) {
            errors.push(format!("karma.smoothing must be in [0, 1), got {}", k.smoothing));
        }
        if !k.trend_deadband.is_finite() || k.trend_deadband < 0.0 {
            errors.push(format!("karma.trend_deadband must be >= 0, got {}", k.trend_deadband));
        }
        if k.trend_lookback_laps == 0 {
            errors.push("karma.trend_lookback_laps must be > 0".to_string());
        }

        if self.server.max_upload_bytes == 0 {
            errors.push("server.max_upload_bytes must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_unit_interval(value: f64, name: &str, errors: &mut Vec<String>) {
        if !(0.0..=1.0).contains(&value) {
            errors.push(format!("{name} must be in [0, 1], got {value}"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Sections
// ============================================================================

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for processed outputs (`<data_root>/processed`)
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Directory holding model and scaler artifacts
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

/// Recognized column names in raw telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnsConfig {
    /// Mandatory vehicle identifier column
    #[serde(default = "default_vehicle_col")]
    pub vehicle: String,

    /// Optional car number column, used to match race results keyed by
    /// `NUMBER` to telemetry vehicle ids
    #[serde(default = "default_vehicle_number_col")]
    pub vehicle_number: String,

    /// Timestamp columns in priority order; first present wins
    #[serde(default = "default_timestamp_candidates")]
    pub timestamp_candidates: Vec<String>,

    /// Lap columns in priority order; first present wins
    #[serde(default = "default_lap_candidates")]
    pub lap_candidates: Vec<String>,

    /// Signal-name column of long-format telemetry
    #[serde(default = "default_signal_name")]
    pub signal_name: String,

    /// Signal-value column of long-format telemetry
    #[serde(default = "default_signal_value")]
    pub signal_value: String,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            vehicle: default_vehicle_col(),
            vehicle_number: default_vehicle_number_col(),
            timestamp_candidates: default_timestamp_candidates(),
            lap_candidates: default_lap_candidates(),
            signal_name: default_signal_name(),
            signal_value: default_signal_value(),
        }
    }
}

fn default_vehicle_col() -> String {
    "vehicle_id".to_string()
}
fn default_vehicle_number_col() -> String {
    "vehicle_number".to_string()
}
fn default_timestamp_candidates() -> Vec<String> {
    vec!["meta_time".to_string(), "timestamp".to_string()]
}
fn default_lap_candidates() -> Vec<String> {
    vec!["lap".to_string(), "lap_number".to_string()]
}
fn default_signal_name() -> String {
    "telemetry_name".to_string()
}
fn default_signal_value() -> String {
    "telemetry_value".to_string()
}

/// Lap assignment tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapConfig {
    /// Bucket width of the approximate fixed-window assignment (seconds)
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,
}

impl Default for LapConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_window_seconds() -> f64 {
    defaults::FIXED_LAP_WINDOW_SECS
}

/// Risk inference tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Minimum probability for a component to be reported as most at risk
    #[serde(default = "default_materiality")]
    pub materiality_threshold: f64,

    /// Overall probability above which risk is "medium"
    #[serde(default = "default_medium_risk")]
    pub medium_risk_threshold: f64,

    /// Overall probability above which risk is "high"
    #[serde(default = "default_high_risk")]
    pub high_risk_threshold: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            materiality_threshold: default_materiality(),
            medium_risk_threshold: default_medium_risk(),
            high_risk_threshold: default_high_risk(),
        }
    }
}

fn default_materiality() -> f64 {
    defaults::COMPONENT_MATERIALITY_THRESHOLD
}
fn default_medium_risk() -> f64 {
    defaults::MEDIUM_RISK_THRESHOLD
}
fn default_high_risk() -> f64 {
    defaults::HIGH_RISK_THRESHOLD
}

/// Karma stream smoothing and trend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarmaStreamConfig {
    /// EWMA weight of the previous smoothed value (0 = no smoothing)
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    /// Laps back used for trend comparison
    #[serde(default = "default_trend_lookback")]
    pub trend_lookback_laps: u32,

    /// Absolute karma change treated as "stable"
    #[serde(default = "default_trend_deadband")]
    pub trend_deadband: f64,
}

impl Default for KarmaStreamConfig {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            trend_lookback_laps: default_trend_lookback(),
            trend_deadband: default_trend_deadband(),
        }
    }
}

fn default_smoothing() -> f64 {
    defaults::KARMA_SMOOTHING
}
fn default_trend_lookback() -> u32 {
    defaults::TREND_LOOKBACK_LAPS
}
fn default_trend_deadband() -> f64 {
    defaults::TREND_DEADBAND
}

/// HTTP boundary settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Largest accepted upload body (bytes)
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_max_upload() -> usize {
    defaults::MAX_UPLOAD_BYTES
}

/// Default aggregation table for the VIR telemetry feed.
pub fn default_aggregations() -> Vec<AggregationSpec> {
    use AggregateStat::{Max, Mean, Min, Std};
    let spec = |signal: &str, stats: &[AggregateStat]| AggregationSpec {
        signal: signal.to_string(),
        stats: stats.to_vec(),
    };
    vec![
        spec("speed", &[Mean, Max, Min, Std]),
        spec("Steering_Angle", &[Mean, Std]),
        spec("ath", &[Mean, Max, Std]),
        spec("pbrake_f", &[Mean, Max]),
        spec("pbrake_r", &[Mean, Max]),
        spec("nmot", &[Mean, Max, Std]),
        spec("accx_can", &[Mean, Max, Min, Std]),
        spec("accy_can", &[Mean, Max, Min, Std]),
        spec("gear", &[Mean, Max]),
    ]
}

// ============================================================================
// Tests
// ============================================================================
