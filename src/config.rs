//! TOML configuration for anomalywatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file)
//! yields a working configuration. Durations accept `"90s"`, `"5m"`,
//! `"1h"`, `"1d"` or a bare number of seconds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::baseline::SensitivityReset;
use crate::detect::{
    BinaryThresholds, DetectError, Severity, SeverityBreakpoints, ThresholdPolicy, Thresholds,
};
use crate::scheduler::Cadence;

pub const CONFIG_ENV: &str = "ANOMALYWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/anomalywatch/anomalywatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub schedule: ScheduleConfig,
    pub baseline: BaselineConfig,
    pub thresholds: ThresholdsConfig,
    pub severity: SeverityConfig,
    pub sensitivity: SensitivityConfig,
    pub learning: LearningConfig,
    pub monitored: MonitoredConfig,
    pub notify: NotifyConfig,
    pub reports: ReportsConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (the `--config` flag); an unreadable file is an error.
    /// 2. The path in `ANOMALYWATCH_CONFIG`.
    /// 3. `/etc/anomalywatch/anomalywatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), DetectError> {
        self.threshold_policy()?;

        let s = &self.sensitivity;
        if !(s.floor > 0.0 && s.floor.is_finite()) {
            return Err(DetectError::Configuration(format!(
                "sensitivity floor must be positive (got {})",
                s.floor
            )));
        }
        if !(s.false_alarm_step > 0.0 && s.false_alarm_step.is_finite()) {
            return Err(DetectError::Configuration(format!(
                "false alarm step must be positive (got {})",
                s.false_alarm_step
            )));
        }
        for (entity, value) in &s.entities {
            if !(*value >= s.floor && value.is_finite()) {
                return Err(DetectError::Configuration(format!(
                    "sensitivity for {entity} must be at least the floor {} (got {value})",
                    s.floor
                )));
            }
        }

        for (name, interval) in [
            ("standard_check_interval", self.schedule.standard_interval()),
            ("priority_check_interval", self.schedule.priority_check_interval),
            ("baseline_refresh_interval", self.schedule.baseline_refresh_interval),
            ("retry_backoff", self.schedule.retry_backoff),
            ("source.timeout", self.source.timeout),
            ("baseline.recent_window", self.baseline.recent_window),
        ] {
            if interval.is_zero() {
                return Err(DetectError::Configuration(format!("{name} must be greater than zero")));
            }
        }
        if self.baseline.window_days == 0 {
            return Err(DetectError::Configuration("baseline window must be at least one day".into()));
        }
        if self.baseline.min_samples == 0 {
            return Err(DetectError::Configuration("min_samples must be at least 1".into()));
        }
        if self.reports.enabled {
            Cadence::cron(&self.reports.cron)?;
        }
        Ok(())
    }

    /// Global thresholds plus per-entity overrides, all validated.
    pub fn threshold_policy(&self) -> Result<ThresholdPolicy, DetectError> {
        let t = &self.thresholds;
        let defaults = Thresholds::new(
            t.sigma,
            BinaryThresholds::new(t.binary_low, t.binary_medium, t.binary_high)?,
            t.categorical_epsilon,
            t.categorical_severity,
        )?;
        let breakpoints = SeverityBreakpoints::new(self.severity.medium, self.severity.high)?;
        check_sigma("thresholds", defaults.sigma, &breakpoints)?;

        let mut policy = ThresholdPolicy::new(defaults.clone(), breakpoints);
        for (entity, o) in &t.entities {
            let binary = BinaryThresholds::new(
                o.binary_low.unwrap_or(defaults.binary.low()),
                o.binary_medium.unwrap_or(defaults.binary.medium()),
                o.binary_high.unwrap_or(defaults.binary.high()),
            )?;
            let merged = Thresholds::new(
                o.sigma.unwrap_or(defaults.sigma),
                binary,
                o.categorical_epsilon.unwrap_or(defaults.categorical_epsilon),
                o.categorical_severity.unwrap_or(defaults.categorical_severity),
            )
            .map_err(|e| DetectError::Configuration(format!("thresholds for {entity}: {e}")))?;
            check_sigma(&format!("thresholds for {entity}"), merged.sigma, &breakpoints)?;
            policy = policy.with_override(entity, merged);
        }
        Ok(policy)
    }
}

fn check_sigma(scope: &str, sigma: f64, breakpoints: &SeverityBreakpoints) -> Result<(), DetectError> {
    if sigma >= breakpoints.medium() {
        return Err(DetectError::Configuration(format!(
            "{scope}: sigma {sigma} must be below severity.medium {}",
            breakpoints.medium()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/anomalywatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// State source
// ---------------------------------------------------------------------------

/// Connection to the host's REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    /// Long-lived access token. Prefer `token_env` to keep it out of the file.
    pub token: Option<String>,
    /// Environment variable holding the access token.
    pub token_env: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl SourceConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.is_empty())
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8123".to_string(),
            token: None,
            token_env: "ANOMALYWATCH_SOURCE_TOKEN".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub standard_check_interval: Option<Duration>,
    #[serde(with = "duration_str")]
    pub priority_check_interval: Duration,
    #[serde(with = "duration_str")]
    pub baseline_refresh_interval: Duration,
    /// Older name for the standard interval.
    #[serde(with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub anomaly_check_interval: Option<Duration>,
    /// Base delay before retrying a tier whose source was unavailable.
    #[serde(with = "duration_str")]
    pub retry_backoff: Duration,
}

impl ScheduleConfig {
    pub fn standard_interval(&self) -> Duration {
        self.standard_check_interval
            .or(self.anomaly_check_interval)
            .unwrap_or(Duration::from_secs(30 * 60))
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            standard_check_interval: None,
            priority_check_interval: Duration::from_secs(5 * 60),
            baseline_refresh_interval: Duration::from_secs(24 * 3600),
            anomaly_check_interval: None,
            retry_backoff: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub window_days: u32,
    pub min_samples: usize,
    /// Evaluation window for binary flip rates.
    #[serde(with = "duration_str")]
    pub recent_window: Duration,
    pub max_categorical_labels: usize,
    pub max_label_len: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_samples: 5,
            recent_window: Duration::from_secs(3600),
            max_categorical_labels: 20,
            max_label_len: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds and severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub sigma: f64,
    pub binary_low: f64,
    pub binary_medium: f64,
    pub binary_high: f64,
    pub categorical_epsilon: f64,
    pub categorical_severity: Severity,
    pub entities: HashMap<String, ThresholdOverride>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            sigma: 2.0,
            binary_low: 0.1,
            binary_medium: 0.3,
            binary_high: 0.6,
            categorical_epsilon: 0.01,
            categorical_severity: Severity::Medium,
            entities: HashMap::new(),
        }
    }
}

/// Per-entity overrides; unset fields inherit the global value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverride {
    pub sigma: Option<f64>,
    pub binary_low: Option<f64>,
    pub binary_medium: Option<f64>,
    pub binary_high: Option<f64>,
    pub categorical_epsilon: Option<f64>,
    pub categorical_severity: Option<Severity>,
}

/// Adjusted z-score multiples at which numeric findings escalate. `medium`
/// must sit above every sigma so low findings stay reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self { medium: 2.5, high: 4.0 }
    }
}

// ---------------------------------------------------------------------------
// Sensitivity and learning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// Initial sensitivity per entity; others start at 1.0.
    pub entities: HashMap<String, f64>,
    pub false_alarm_step: f64,
    pub floor: f64,
    pub reset: SensitivityReset,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            false_alarm_step: 0.1,
            floor: 0.2,
            reset: SensitivityReset::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Start in global learning mode on first launch.
    pub enabled: bool,
    /// Days until global learning ends on its own; unset means never.
    pub duration_days: Option<u32>,
    /// Entities kept in learning regardless of the global flag.
    pub entities: Vec<String>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_days: Some(7),
            entities: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitored entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoredConfig {
    pub standard: Vec<String>,
    pub priority: Vec<String>,
    /// Remove registry entries the host no longer lists.
    pub prune_missing: bool,
}

impl Default for MonitoredConfig {
    fn default() -> Self {
        Self {
            standard: Vec::new(),
            priority: Vec::new(),
            prune_missing: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub log: bool,
    pub webhook_url: Option<String>,
    pub webhook_headers: HashMap<String, String>,
    pub min_severity: Severity,
    pub include_degraded: bool,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            webhook_headers: HashMap::new(),
            min_severity: Severity::High,
            include_degraded: false,
            timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cron: String,
    pub log_path: PathBuf,
    pub levels: Vec<String>,
    pub max_reports: usize,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl ReportsConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.is_empty())
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 3 * * *".to_string(),
            log_path: PathBuf::from("/config/home-assistant.log"),
            levels: vec!["ERROR".to_string(), "WARNING".to_string()],
            max_reports: 10,
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            api_key_env: "ANOMALYWATCH_SUMMARIZER_KEY".to_string(),
            model: "gpt-4.1-mini".to_string(),
            max_tokens: 2000,
            temperature: 0.3,
            timeout: Duration::from_secs(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging and API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Allow cross-origin requests (browser dashboards on another port).
    pub cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            cors: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Duration strings
// ---------------------------------------------------------------------------

/// Parse `"45s"`, `"5m"`, `"2h"`, `"1d"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    let scale: u64 = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
    };
    let secs = value
        .checked_mul(scale)
        .ok_or_else(|| format!("duration '{raw}' is too large"))?;
    Ok(Duration::from_secs(secs))
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        s if s > 0 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s > 0 && s % 3600 == 0 => format!("{}h", s / 3600),
        s if s > 0 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    fn from_raw<E: de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(d)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(d)?.map(from_raw).transpose()
        }
    }
}
