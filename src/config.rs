//! Runtime configuration, loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 8000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:herdwatch.db?mode=rwc";

/// History queries never look back further than 7 days.
pub const HISTORY_HARD_CAP_HOURS: i64 = 168;

const MAX_REQUEST_TIMEOUT_SECS: u64 = 3600;

/// Thirty days.
const MAX_OFFLINE_TIMEOUT_MINUTES: i64 = 43_200;

const MAX_SWEEP_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,

    /// Deadline applied to every HTTP request.
    pub request_timeout: Duration,

    /// Largest accepted history window, never above [`HISTORY_HARD_CAP_HOURS`].
    pub max_history_hours: i64,

    pub rules: RulesConfig,

    /// A device that has not reported for this long is considered offline.
    pub offline_timeout: chrono::Duration,

    /// Period of the background offline sweep. `None` disables it.
    pub offline_sweep_interval: Option<Duration>,
}

/// Thresholds for the built-in alert rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RulesConfig {
    pub battery_low_percent: i32,
    pub battery_critical_percent: i32,
    pub fever_celsius: f64,
    pub fever_critical_celsius: f64,

    /// Lookback used to build the activity baseline.
    pub baseline_hours: i64,
    pub baseline_min_samples: i64,

    /// Length of the "current" activity window that must stay low.
    pub recent_minutes: i64,

    /// Fractional drop below baseline that raises a health alert.
    pub activity_drop_ratio: f64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            battery_low_percent: 20,
            battery_critical_percent: 5,
            fever_celsius: 39.5,
            fever_critical_celsius: 41.0,
            baseline_hours: 6,
            baseline_min_samples: 10,
            recent_minutes: 30,
            activity_drop_ratio: 0.4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
            max_history_hours: HISTORY_HARD_CAP_HOURS,
            rules: RulesConfig::default(),
            offline_timeout: chrono::Duration::minutes(30),
            offline_sweep_interval: None,
        }
    }
}

impl Config {
    /// Load configuration from `HERDWATCH_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Unset keys fall back
    /// to defaults; set but malformed keys are an error.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let rule_defaults = RulesConfig::default();

        let rules = RulesConfig {
            battery_low_percent: parse_or(
                &lookup,
                "HERDWATCH_BATTERY_LOW_PERCENT",
                rule_defaults.battery_low_percent,
            )?,
            battery_critical_percent: parse_or(
                &lookup,
                "HERDWATCH_BATTERY_CRITICAL_PERCENT",
                rule_defaults.battery_critical_percent,
            )?,
            fever_celsius: parse_or(
                &lookup,
                "HERDWATCH_FEVER_CELSIUS",
                rule_defaults.fever_celsius,
            )?,
            fever_critical_celsius: parse_or(
                &lookup,
                "HERDWATCH_FEVER_CRITICAL_CELSIUS",
                rule_defaults.fever_critical_celsius,
            )?,
            baseline_hours: parse_or(
                &lookup,
                "HERDWATCH_BASELINE_HOURS",
                rule_defaults.baseline_hours,
            )?,
            baseline_min_samples: parse_or(
                &lookup,
                "HERDWATCH_BASELINE_MIN_SAMPLES",
                rule_defaults.baseline_min_samples,
            )?,
            recent_minutes: parse_or(
                &lookup,
                "HERDWATCH_RECENT_MINUTES",
                rule_defaults.recent_minutes,
            )?,
            activity_drop_ratio: parse_or(
                &lookup,
                "HERDWATCH_ACTIVITY_DROP_RATIO",
                rule_defaults.activity_drop_ratio,
            )?,
        };
        rules.validate()?;

        let max_history_hours: i64 = parse_or(
            &lookup,
            "HERDWATCH_MAX_HISTORY_HOURS",
            defaults.max_history_hours,
        )?;
        if max_history_hours < 1 {
            bail!("HERDWATCH_MAX_HISTORY_HOURS must be at least 1");
        }

        let timeout_secs: u64 = parse_or(&lookup, "HERDWATCH_REQUEST_TIMEOUT_SECS", 30)?;
        if !(1..=MAX_REQUEST_TIMEOUT_SECS).contains(&timeout_secs) {
            bail!(
                "HERDWATCH_REQUEST_TIMEOUT_SECS must be between 1 and {MAX_REQUEST_TIMEOUT_SECS}"
            );
        }

        let offline_minutes: i64 = parse_or(&lookup, "HERDWATCH_OFFLINE_TIMEOUT_MINUTES", 30)?;
        if !(1..=MAX_OFFLINE_TIMEOUT_MINUTES).contains(&offline_minutes) {
            bail!(
                "HERDWATCH_OFFLINE_TIMEOUT_MINUTES must be between 1 and \
                 {MAX_OFFLINE_TIMEOUT_MINUTES}"
            );
        }

        let sweep_secs: u64 = parse_or(&lookup, "HERDWATCH_OFFLINE_SWEEP_SECS", 0)?;
        if sweep_secs > MAX_SWEEP_SECS {
            bail!("HERDWATCH_OFFLINE_SWEEP_SECS must be at most {MAX_SWEEP_SECS}");
        }

        Ok(Self {
            port: parse_or(&lookup, "HERDWATCH_PORT", defaults.port)?,
            database_url: lookup("HERDWATCH_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            request_timeout: Duration::from_secs(timeout_secs),
            max_history_hours: max_history_hours.min(HISTORY_HARD_CAP_HOURS),
            rules,
            offline_timeout: chrono::Duration::minutes(offline_minutes),
            offline_sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

impl RulesConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(0..=100).contains(&self.battery_low_percent)
            || !(0..=100).contains(&self.battery_critical_percent)
        {
            bail!("battery thresholds must be within 0-100");
        }
        if self.battery_critical_percent > self.battery_low_percent {
            bail!("battery critical threshold must not exceed the low threshold");
        }
        if self.fever_critical_celsius < self.fever_celsius {
            bail!("critical fever threshold must not be below the fever threshold");
        }
        if !(1..=HISTORY_HARD_CAP_HOURS).contains(&self.baseline_hours) {
            bail!("baseline window must be between 1 and {HISTORY_HARD_CAP_HOURS} hours");
        }
        if self.baseline_min_samples < 1 {
            bail!("baseline sample count must be at least 1");
        }
        if self.recent_minutes < 1 || self.recent_minutes >= self.baseline_hours * 60 {
            bail!("recent activity window must be at least 1 minute and shorter than the baseline");
        }
        if !(self.activity_drop_ratio > 0.0 && self.activity_drop_ratio < 1.0) {
            bail!("activity drop ratio must be strictly between 0 and 1");
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}
