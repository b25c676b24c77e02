//! Alert rules evaluated against each freshly stored reading.
//!
//! A rule looks at the new [`Reading`] and, when it asks for it, an aggregate
//! of the animal's earlier activity, and proposes at most one [`NewAlert`].
//! Rules are pure: they never touch storage, which keeps them testable in
//! isolation.
//!
//! # Deduplication
//!
//! [`RuleSet::evaluate`] allows one unresolved alert per animal and type. A rule
//! whose type is already open for the animal is skipped.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::RulesConfig;
use crate::model::{ActivityStats, AlertSeverity, AlertType, NewAlert, Reading};

/// Activity of the animal before the new reading, split at `recent_start`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityHistory {
    /// Readings from the start of the baseline window up to `recent_start`.
    pub baseline: ActivityStats,

    /// Readings from `recent_start` up to, not including, the new reading.
    pub recent: ActivityStats,

    pub recent_start: DateTime<Utc>,
}

/// Input handed to every rule.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// The reading that was just appended.
    pub reading: &'a Reading,

    /// Earlier activity, loaded only when a rule that needs it is due.
    pub activity: Option<ActivityHistory>,
}

pub trait AlertRule: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Type of the alerts this rule raises.
    fn alert_type(&self) -> AlertType;

    /// Whether the rule reads [`RuleContext::activity`].
    fn needs_history(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<NewAlert>;
}

/// Battery at or below a threshold.
#[derive(Debug, Clone)]
pub struct LowBatteryRule {
    pub low_percent: i32,
    pub critical_percent: i32,
}

impl AlertRule for LowBatteryRule {
    fn name(&self) -> &'static str {
        "low_battery"
    }

    fn alert_type(&self) -> AlertType {
        AlertType::Battery
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<NewAlert> {
        let battery = ctx.reading.battery;
        if battery > self.low_percent {
            return None;
        }

        let severity = if battery <= self.critical_percent {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };

        Some(NewAlert {
            animal_id: ctx.reading.animal_id,
            alert_type: AlertType::Battery,
            severity,
            title: "Low battery".to_string(),
            message: Some(format!(
                "Tracker {} reports {}% battery.",
                ctx.reading.device_id, battery
            )),
            metadata: json!({
                "battery": battery,
                "threshold": if severity == AlertSeverity::Critical {
                    self.critical_percent
                } else {
                    self.low_percent
                },
                "device_id": ctx.reading.device_id,
            }),
        })
    }
}

/// Body temperature at or above a fever threshold.
#[derive(Debug, Clone)]
pub struct FeverRule {
    pub warning_celsius: f64,
    pub critical_celsius: f64,
}

impl AlertRule for FeverRule {
    fn name(&self) -> &'static str {
        "fever"
    }

    fn alert_type(&self) -> AlertType {
        AlertType::Health
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<NewAlert> {
        let temperature = ctx.reading.temperature?;
        if temperature < self.warning_celsius {
            return None;
        }

        let (severity, threshold) = if temperature >= self.critical_celsius {
            (AlertSeverity::Critical, self.critical_celsius)
        } else {
            (AlertSeverity::Warning, self.warning_celsius)
        };

        Some(NewAlert {
            animal_id: ctx.reading.animal_id,
            alert_type: AlertType::Health,
            severity,
            title: "Elevated temperature".to_string(),
            message: Some(format!(
                "Body temperature {temperature:.1} °C is at or above {threshold:.1} °C."
            )),
            metadata: json!({
                "temperature": temperature,
                "threshold": threshold,
            }),
        })
    }
}

/// Sustained drop of activity below the animal's own baseline.
///
/// The current window runs from [`ActivityHistory::recent_start`] to the new
/// reading. It fires only when every reading in that window, the new one
/// included, sits below `(1 - drop_ratio)` of the baseline mean, so a short
/// rest between bouts of grazing never counts.
#[derive(Debug, Clone)]
pub struct ActivityDropRule {
    pub min_baseline_samples: i64,
    pub drop_ratio: f64,
}

impl AlertRule for ActivityDropRule {
    fn name(&self) -> &'static str {
        "activity_drop"
    }

    fn alert_type(&self) -> AlertType {
        AlertType::Health
    }

    fn needs_history(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<NewAlert> {
        let history = ctx.activity?;
        let reading = ctx.reading;
        let baseline = history.baseline;
        let recent = history.recent;

        if baseline.samples < self.min_baseline_samples || baseline.mean <= 0.0 {
            return None;
        }

        // The window must be observed from its start, not just at its end.
        let window = reading.time - history.recent_start;
        let earliest = recent.earliest.unwrap_or(reading.time);
        if earliest - history.recent_start > window / 4 {
            return None;
        }

        let threshold = (1.0 - self.drop_ratio) * baseline.mean;
        let peak = recent.max.max(reading.activity);
        if peak >= threshold {
            return None;
        }

        let samples = recent.samples + 1;
        let current = (recent.mean * recent.samples as f64 + reading.activity) / samples as f64;
        let drop_percent = ((1.0 - current / baseline.mean) * 100.0).round() as i64;
        let duration_minutes = (reading.time - earliest).num_minutes();

        Some(NewAlert {
            animal_id: reading.animal_id,
            alert_type: AlertType::Health,
            severity: AlertSeverity::Warning,
            title: "Reduced activity".to_string(),
            message: Some(format!(
                "Activity {drop_percent}% below baseline for {duration_minutes} minutes \
                 ({current:.2} g vs {:.2} g).",
                baseline.mean
            )),
            metadata: json!({
                "current_activity": current,
                "peak_activity": peak,
                "baseline": baseline.mean,
                "drop_percent": drop_percent,
                "baseline_samples": baseline.samples,
                "recent_samples": samples,
                "duration_minutes": duration_minutes,
            }),
        })
    }
}

/// The rules applied during ingestion, in evaluation order.
pub struct RuleSet {
    rules: Vec<Box<dyn AlertRule>>,
    baseline_window: Duration,
    recent_window: Duration,
}

impl RuleSet {
    pub fn new(
        rules: Vec<Box<dyn AlertRule>>,
        baseline_window: Duration,
        recent_window: Duration,
    ) -> Self {
        Self {
            rules,
            baseline_window,
            recent_window,
        }
    }

    /// A rule set that never raises anything.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::hours(1), Duration::minutes(30))
    }

    /// The built-in rules with thresholds from configuration.
    pub fn from_config(config: &RulesConfig) -> Self {
        let rules: Vec<Box<dyn AlertRule>> = vec![
            Box::new(FeverRule {
                warning_celsius: config.fever_celsius,
                critical_celsius: config.fever_critical_celsius,
            }),
            Box::new(ActivityDropRule {
                min_baseline_samples: config.baseline_min_samples,
                drop_ratio: config.activity_drop_ratio,
            }),
            Box::new(LowBatteryRule {
                low_percent: config.battery_low_percent,
                critical_percent: config.battery_critical_percent,
            }),
        ];
        Self::new(
            rules,
            Duration::hours(config.baseline_hours),
            Duration::minutes(config.recent_minutes),
        )
    }

    /// Start of the baseline and of the current window for a reading at `at`.
    pub fn activity_windows(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (at - self.baseline_window, at - self.recent_window)
    }

    /// Whether any rule that reads activity history can still fire, given the
    /// alert types the animal already has open.
    pub fn needs_activity_history(&self, open_types: &[AlertType]) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.needs_history() && !open_types.contains(&rule.alert_type()))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule and collect the alerts to create.
    ///
    /// `open_types` lists the alert types the animal already has unresolved.
    /// At most one alert per type is returned, and none for an open type.
    pub fn evaluate(&self, ctx: &RuleContext<'_>, open_types: &[AlertType]) -> Vec<NewAlert> {
        let mut raised: Vec<NewAlert> = Vec::new();

        for rule in &self.rules {
            let alert_type = rule.alert_type();
            if open_types.contains(&alert_type) || raised.iter().any(|a| a.alert_type == alert_type)
            {
                continue;
            }

            if let Some(alert) = rule.evaluate(ctx) {
                tracing::debug!(
                    rule = rule.name(),
                    animal_id = alert.animal_id,
                    severity = alert.severity.as_str(),
                    "Rule fired"
                );
                raised.push(alert);
            }
        }

        raised
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::from_config(&RulesConfig::default())
    }
}
