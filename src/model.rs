//! Data models for Herdwatch.
//!
//! # Ownership
//!
//! - [`Animal`] records belong to the registry. The ingestion core only reads them.
//! - [`Reading`] records are immutable once appended and belong to their animal.
//! - [`Alert`] records are mutable only through the lifecycle transitions in
//!   [`crate::alerts`].
//!
//! All timestamps are UTC. Reading times are always assigned by the server at
//! ingestion, never taken from the device.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational status of an animal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimalStatus {
    Active,
    Sick,
    Sold,
    Deceased,
}

impl AnimalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnimalStatus::Active => "active",
            AnimalStatus::Sick => "sick",
            AnimalStatus::Sold => "sold",
            AnimalStatus::Deceased => "deceased",
        }
    }
}

impl FromStr for AnimalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AnimalStatus::Active),
            "sick" => Ok(AnimalStatus::Sick),
            "sold" => Ok(AnimalStatus::Sold),
            "deceased" => Ok(AnimalStatus::Deceased),
            other => Err(anyhow::anyhow!("unknown animal status '{other}'")),
        }
    }
}

/// A tracked animal, as seen by the ingestion core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Animal {
    pub id: i64,
    pub name: String,

    /// Identifier of the tracker currently worn by the animal, if any.
    pub assigned_device: Option<String>,

    pub status: AnimalStatus,
}

/// Fields needed to register an animal. Used by seeding and tests; animal
/// management proper lives outside this service.
#[derive(Debug, Clone)]
pub struct NewAnimal {
    pub name: String,
    pub assigned_device: Option<String>,
    pub status: AnimalStatus,
}

/// Behavioral state derived from the accelerometer magnitude of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Resting or lying down.
    Lying,
    Standing,
    Walking,
    Running,
}

impl ActivityState {
    /// Classify an activity magnitude (g-equivalent units).
    ///
    /// # Thresholds
    ///
    /// - `lying`: [0, 0.5)
    /// - `standing`: [0.5, 1.2)
    /// - `walking`: [1.2, 2.5)
    /// - `running`: [2.5, ∞)
    ///
    /// Lower edges are inclusive, upper edges exclusive. The mapping is pure and
    /// keeps no history, so it can be reused for backfills.
    pub fn from_magnitude(magnitude: f64) -> Self {
        if magnitude < 0.5 {
            ActivityState::Lying
        } else if magnitude < 1.2 {
            ActivityState::Standing
        } else if magnitude < 2.5 {
            ActivityState::Walking
        } else {
            ActivityState::Running
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Lying => "lying",
            ActivityState::Standing => "standing",
            ActivityState::Walking => "walking",
            ActivityState::Running => "running",
        }
    }
}

impl FromStr for ActivityState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lying" => Ok(ActivityState::Lying),
            "standing" => Ok(ActivityState::Standing),
            "walking" => Ok(ActivityState::Walking),
            "running" => Ok(ActivityState::Running),
            other => Err(anyhow::anyhow!("unknown activity state '{other}'")),
        }
    }
}

/// One persisted sensor report, keyed by `(animal_id, time)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub animal_id: i64,

    /// Server-side ingestion time (UTC, microsecond precision).
    pub time: DateTime<Utc>,

    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub satellites: Option<i32>,

    /// Accelerometer magnitude in g.
    pub activity: f64,
    pub activity_state: ActivityState,

    /// Body temperature in °C.
    pub temperature: Option<f64>,

    /// Battery level in percent.
    pub battery: i32,

    /// Radio signal strength in dBm.
    pub signal_strength: Option<i32>,
}

/// Aggregate of one animal's activity over a time range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActivityStats {
    pub samples: i64,
    pub mean: f64,
    pub max: f64,

    /// Time of the oldest reading in the range.
    pub earliest: Option<DateTime<Utc>>,
}

/// Request body for POST /api/v1/telemetry, as sent by a tracker.
///
/// Integers are accepted as signed so that out-of-range values reach
/// validation instead of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingRequest {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub satellites: Option<i32>,
    pub activity: f64,
    pub temperature: Option<f64>,
    pub battery: i32,
    pub signal_strength: Option<i32>,
}

/// Most recent position of one animal, for the live map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestPosition {
    pub animal_id: i64,
    pub animal_name: String,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub activity: f64,
    pub activity_state: ActivityState,
    pub battery: i32,
    pub last_update: DateTime<Utc>,
}

/// Query parameters for GET /api/v1/telemetry/latest.
#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    /// Maximum number of animals returned (1-100, default: 10).
    #[serde(default = "default_latest_limit")]
    pub limit: i64,

    /// Restrict the result to a single animal.
    pub animal_id: Option<i64>,
}

fn default_latest_limit() -> i64 {
    10
}

/// Query parameters for GET /api/v1/telemetry/history/:animal_id.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Lookback window in hours (1-168, default: 24).
    #[serde(default = "default_history_hours")]
    pub hours: i64,
}

fn default_history_hours() -> i64 {
    24
}

/// Kind of anomaly an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Health,
    Geofence,
    Battery,
    Offline,
    Custom,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Health => "health",
            AlertType::Geofence => "geofence",
            AlertType::Battery => "battery",
            AlertType::Offline => "offline",
            AlertType::Custom => "custom",
        }
    }
}

impl FromStr for AlertType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "health" => Ok(AlertType::Health),
            "geofence" => Ok(AlertType::Geofence),
            "battery" => Ok(AlertType::Battery),
            "offline" => Ok(AlertType::Offline),
            "custom" => Ok(AlertType::Custom),
            other => Err(anyhow::anyhow!("unknown alert type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(anyhow::anyhow!("unknown alert severity '{other}'")),
        }
    }
}

/// Lifecycle stage of an alert, without the associated timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Triggered,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Triggered => "triggered",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(AlertState::Triggered),
            "acknowledged" => Ok(AlertState::Acknowledged),
            "resolved" => Ok(AlertState::Resolved),
            other => Err(anyhow::anyhow!("unknown alert state '{other}'")),
        }
    }
}

/// Who acknowledged an alert, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub at: DateTime<Utc>,
    pub by: Option<i64>,
}

/// Explicit lifecycle of an alert. Earlier stages are kept as history on later
/// ones, so a resolved alert still knows whether it was acknowledged.
///
/// Transitions are implemented in [`crate::alerts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Triggered,
    Acknowledged(Acknowledgement),
    Resolved {
        acknowledgement: Option<Acknowledgement>,
        resolved_at: DateTime<Utc>,
    },
}

impl Lifecycle {
    pub fn state(&self) -> AlertState {
        match self {
            Lifecycle::Triggered => AlertState::Triggered,
            Lifecycle::Acknowledged(_) => AlertState::Acknowledged,
            Lifecycle::Resolved { .. } => AlertState::Resolved,
        }
    }

    pub fn acknowledgement(&self) -> Option<Acknowledgement> {
        match self {
            Lifecycle::Triggered => None,
            Lifecycle::Acknowledged(ack) => Some(*ack),
            Lifecycle::Resolved {
                acknowledgement, ..
            } => *acknowledgement,
        }
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Resolved { resolved_at, .. } => Some(*resolved_at),
            _ => None,
        }
    }
}

/// A detected anomaly for one animal.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: i64,
    pub animal_id: i64,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: Option<String>,

    /// Evidence captured by the rule that fired (observed vs. baseline values).
    pub metadata: serde_json::Value,

    pub triggered_at: DateTime<Utc>,
    pub lifecycle: Lifecycle,
}

/// An alert that a rule wants to raise, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub animal_id: i64,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
}

/// Alert as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct AlertResponse {
    pub id: i64,
    pub animal_id: i64,
    pub animal_name: Option<String>,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
    pub state: AlertState,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertResponse {
    pub fn new(alert: Alert, animal_name: Option<String>) -> Self {
        let acknowledgement = alert.lifecycle.acknowledgement();
        Self {
            id: alert.id,
            animal_id: alert.animal_id,
            animal_name,
            alert_type: alert.alert_type,
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
            metadata: alert.metadata,
            state: alert.lifecycle.state(),
            triggered_at: alert.triggered_at,
            acknowledged_at: acknowledgement.map(|a| a.at),
            acknowledged_by: acknowledgement.and_then(|a| a.by),
            resolved_at: alert.lifecycle.resolved_at(),
        }
    }
}

/// Query parameters for GET /api/v1/alerts.
#[derive(Debug, Default, Deserialize)]
pub struct AlertListQuery {
    /// `true` for resolved alerts only, `false` for unresolved only.
    pub resolved: Option<bool>,
    pub severity: Option<AlertSeverity>,
    pub animal_id: Option<i64>,

    /// Maximum number of alerts returned (1-200, default: 50).
    #[serde(default = "default_alert_limit")]
    pub limit: i64,
}

fn default_alert_limit() -> i64 {
    50
}

/// Response for GET /api/v1/alerts.
#[derive(Debug, Clone, Serialize)]
pub struct AlertList {
    /// Number of alerts in this page.
    pub total: usize,
    pub alerts: Vec<AlertResponse>,

    /// Unresolved alerts across the whole system, ignoring filters and limit.
    pub unresolved_count: i64,
}

/// Request body for PATCH /api/v1/alerts/:alert_id.
///
/// Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertUpdate {
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertUpdate {
    pub fn is_empty(&self) -> bool {
        self.acknowledged_at.is_none()
            && self.acknowledged_by.is_none()
            && self.resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_state_boundaries() {
        let cases = [
            (0.0, ActivityState::Lying),
            (0.4999, ActivityState::Lying),
            (0.5, ActivityState::Standing),
            (1.1999, ActivityState::Standing),
            (1.2, ActivityState::Walking),
            (2.4999, ActivityState::Walking),
            (2.5, ActivityState::Running),
            (10.0, ActivityState::Running),
        ];

        for (magnitude, expected) in cases {
            assert_eq!(
                ActivityState::from_magnitude(magnitude),
                expected,
                "magnitude {magnitude}"
            );
        }
    }

    #[test]
    fn test_activity_state_string_round_trip() {
        for state in [
            ActivityState::Lying,
            ActivityState::Standing,
            ActivityState::Walking,
            ActivityState::Running,
        ] {
            assert_eq!(state.as_str().parse::<ActivityState>().unwrap(), state);
        }
        assert!("sleeping".parse::<ActivityState>().is_err());
    }

    #[test]
    fn test_lifecycle_accessors() {
        let at = Utc::now();
        let ack = Acknowledgement { at, by: Some(7) };

        assert_eq!(Lifecycle::Triggered.state(), AlertState::Triggered);
        assert_eq!(Lifecycle::Triggered.acknowledgement(), None);

        let resolved = Lifecycle::Resolved {
            acknowledgement: Some(ack),
            resolved_at: at,
        };
        assert_eq!(resolved.state(), AlertState::Resolved);
        assert_eq!(resolved.acknowledgement(), Some(ack));
        assert_eq!(resolved.resolved_at(), Some(at));
    }

    #[test]
    fn test_alert_response_flattens_lifecycle() {
        let at = Utc::now();
        let alert = Alert {
            id: 1,
            animal_id: 2,
            alert_type: AlertType::Battery,
            severity: AlertSeverity::Warning,
            title: "Low battery".to_string(),
            message: None,
            metadata: serde_json::json!({ "battery": 12 }),
            triggered_at: at,
            lifecycle: Lifecycle::Acknowledged(Acknowledgement { at, by: Some(3) }),
        };

        let body = serde_json::to_value(AlertResponse::new(alert, Some("Bella".into()))).unwrap();

        assert_eq!(body["type"], "battery");
        assert_eq!(body["state"], "acknowledged");
        assert_eq!(body["acknowledged_by"], 3);
        assert!(body["resolved_at"].is_null());
        assert_eq!(body["animal_name"], "Bella");
    }

    #[test]
    fn test_alert_update_is_empty() {
        assert!(AlertUpdate::default().is_empty());
        assert!(
            !AlertUpdate {
                acknowledged_by: Some(1),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
