//! Ingestion pipeline for one inbound tracker reading.
//!
//! Steps, all or nothing:
//!
//! 1. Validate the request ranges
//! 2. Resolve the device to its active animal
//! 3. Classify the activity magnitude
//! 4. Append the reading at server time
//! 5. Close open offline alerts for the animal and evaluate the alert rules
//!
//! Steps 4 and 5 share one transaction. Any failure rolls everything back.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::alerts;
use crate::error::CoreError;
use crate::model::{ActivityState, Alert, AlertType, Reading, ReadingRequest};
use crate::registry;
use crate::rules::{ActivityHistory, RuleContext, RuleSet};
use crate::storage::{self, Storage};

pub const MAX_DEVICE_ID_LEN: usize = 50;

/// Result of a successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The reading as persisted.
    pub reading: Reading,

    /// Alerts raised by the rules for this reading.
    pub alerts: Vec<Alert>,

    /// Offline alerts closed because the device reported again.
    pub resolved_offline: usize,
}

fn check_range<T>(field: &str, value: T, min: T, max: T) -> Result<(), CoreError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

/// Reject malformed or physically implausible input.
pub fn validate(request: &ReadingRequest) -> Result<(), CoreError> {
    let device_id = request.device_id.trim();
    if device_id.is_empty() {
        return Err(CoreError::Validation("device_id must not be empty".to_string()));
    }
    if device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(CoreError::Validation(format!(
            "device_id must be at most {MAX_DEVICE_ID_LEN} characters"
        )));
    }

    check_range("latitude", request.latitude, -90.0, 90.0)?;
    check_range("longitude", request.longitude, -180.0, 180.0)?;
    if let Some(altitude) = request.altitude {
        check_range("altitude", altitude, -500.0, 9000.0)?;
    }
    if let Some(speed) = request.speed {
        check_range("speed", speed, 0.0, 100.0)?;
    }
    if let Some(satellites) = request.satellites {
        check_range("satellites", satellites, 0, 50)?;
    }
    check_range("activity", request.activity, 0.0, 20.0)?;
    if let Some(temperature) = request.temperature {
        check_range("temperature", temperature, 35.0, 45.0)?;
    }
    check_range("battery", request.battery, 0, 100)?;

    Ok(())
}

/// Ingest one reading received at `now`.
///
/// # Arguments
///
/// * `storage` - Storage handle; connections are scoped to this call
/// * `rules` - Alert rules evaluated against the new reading
/// * `request` - The tracker payload
/// * `now` - Server receive time, used as the reading's timestamp
#[instrument(skip(storage, rules, request), fields(device_id = %request.device_id))]
pub async fn ingest_reading(
    storage: &Storage,
    rules: &RuleSet,
    request: ReadingRequest,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, CoreError> {
    validate(&request)?;

    let device_id = request.device_id.trim().to_string();

    let animal = {
        let mut conn = storage.acquire().await?;
        match registry::resolve_device(&mut conn, &device_id).await {
            Ok(animal) => animal,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Reading rejected");
                return Err(e);
            }
        }
    };

    let reading = Reading {
        animal_id: animal.id,
        time: storage::truncate_to_micros(now)?,
        device_id,
        latitude: request.latitude,
        longitude: request.longitude,
        altitude: request.altitude,
        speed: request.speed,
        satellites: request.satellites,
        activity: request.activity,
        activity_state: ActivityState::from_magnitude(request.activity),
        temperature: request.temperature,
        battery: request.battery,
        signal_strength: request.signal_strength,
    };

    let mut tx = storage.begin().await?;

    // First statement is a write, so the transaction takes the write lock up front.
    storage::insert_reading(&mut tx, &reading).await?;

    let resolved_offline =
        alerts::resolve_open_alerts_in(&mut tx, animal.id, AlertType::Offline, reading.time)
            .await?;

    let mut raised = Vec::new();
    if !rules.is_empty() {
        let open_types: Vec<AlertType> = storage::open_alerts_for_animal(&mut tx, animal.id, None)
            .await?
            .into_iter()
            .map(|alert| alert.alert_type)
            .collect();

        let activity = if rules.needs_activity_history(&open_types) {
            let (baseline_start, recent_start) = rules.activity_windows(reading.time);
            Some(ActivityHistory {
                baseline: storage::activity_stats(&mut tx, animal.id, baseline_start, recent_start)
                    .await?,
                recent: storage::activity_stats(&mut tx, animal.id, recent_start, reading.time)
                    .await?,
                recent_start,
            })
        } else {
            None
        };

        let ctx = RuleContext {
            reading: &reading,
            activity,
        };
        for candidate in rules.evaluate(&ctx, &open_types) {
            if let Some(alert) =
                storage::insert_alert_if_none_open(&mut tx, &candidate, reading.time).await?
            {
                info!(
                    alert_id = alert.id,
                    animal_id = alert.animal_id,
                    alert_type = alert.alert_type.as_str(),
                    severity = alert.severity.as_str(),
                    "Alert triggered"
                );
                raised.push(alert);
            }
        }
    }

    tx.commit().await?;

    info!(
        animal_id = animal.id,
        activity_state = reading.activity_state.as_str(),
        battery = reading.battery,
        alerts = raised.len(),
        resolved_offline,
        "Reading recorded"
    );

    Ok(IngestOutcome {
        reading,
        alerts: raised,
        resolved_offline,
    })
}
