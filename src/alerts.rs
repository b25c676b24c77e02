//! Alert engine: creation, lifecycle transitions and listing.
//!
//! ```text
//!   (none) --create--> TRIGGERED --acknowledge--> ACKNOWLEDGED --resolve--> RESOLVED
//!                          \-------------------------resolve------------------>/
//! ```
//!
//! Transitions are computed on [`Lifecycle`] values first and then written with
//! a compare-and-set on the stored lifecycle columns. If another request moved
//! the alert in between, the write is refused and the transition is evaluated
//! again against the fresh state, so two concurrent transitions can never both
//! leave the same precondition state.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::error::CoreError;
use crate::model::{
    Acknowledgement, Alert, AlertList, AlertListQuery, AlertResponse, AlertSeverity, AlertState,
    AlertType, AlertUpdate, Lifecycle, NewAlert,
};
use crate::storage::{self, Storage};

/// Largest page of alerts a caller may ask for.
pub const MAX_LIST_LIMIT: i64 = 200;

/// Compare-and-set attempts before a transition gives up.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

impl Lifecycle {
    /// Acknowledge from `triggered`, or overwrite an existing acknowledgement.
    pub fn acknowledge(
        &self,
        triggered_at: DateTime<Utc>,
        ack: Acknowledgement,
    ) -> Result<Lifecycle, CoreError> {
        if ack.at < triggered_at {
            return Err(CoreError::InvalidTimestamp(format!(
                "acknowledged_at {} precedes triggered_at {}",
                ack.at, triggered_at
            )));
        }

        match self {
            Lifecycle::Triggered | Lifecycle::Acknowledged(_) => Ok(Lifecycle::Acknowledged(ack)),
            Lifecycle::Resolved { resolved_at, .. } if ack.at < *resolved_at => {
                Err(CoreError::InvalidTimestamp(format!(
                    "acknowledged_at {} precedes resolved_at {}",
                    ack.at, resolved_at
                )))
            }
            Lifecycle::Resolved { .. } => Err(CoreError::InvalidStateTransition {
                action: "acknowledge",
                state: AlertState::Resolved,
            }),
        }
    }

    /// Resolve from `triggered` or `acknowledged`. Resolving again with an equal
    /// or later timestamp leaves the alert untouched.
    pub fn resolve(
        &self,
        triggered_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Lifecycle, CoreError> {
        if at < triggered_at {
            return Err(CoreError::InvalidTimestamp(format!(
                "resolved_at {at} precedes triggered_at {triggered_at}"
            )));
        }

        match self {
            Lifecycle::Triggered => Ok(Lifecycle::Resolved {
                acknowledgement: None,
                resolved_at: at,
            }),
            Lifecycle::Acknowledged(ack) if at < ack.at => Err(CoreError::InvalidTimestamp(
                format!("resolved_at {at} precedes acknowledged_at {}", ack.at),
            )),
            Lifecycle::Acknowledged(ack) => Ok(Lifecycle::Resolved {
                acknowledgement: Some(*ack),
                resolved_at: at,
            }),
            Lifecycle::Resolved { resolved_at, .. } if at < *resolved_at => {
                Err(CoreError::InvalidTimestamp(format!(
                    "resolved_at {at} precedes the recorded resolution {resolved_at}"
                )))
            }
            Lifecycle::Resolved { .. } => Ok(*self),
        }
    }

    /// Apply a partial update: acknowledgement fields first, then resolution.
    ///
    /// `acknowledged_by` alone keeps the recorded acknowledgement time, or uses
    /// `now` when there is none. An acknowledgement identical to the recorded
    /// one changes nothing.
    pub fn apply(
        &self,
        triggered_at: DateTime<Utc>,
        update: &AlertUpdate,
        now: DateTime<Utc>,
    ) -> Result<Lifecycle, CoreError> {
        let mut next = *self;

        if update.acknowledged_at.is_some() || update.acknowledged_by.is_some() {
            let existing = self.acknowledgement();
            let requested = Acknowledgement {
                at: update
                    .acknowledged_at
                    .or(existing.map(|a| a.at))
                    .unwrap_or(now),
                by: update.acknowledged_by.or(existing.and_then(|a| a.by)),
            };
            if existing != Some(requested) {
                next = next.acknowledge(triggered_at, requested)?;
            }
        }

        if let Some(at) = update.resolved_at {
            next = next.resolve(triggered_at, at)?;
        }

        Ok(next)
    }
}

/// Persist a triggered alert on an open connection or transaction.
pub async fn create_alert_in(
    conn: &mut SqliteConnection,
    alert: &NewAlert,
    now: DateTime<Utc>,
) -> Result<Alert, CoreError> {
    if storage::get_animal(conn, alert.animal_id).await?.is_none() {
        return Err(CoreError::UnknownAnimal(alert.animal_id));
    }

    let created = storage::insert_alert(conn, alert, now).await?;

    info!(
        alert_id = created.id,
        animal_id = created.animal_id,
        alert_type = created.alert_type.as_str(),
        severity = created.severity.as_str(),
        "Alert triggered"
    );

    Ok(created)
}

/// Create a triggered alert with `triggered_at = now`.
///
/// The engine does not deduplicate; callers that want one open alert per
/// condition check before creating.
#[instrument(skip(storage, alert), fields(animal_id = alert.animal_id))]
pub async fn create_alert(
    storage: &Storage,
    alert: &NewAlert,
    now: DateTime<Utc>,
) -> Result<Alert, CoreError> {
    let now = storage::truncate_to_micros(now)?;
    let mut conn = storage.acquire().await?;
    create_alert_in(&mut conn, alert, now).await
}

/// Fetch one alert.
#[instrument(skip(storage))]
pub async fn get_alert(storage: &Storage, alert_id: i64) -> Result<AlertResponse, CoreError> {
    let mut conn = storage.acquire().await?;
    let (alert, animal_name) = storage::get_alert(&mut conn, alert_id)
        .await?
        .ok_or(CoreError::NotFound(alert_id))?;
    Ok(AlertResponse::new(alert, animal_name))
}

/// Acknowledge an alert on behalf of `actor`.
pub async fn acknowledge(
    storage: &Storage,
    alert_id: i64,
    actor: Option<i64>,
    at: DateTime<Utc>,
) -> Result<AlertResponse, CoreError> {
    let update = AlertUpdate {
        acknowledged_at: Some(at),
        acknowledged_by: actor,
        resolved_at: None,
    };
    update_alert(storage, alert_id, &update, at).await
}

/// Resolve an alert.
pub async fn resolve(
    storage: &Storage,
    alert_id: i64,
    at: DateTime<Utc>,
) -> Result<AlertResponse, CoreError> {
    let update = AlertUpdate {
        resolved_at: Some(at),
        ..Default::default()
    };
    update_alert(storage, alert_id, &update, at).await
}

/// Apply a partial lifecycle update to an alert.
///
/// # Arguments
///
/// * `alert_id` - The alert to update
/// * `update` - Supplied fields only; absent fields are left as they are
/// * `now` - Server time, used when an actor is given without a timestamp
#[instrument(skip(storage, update))]
pub async fn update_alert(
    storage: &Storage,
    alert_id: i64,
    update: &AlertUpdate,
    now: DateTime<Utc>,
) -> Result<AlertResponse, CoreError> {
    let update = AlertUpdate {
        acknowledged_at: update
            .acknowledged_at
            .map(storage::truncate_to_micros)
            .transpose()?,
        acknowledged_by: update.acknowledged_by,
        resolved_at: update.resolved_at.map(storage::truncate_to_micros).transpose()?,
    };
    let now = storage::truncate_to_micros(now)?;

    let mut conn = storage.acquire().await?;

    for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
        let planned = plan_transition(&mut conn, alert_id, &update, now).await?;
        if let Some(view) = commit_transition(&mut conn, planned).await? {
            return Ok(view);
        }

        warn!(alert_id, attempt, "Alert changed concurrently, re-evaluating");
    }

    Err(CoreError::Internal(anyhow::anyhow!(
        "alert {alert_id} kept changing during update"
    )))
}

/// A lifecycle change computed against one observed state of an alert.
struct PlannedTransition {
    alert: Alert,
    animal_name: Option<String>,
    next: Lifecycle,
}

/// Read the alert and compute where `update` takes it.
async fn plan_transition(
    conn: &mut SqliteConnection,
    alert_id: i64,
    update: &AlertUpdate,
    now: DateTime<Utc>,
) -> Result<PlannedTransition, CoreError> {
    let (alert, animal_name) = storage::get_alert(conn, alert_id)
        .await?
        .ok_or(CoreError::NotFound(alert_id))?;
    let next = alert.lifecycle.apply(alert.triggered_at, update, now)?;

    Ok(PlannedTransition {
        alert,
        animal_name,
        next,
    })
}

/// Write a planned transition if the alert still holds the state it was
/// planned against. `None` means another writer moved it first.
async fn commit_transition(
    conn: &mut SqliteConnection,
    planned: PlannedTransition,
) -> Result<Option<AlertResponse>, CoreError> {
    let PlannedTransition {
        alert,
        animal_name,
        next,
    } = planned;

    if next == alert.lifecycle {
        return Ok(Some(AlertResponse::new(alert, animal_name)));
    }

    if !storage::compare_and_set_lifecycle(conn, alert.id, &alert.lifecycle, &next).await? {
        return Ok(None);
    }

    info!(
        alert_id = alert.id,
        from = alert.lifecycle.state().as_str(),
        to = next.state().as_str(),
        "Alert updated"
    );

    Ok(Some(AlertResponse::new(
        Alert {
            lifecycle: next,
            ..alert
        },
        animal_name,
    )))
}

/// List alerts, unresolved first and newest first within each group, with
/// the system-wide count of unresolved alerts.
#[instrument(skip(storage))]
pub async fn list_alerts(
    storage: &Storage,
    query: &AlertListQuery,
) -> Result<AlertList, CoreError> {
    if !(1..=MAX_LIST_LIMIT).contains(&query.limit) {
        return Err(CoreError::Validation(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}, got {}",
            query.limit
        )));
    }

    let mut conn = storage.acquire().await?;
    let rows = storage::list_alerts(&mut conn, query).await?;
    let unresolved_count = storage::count_unresolved_alerts(&mut conn).await?;

    let alerts: Vec<AlertResponse> = rows
        .into_iter()
        .map(|(alert, animal_name)| AlertResponse::new(alert, animal_name))
        .collect();

    Ok(AlertList {
        total: alerts.len(),
        alerts,
        unresolved_count,
    })
}

/// Resolve every open alert of `alert_type` for an animal, at `at` or at the
/// earliest time the alert's history allows. Returns how many were resolved.
pub async fn resolve_open_alerts_in(
    conn: &mut SqliteConnection,
    animal_id: i64,
    alert_type: AlertType,
    at: DateTime<Utc>,
) -> Result<usize, CoreError> {
    let open = storage::open_alerts_for_animal(conn, animal_id, Some(alert_type)).await?;
    let mut resolved = 0;

    for alert in open {
        let at = [
            Some(at),
            Some(alert.triggered_at),
            alert.lifecycle.acknowledgement().map(|a| a.at),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(at);

        let next = alert.lifecycle.resolve(alert.triggered_at, at)?;
        if storage::compare_and_set_lifecycle(conn, alert.id, &alert.lifecycle, &next).await? {
            info!(
                alert_id = alert.id,
                animal_id,
                alert_type = alert_type.as_str(),
                "Alert auto-resolved"
            );
            resolved += 1;
        }
    }

    Ok(resolved)
}

/// Raise an offline alert for every active animal whose tracker has been
/// silent for longer than `timeout`. Animals that already have an open
/// offline alert are skipped.
#[instrument(skip(storage))]
pub async fn sweep_offline(
    storage: &Storage,
    timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<AlertResponse>, CoreError> {
    let now = storage::truncate_to_micros(now)?;
    let mut conn = storage.acquire().await?;

    let silent = storage::silent_animals(&mut conn, now - timeout).await?;
    let mut created = Vec::new();

    for (animal, last_seen) in silent {
        let device_id = animal.assigned_device.clone().unwrap_or_default();
        let silent_minutes = (now - last_seen).num_minutes();

        let alert = NewAlert {
            animal_id: animal.id,
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Warning,
            title: "Tracker silent".to_string(),
            message: Some(format!(
                "No reading from {device_id} for {silent_minutes} minutes (last seen {}).",
                last_seen.to_rfc3339()
            )),
            metadata: json!({
                "device_id": device_id,
                "last_seen": last_seen,
                "silent_minutes": silent_minutes,
            }),
        };

        if let Some(alert) = storage::insert_alert_if_none_open(&mut conn, &alert, now).await? {
            info!(
                alert_id = alert.id,
                animal_id = animal.id,
                silent_minutes,
                "Offline alert triggered"
            );
            created.push(AlertResponse::new(alert, Some(animal.name)));
        }
    }

    Ok(created)
}
