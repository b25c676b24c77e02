//! SQLite storage layer for Herdwatch.
//!
//! # Schema
//!
//! - `animals`: registry rows read by device lookup
//! - `telemetry`: immutable readings, primary key `(animal_id, time)`
//! - `latest_readings`: animal → time of its newest reading, kept in step with
//!   every append so "latest per animal" never scans the series
//! - `alerts`: anomalies with an explicit `state` and the lifecycle timestamps
//!
//! Times are stored as integer microseconds since the Unix epoch.
//!
//! # Connections
//!
//! [`Storage`] owns the pool. Query functions take a `&mut SqliteConnection`
//! so callers decide the scope: a pooled connection for a single read, or a
//! transaction for a multi-step write. Connections go back to the pool on drop.

use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};

use crate::model::{
    Acknowledgement, ActivityState, ActivityStats, Alert, AlertListQuery, AlertState, AlertType,
    Animal, LatestPosition, Lifecycle, NewAlert, NewAnimal, Reading,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS animals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        assigned_device TEXT,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'sick', 'sold', 'deceased'))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_animals_assigned_device
    ON animals(assigned_device, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS telemetry (
        animal_id INTEGER NOT NULL REFERENCES animals(id) ON DELETE CASCADE,
        time INTEGER NOT NULL,
        device_id TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        altitude REAL,
        speed REAL,
        satellites INTEGER,
        activity REAL NOT NULL,
        activity_state TEXT NOT NULL,
        temperature REAL,
        battery_level INTEGER NOT NULL,
        signal_strength INTEGER,
        PRIMARY KEY (animal_id, time)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_telemetry_device_id
    ON telemetry(device_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS latest_readings (
        animal_id INTEGER PRIMARY KEY REFERENCES animals(id) ON DELETE CASCADE,
        time INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        animal_id INTEGER NOT NULL REFERENCES animals(id) ON DELETE CASCADE,
        alert_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        state TEXT NOT NULL,
        triggered_at INTEGER NOT NULL,
        acknowledged_at INTEGER,
        acknowledged_by INTEGER,
        resolved_at INTEGER
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_alerts_resolved_triggered
    ON alerts(resolved_at, triggered_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_alerts_animal_type
    ON alerts(animal_id, alert_type)
    "#,
];

const ALERT_COLUMNS: &str = "al.id, al.animal_id, al.alert_type, al.severity, al.title, \
     al.message, al.metadata, al.state, al.triggered_at, al.acknowledged_at, \
     al.acknowledged_by, al.resolved_at";

const READING_COLUMNS: &str = "t.animal_id, t.time, t.device_id, t.latitude, t.longitude, \
     t.altitude, t.speed, t.satellites, t.activity, t.activity_state, t.temperature, \
     t.battery_level, t.signal_strength";

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:herdwatch.db" or
    ///   "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives in a single shared connection.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Check out one connection for the duration of a request.
    pub async fn acquire(&self) -> anyhow::Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Start a transaction. It rolls back unless committed.
    pub async fn begin(&self) -> anyhow::Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Round trip to the database.
    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub fn from_micros(micros: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("timestamp out of range: {micros}"))
}

/// Drop sub-microsecond precision so a value survives a storage round trip.
pub fn truncate_to_micros(time: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    from_micros(to_micros(time))
}

fn opt_from_micros(micros: Option<i64>) -> anyhow::Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

// ============================================================================
// Animals
// ============================================================================

/// Register an animal.
pub async fn insert_animal(
    conn: &mut SqliteConnection,
    animal: &NewAnimal,
) -> anyhow::Result<Animal> {
    let result = sqlx::query(
        r#"
        INSERT INTO animals (name, assigned_device, status)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(&animal.name)
    .bind(&animal.assigned_device)
    .bind(animal.status.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(Animal {
        id: result.last_insert_rowid(),
        name: animal.name.clone(),
        assigned_device: animal.assigned_device.clone(),
        status: animal.status,
    })
}

pub async fn get_animal(
    conn: &mut SqliteConnection,
    animal_id: i64,
) -> anyhow::Result<Option<Animal>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, assigned_device, status
        FROM animals
        WHERE id = ?
        "#,
    )
    .bind(animal_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(animal_from_row).transpose()
}

/// Every `active` animal currently wearing `device_id`.
pub async fn find_active_animals_by_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> anyhow::Result<Vec<Animal>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, assigned_device, status
        FROM animals
        WHERE assigned_device = ? AND status = 'active'
        ORDER BY id
        "#,
    )
    .bind(device_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(animal_from_row).collect()
}

fn animal_from_row(row: &SqliteRow) -> anyhow::Result<Animal> {
    let status: String = row.try_get("status")?;
    Ok(Animal {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        assigned_device: row.try_get("assigned_device")?,
        status: status.parse()?,
    })
}

// ============================================================================
// Telemetry
// ============================================================================

/// Append one reading and move the animal's latest-reading pointer.
///
/// A reading with the same `(animal_id, time)` as a stored one replaces it
/// (last write wins). The pointer advances on equal times too, so it always
/// names the most recently written reading.
///
/// Run this inside a transaction so both writes land together.
pub async fn insert_reading(conn: &mut SqliteConnection, reading: &Reading) -> anyhow::Result<()> {
    let time = to_micros(reading.time);

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO telemetry (
            animal_id, time, device_id, latitude, longitude, altitude, speed,
            satellites, activity, activity_state, temperature, battery_level,
            signal_strength
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(reading.animal_id)
    .bind(time)
    .bind(&reading.device_id)
    .bind(reading.latitude)
    .bind(reading.longitude)
    .bind(reading.altitude)
    .bind(reading.speed)
    .bind(reading.satellites)
    .bind(reading.activity)
    .bind(reading.activity_state.as_str())
    .bind(reading.temperature)
    .bind(reading.battery)
    .bind(reading.signal_strength)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO latest_readings (animal_id, time)
        VALUES (?, ?)
        ON CONFLICT(animal_id) DO UPDATE SET time = excluded.time
        WHERE excluded.time >= latest_readings.time
        "#,
    )
    .bind(reading.animal_id)
    .bind(time)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Newest reading of every animal (or of one), most recently updated first.
pub async fn latest_positions(
    conn: &mut SqliteConnection,
    animal_id: Option<i64>,
    limit: i64,
) -> anyhow::Result<Vec<LatestPosition>> {
    let rows = sqlx::query(
        r#"
        SELECT t.animal_id, a.name AS animal_name, t.device_id, t.latitude,
               t.longitude, t.activity, t.activity_state, t.battery_level, t.time
        FROM latest_readings l
        JOIN telemetry t ON t.animal_id = l.animal_id AND t.time = l.time
        JOIN animals a ON a.id = l.animal_id
        WHERE (?1 IS NULL OR l.animal_id = ?1)
        ORDER BY t.time DESC, t.animal_id ASC
        LIMIT ?2
        "#,
    )
    .bind(animal_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> anyhow::Result<LatestPosition> {
            let state: String = row.try_get("activity_state")?;
            Ok(LatestPosition {
                animal_id: row.try_get("animal_id")?,
                animal_name: row.try_get("animal_name")?,
                device_id: row.try_get("device_id")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                activity: row.try_get("activity")?,
                activity_state: state.parse()?,
                battery: row.try_get("battery_level")?,
                last_update: from_micros(row.try_get("time")?)?,
            })
        })
        .collect()
}

/// Readings of one animal with `since <= time`, and `time < before` when given,
/// in ascending time order.
pub async fn readings_between(
    conn: &mut SqliteConnection,
    animal_id: i64,
    since: DateTime<Utc>,
    before: Option<DateTime<Utc>>,
) -> anyhow::Result<Vec<Reading>> {
    let sql = format!(
        r#"
        SELECT {READING_COLUMNS}
        FROM telemetry t
        WHERE t.animal_id = ?1 AND t.time >= ?2 AND (?3 IS NULL OR t.time < ?3)
        ORDER BY t.time ASC
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(animal_id)
        .bind(to_micros(since))
        .bind(before.map(to_micros))
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(reading_from_row).collect()
}

/// Count, mean and peak of an animal's activity with `since <= time < before`.
///
/// Aggregated in SQL over the primary key range, so the cost does not grow
/// with the reporting rate.
pub async fn activity_stats(
    conn: &mut SqliteConnection,
    animal_id: i64,
    since: DateTime<Utc>,
    before: DateTime<Utc>,
) -> anyhow::Result<ActivityStats> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS samples, AVG(activity) AS mean, MAX(activity) AS peak,
               MIN(time) AS earliest
        FROM telemetry
        WHERE animal_id = ?1 AND time >= ?2 AND time < ?3
        "#,
    )
    .bind(animal_id)
    .bind(to_micros(since))
    .bind(to_micros(before))
    .fetch_one(&mut *conn)
    .await?;

    Ok(ActivityStats {
        samples: row.try_get("samples")?,
        mean: row.try_get::<Option<f64>, _>("mean")?.unwrap_or(0.0),
        max: row.try_get::<Option<f64>, _>("peak")?.unwrap_or(0.0),
        earliest: opt_from_micros(row.try_get("earliest")?)?,
    })
}

/// Number of stored readings for an animal.
pub async fn count_readings(conn: &mut SqliteConnection, animal_id: i64) -> anyhow::Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM telemetry WHERE animal_id = ?")
        .bind(animal_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("total")?)
}

fn reading_from_row(row: &SqliteRow) -> anyhow::Result<Reading> {
    let state: String = row.try_get("activity_state")?;
    Ok(Reading {
        animal_id: row.try_get("animal_id")?,
        time: from_micros(row.try_get("time")?)?,
        device_id: row.try_get("device_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        altitude: row.try_get("altitude")?,
        speed: row.try_get("speed")?,
        satellites: row.try_get("satellites")?,
        activity: row.try_get("activity")?,
        activity_state: ActivityState::from_str(&state)?,
        temperature: row.try_get("temperature")?,
        battery: row.try_get("battery_level")?,
        signal_strength: row.try_get("signal_strength")?,
    })
}

// ============================================================================
// Alerts
// ============================================================================

/// Persist a new alert in the `triggered` state.
pub async fn insert_alert(
    conn: &mut SqliteConnection,
    alert: &NewAlert,
    triggered_at: DateTime<Utc>,
) -> anyhow::Result<Alert> {
    let result = sqlx::query(
        r#"
        INSERT INTO alerts (
            animal_id, alert_type, severity, title, message, metadata, state, triggered_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(alert.animal_id)
    .bind(alert.alert_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.title)
    .bind(&alert.message)
    .bind(serde_json::to_string(&alert.metadata)?)
    .bind(AlertState::Triggered.as_str())
    .bind(to_micros(triggered_at))
    .execute(&mut *conn)
    .await?;

    Ok(triggered_alert(result.last_insert_rowid(), alert, triggered_at))
}

/// Like [`insert_alert`], but only when the animal has no unresolved alert of
/// the same type. The check and the insert are a single statement.
pub async fn insert_alert_if_none_open(
    conn: &mut SqliteConnection,
    alert: &NewAlert,
    triggered_at: DateTime<Utc>,
) -> anyhow::Result<Option<Alert>> {
    let result = sqlx::query(
        r#"
        INSERT INTO alerts (
            animal_id, alert_type, severity, title, message, metadata, state, triggered_at
        )
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
        WHERE NOT EXISTS (
            SELECT 1 FROM alerts
            WHERE animal_id = ?1 AND alert_type = ?2 AND resolved_at IS NULL
        )
        "#,
    )
    .bind(alert.animal_id)
    .bind(alert.alert_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.title)
    .bind(&alert.message)
    .bind(serde_json::to_string(&alert.metadata)?)
    .bind(AlertState::Triggered.as_str())
    .bind(to_micros(triggered_at))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(triggered_alert(result.last_insert_rowid(), alert, triggered_at)))
}

fn triggered_alert(id: i64, alert: &NewAlert, triggered_at: DateTime<Utc>) -> Alert {
    Alert {
        id,
        animal_id: alert.animal_id,
        alert_type: alert.alert_type,
        severity: alert.severity,
        title: alert.title.clone(),
        message: alert.message.clone(),
        metadata: alert.metadata.clone(),
        triggered_at,
        lifecycle: Lifecycle::Triggered,
    }
}

/// Fetch one alert together with its animal's name.
pub async fn get_alert(
    conn: &mut SqliteConnection,
    alert_id: i64,
) -> anyhow::Result<Option<(Alert, Option<String>)>> {
    let sql = format!(
        r#"
        SELECT {ALERT_COLUMNS}, an.name AS animal_name
        FROM alerts al
        LEFT JOIN animals an ON an.id = al.animal_id
        WHERE al.id = ?
        "#
    );

    let row = sqlx::query(&sql)
        .bind(alert_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref()
        .map(|row| -> anyhow::Result<(Alert, Option<String>)> {
            Ok((alert_from_row(row)?, row.try_get("animal_name")?))
        })
        .transpose()
}

/// Replace an alert's lifecycle columns if, and only if, they still hold
/// `expected`. Returns whether the row was updated.
pub async fn compare_and_set_lifecycle(
    conn: &mut SqliteConnection,
    alert_id: i64,
    expected: &Lifecycle,
    next: &Lifecycle,
) -> anyhow::Result<bool> {
    let before = LifecycleColumns::from(expected);
    let after = LifecycleColumns::from(next);

    let result = sqlx::query(
        r#"
        UPDATE alerts
        SET state = ?, acknowledged_at = ?, acknowledged_by = ?, resolved_at = ?
        WHERE id = ?
          AND state = ?
          AND acknowledged_at IS ?
          AND acknowledged_by IS ?
          AND resolved_at IS ?
        "#,
    )
    .bind(after.state.as_str())
    .bind(after.acknowledged_at)
    .bind(after.acknowledged_by)
    .bind(after.resolved_at)
    .bind(alert_id)
    .bind(before.state.as_str())
    .bind(before.acknowledged_at)
    .bind(before.acknowledged_by)
    .bind(before.resolved_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Alerts matching the query filters: unresolved first, then newest first.
pub async fn list_alerts(
    conn: &mut SqliteConnection,
    query: &AlertListQuery,
) -> anyhow::Result<Vec<(Alert, Option<String>)>> {
    let sql = format!(
        r#"
        SELECT {ALERT_COLUMNS}, an.name AS animal_name
        FROM alerts al
        LEFT JOIN animals an ON an.id = al.animal_id
        WHERE (?1 IS NULL OR (?1 = 1) = (al.resolved_at IS NOT NULL))
          AND (?2 IS NULL OR al.severity = ?2)
          AND (?3 IS NULL OR al.animal_id = ?3)
        ORDER BY (al.resolved_at IS NULL) DESC, al.triggered_at DESC, al.id DESC
        LIMIT ?4
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(query.resolved)
        .bind(query.severity.map(|s| s.as_str()))
        .bind(query.animal_id)
        .bind(query.limit)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| -> anyhow::Result<(Alert, Option<String>)> {
            Ok((alert_from_row(row)?, row.try_get("animal_name")?))
        })
        .collect()
}

/// Alerts without a resolution, across all animals.
pub async fn count_unresolved_alerts(conn: &mut SqliteConnection) -> anyhow::Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM alerts WHERE resolved_at IS NULL")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("total")?)
}

/// Unresolved alerts of one animal, oldest first, optionally of one type.
pub async fn open_alerts_for_animal(
    conn: &mut SqliteConnection,
    animal_id: i64,
    alert_type: Option<AlertType>,
) -> anyhow::Result<Vec<Alert>> {
    let sql = format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts al
        WHERE al.animal_id = ?1
          AND al.resolved_at IS NULL
          AND (?2 IS NULL OR al.alert_type = ?2)
        ORDER BY al.triggered_at ASC, al.id ASC
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(animal_id)
        .bind(alert_type.map(|t| t.as_str()))
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(alert_from_row).collect()
}

/// Active, device-bearing animals whose newest reading is older than `cutoff`
/// and that have no unresolved offline alert, with their last reading time.
pub async fn silent_animals(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<(Animal, DateTime<Utc>)>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id, a.name, a.assigned_device, a.status, l.time AS last_seen
        FROM latest_readings l
        JOIN animals a ON a.id = l.animal_id
        WHERE a.status = 'active'
          AND a.assigned_device IS NOT NULL
          AND l.time < ?
          AND NOT EXISTS (
              SELECT 1 FROM alerts al
              WHERE al.animal_id = a.id
                AND al.alert_type = 'offline'
                AND al.resolved_at IS NULL
          )
        ORDER BY l.time ASC
        "#,
    )
    .bind(to_micros(cutoff))
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> anyhow::Result<(Animal, DateTime<Utc>)> {
            Ok((animal_from_row(row)?, from_micros(row.try_get("last_seen")?)?))
        })
        .collect()
}

/// Flat column view of a [`Lifecycle`].
struct LifecycleColumns {
    state: AlertState,
    acknowledged_at: Option<i64>,
    acknowledged_by: Option<i64>,
    resolved_at: Option<i64>,
}

impl From<&Lifecycle> for LifecycleColumns {
    fn from(lifecycle: &Lifecycle) -> Self {
        let ack = lifecycle.acknowledgement();
        Self {
            state: lifecycle.state(),
            acknowledged_at: ack.map(|a| to_micros(a.at)),
            acknowledged_by: ack.and_then(|a| a.by),
            resolved_at: lifecycle.resolved_at().map(to_micros),
        }
    }
}

fn alert_from_row(row: &SqliteRow) -> anyhow::Result<Alert> {
    let id: i64 = row.try_get("id")?;
    let state: AlertState = row.try_get::<String, _>("state")?.parse()?;
    let acknowledged_at = opt_from_micros(row.try_get("acknowledged_at")?)?;
    let acknowledged_by: Option<i64> = row.try_get("acknowledged_by")?;
    let resolved_at = opt_from_micros(row.try_get("resolved_at")?)?;

    let acknowledgement = acknowledged_at.map(|at| Acknowledgement {
        at,
        by: acknowledged_by,
    });

    let lifecycle = match (state, acknowledgement, resolved_at) {
        (AlertState::Triggered, None, None) => Lifecycle::Triggered,
        (AlertState::Acknowledged, Some(ack), None) => Lifecycle::Acknowledged(ack),
        (AlertState::Resolved, acknowledgement, Some(resolved_at)) => Lifecycle::Resolved {
            acknowledgement,
            resolved_at,
        },
        _ => anyhow::bail!("alert {id} has inconsistent lifecycle columns (state {state})"),
    };

    let metadata: String = row.try_get("metadata")?;

    Ok(Alert {
        id,
        animal_id: row.try_get("animal_id")?,
        alert_type: row.try_get::<String, _>("alert_type")?.parse()?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        metadata: serde_json::from_str(&metadata)
            .with_context(|| format!("alert {id} has malformed metadata"))?,
        triggered_at: from_micros(row.try_get("triggered_at")?)?,
        lifecycle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertSeverity, AnimalStatus};

    async fn setup() -> (Storage, Animal) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let mut conn = storage.acquire().await.unwrap();
        let animal = insert_animal(
            &mut conn,
            &NewAnimal {
                name: "Marguerite".to_string(),
                assigned_device: Some("M5-001".to_string()),
                status: AnimalStatus::Active,
            },
        )
        .await
        .unwrap();
        drop(conn);
        (storage, animal)
    }

    fn reading(animal_id: i64, time: DateTime<Utc>, activity: f64) -> Reading {
        Reading {
            animal_id,
            time,
            device_id: "M5-001".to_string(),
            latitude: 48.8566,
            longitude: 2.3522,
            altitude: None,
            speed: None,
            satellites: Some(8),
            activity,
            activity_state: ActivityState::from_magnitude(activity),
            temperature: Some(38.5),
            battery: 78,
            signal_strength: None,
        }
    }

    fn base_time() -> DateTime<Utc> {
        from_micros(1_760_000_000_000_000).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_read_back_reading() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let t = base_time();

        insert_reading(&mut conn, &reading(animal.id, t, 1.3)).await.unwrap();

        let since = t - chrono::Duration::hours(1);
        let history = readings_between(&mut conn, animal.id, since, None)
            .await
            .unwrap();
        assert_eq!(history, vec![reading(animal.id, t, 1.3)]);
    }

    #[tokio::test]
    async fn test_activity_stats_over_half_open_range() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let t = base_time();
        let minutes = chrono::Duration::minutes;

        let empty = activity_stats(&mut conn, animal.id, t - minutes(60), t)
            .await
            .unwrap();
        assert_eq!(empty, ActivityStats::default());

        for (offset, activity) in [(0, 1.0), (10, 2.0), (20, 0.6), (30, 5.0)] {
            insert_reading(&mut conn, &reading(animal.id, t + minutes(offset), activity))
                .await
                .unwrap();
        }

        // The reading at the upper bound is excluded.
        let stats = activity_stats(&mut conn, animal.id, t + minutes(10), t + minutes(30))
            .await
            .unwrap();
        assert_eq!(stats.samples, 2);
        assert!((stats.mean - 1.3).abs() < 1e-9);
        assert_eq!(stats.max, 2.0);
        assert_eq!(stats.earliest, Some(t + minutes(10)));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_last_write_wins() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let t = base_time();

        insert_reading(&mut conn, &reading(animal.id, t, 0.2)).await.unwrap();
        insert_reading(&mut conn, &reading(animal.id, t, 3.0)).await.unwrap();

        assert_eq!(count_readings(&mut conn, animal.id).await.unwrap(), 1);
        let latest = latest_positions(&mut conn, Some(animal.id), 10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].activity, 3.0);
        assert_eq!(latest[0].activity_state, ActivityState::Running);
    }

    #[tokio::test]
    async fn test_latest_pointer_ignores_older_append() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let t = base_time();

        let older = t - chrono::Duration::minutes(5);
        insert_reading(&mut conn, &reading(animal.id, t, 1.0)).await.unwrap();
        insert_reading(&mut conn, &reading(animal.id, older, 2.0))
            .await
            .unwrap();

        let latest = latest_positions(&mut conn, None, 10).await.unwrap();
        assert_eq!(latest[0].last_update, t);
        assert_eq!(latest[0].activity, 1.0);
    }

    #[tokio::test]
    async fn test_alert_lifecycle_columns_round_trip() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let t = base_time();

        let alert = insert_alert(
            &mut conn,
            &NewAlert {
                animal_id: animal.id,
                alert_type: AlertType::Health,
                severity: AlertSeverity::Critical,
                title: "Fever".to_string(),
                message: Some("41.2 °C".to_string()),
                metadata: serde_json::json!({ "temperature": 41.2 }),
            },
            t,
        )
        .await
        .unwrap();

        let next = Lifecycle::Resolved {
            acknowledgement: Some(Acknowledgement {
                at: t + chrono::Duration::minutes(1),
                by: Some(4),
            }),
            resolved_at: t + chrono::Duration::minutes(2),
        };
        assert!(
            compare_and_set_lifecycle(&mut conn, alert.id, &Lifecycle::Triggered, &next)
                .await
                .unwrap()
        );
        // The expected state no longer holds.
        assert!(
            !compare_and_set_lifecycle(&mut conn, alert.id, &Lifecycle::Triggered, &next)
                .await
                .unwrap()
        );

        let (stored, name) = get_alert(&mut conn, alert.id).await.unwrap().unwrap();
        assert_eq!(stored.lifecycle, next);
        assert_eq!(stored.metadata["temperature"], 41.2);
        assert_eq!(name.as_deref(), Some("Marguerite"));
    }

    #[tokio::test]
    async fn test_insert_alert_if_none_open_deduplicates() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();
        let new = NewAlert {
            animal_id: animal.id,
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Warning,
            title: "Silent".to_string(),
            message: None,
            metadata: serde_json::json!({}),
        };

        let first = insert_alert_if_none_open(&mut conn, &new, base_time())
            .await
            .unwrap();
        let second = insert_alert_if_none_open(&mut conn, &new, base_time())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(count_unresolved_alerts(&mut conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deleting_animal_cascades() {
        let (storage, animal) = setup().await;
        let mut conn = storage.acquire().await.unwrap();

        insert_reading(&mut conn, &reading(animal.id, base_time(), 1.0))
            .await
            .unwrap();
        sqlx::query("DELETE FROM animals WHERE id = ?")
            .bind(animal.id)
            .execute(&mut *conn)
            .await
            .unwrap();

        assert_eq!(count_readings(&mut conn, animal.id).await.unwrap(), 0);
        assert!(latest_positions(&mut conn, None, 10).await.unwrap().is_empty());
    }
}
