//! Read paths over the telemetry store: latest position per animal and
//! bounded history.

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::config::HISTORY_HARD_CAP_HOURS;
use crate::error::CoreError;
use crate::model::{LatestPosition, Reading};
use crate::storage::{self, Storage};

/// Largest page of latest positions a caller may ask for.
pub const MAX_LATEST_LIMIT: i64 = 100;

/// Most recent reading of every animal with at least one reading, or of the
/// requested animal only.
///
/// # Arguments
///
/// * `animal_id` - Optional filter
/// * `limit` - Maximum number of animals returned (1-100)
#[instrument(skip(storage))]
pub async fn latest_positions(
    storage: &Storage,
    animal_id: Option<i64>,
    limit: i64,
) -> Result<Vec<LatestPosition>, CoreError> {
    if !(1..=MAX_LATEST_LIMIT).contains(&limit) {
        return Err(CoreError::Validation(format!(
            "limit must be between 1 and {MAX_LATEST_LIMIT}, got {limit}"
        )));
    }

    let mut conn = storage.acquire().await?;
    Ok(storage::latest_positions(&mut conn, animal_id, limit).await?)
}

/// Readings of one animal from the last `hours` hours, oldest first.
///
/// # Arguments
///
/// * `animal_id` - The animal to query
/// * `hours` - Lookback window, between 1 and `max_hours`
/// * `max_hours` - Configured cap, itself never above 168
/// * `now` - The reference timestamp
#[instrument(skip(storage))]
pub async fn history(
    storage: &Storage,
    animal_id: i64,
    hours: i64,
    max_hours: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Reading>, CoreError> {
    let max_hours = max_hours.clamp(1, HISTORY_HARD_CAP_HOURS);
    if !(1..=max_hours).contains(&hours) {
        return Err(CoreError::Validation(format!(
            "hours must be between 1 and {max_hours}, got {hours}"
        )));
    }

    let mut conn = storage.acquire().await?;

    if storage::get_animal(&mut conn, animal_id).await?.is_none() {
        return Err(CoreError::UnknownAnimal(animal_id));
    }

    let since = now - chrono::Duration::hours(hours);
    Ok(storage::readings_between(&mut conn, animal_id, since, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityState, Animal, AnimalStatus, NewAnimal};

    async fn setup(names: &[&str]) -> (Storage, Vec<Animal>) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let mut conn = storage.acquire().await.unwrap();
        let mut animals = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let animal = storage::insert_animal(
                &mut conn,
                &NewAnimal {
                    name: name.to_string(),
                    assigned_device: Some(format!("M5-{:03}", i + 1)),
                    status: AnimalStatus::Active,
                },
            )
            .await
            .unwrap();
            animals.push(animal);
        }
        drop(conn);
        (storage, animals)
    }

    async fn append(storage: &Storage, animal: &Animal, time: DateTime<Utc>, activity: f64) {
        let mut conn = storage.acquire().await.unwrap();
        let reading = Reading {
            animal_id: animal.id,
            time,
            device_id: animal.assigned_device.clone().unwrap(),
            latitude: 45.0,
            longitude: 4.0,
            altitude: None,
            speed: None,
            satellites: None,
            activity,
            activity_state: ActivityState::from_magnitude(activity),
            temperature: None,
            battery: 90,
            signal_strength: None,
        };
        storage::insert_reading(&mut conn, &reading).await.unwrap();
    }

    fn now() -> DateTime<Utc> {
        storage::truncate_to_micros(Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_latest_returns_one_entry_per_animal() {
        let (storage, animals) = setup(&["Marguerite", "Bella", "Daisy"]).await;
        let now = now();

        // Daisy never reports.
        for minutes in [30, 10, 20] {
            append(&storage, &animals[0], now - chrono::Duration::minutes(minutes), 1.0).await;
        }
        for minutes in [5, 50] {
            append(&storage, &animals[1], now - chrono::Duration::minutes(minutes), 2.0).await;
        }

        let latest = latest_positions(&storage, None, 10).await.unwrap();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].animal_name, "Bella");
        assert_eq!(latest[0].last_update, now - chrono::Duration::minutes(5));
        assert_eq!(latest[1].animal_name, "Marguerite");
        assert_eq!(latest[1].last_update, now - chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_latest_filter_and_limit() {
        let (storage, animals) = setup(&["Marguerite", "Bella"]).await;
        let now = now();
        append(&storage, &animals[0], now, 1.0).await;
        append(&storage, &animals[1], now, 1.0).await;

        let only = latest_positions(&storage, Some(animals[1].id), 10).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].animal_id, animals[1].id);

        let limited = latest_positions(&storage, None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        assert!(matches!(
            latest_positions(&storage, None, 0).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            latest_positions(&storage, None, 101).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_history_window_and_order() {
        let (storage, animals) = setup(&["Marguerite"]).await;
        let now = now();

        for hours in [30, 2, 23, 1] {
            append(&storage, &animals[0], now - chrono::Duration::hours(hours), 1.0).await;
        }

        let readings = history(&storage, animals[0].id, 24, 168, now).await.unwrap();

        assert_eq!(readings.len(), 3);
        assert!(readings.windows(2).all(|w| w[0].time < w[1].time));
        assert!(readings.iter().all(|r| r.time >= now - chrono::Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_history_bounds() {
        let (storage, animals) = setup(&["Marguerite"]).await;
        let now = now();

        for hours in [0, 169, 200] {
            assert!(matches!(
                history(&storage, animals[0].id, hours, 168, now).await,
                Err(CoreError::Validation(_))
            ));
        }
        // A configured cap above the hard cap is ignored.
        assert!(matches!(
            history(&storage, animals[0].id, 200, 500, now).await,
            Err(CoreError::Validation(_))
        ));
        assert!(history(&storage, animals[0].id, 168, 168, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_unknown_animal() {
        let (storage, _) = setup(&[]).await;

        let err = history(&storage, 42, 24, 168, now()).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownAnimal(42)));
    }
}
