//! Background device-silence sweep.
//!
//! Runs [`alerts::sweep_offline`] every `interval`. Errors are logged and the
//! loop keeps going; the next tick retries from scratch.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::alerts;
use crate::storage::Storage;

pub async fn run_offline_sweep(storage: Storage, interval: Duration, timeout: chrono::Duration) {
    info!(
        interval_secs = interval.as_secs(),
        timeout_minutes = timeout.num_minutes(),
        "Offline sweep worker started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so the server settles first.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match alerts::sweep_offline(&storage, timeout, Utc::now()).await {
            Ok(created) if created.is_empty() => debug!("Offline sweep found no silent trackers"),
            Ok(created) => info!(alerts = created.len(), "Offline sweep raised alerts"),
            Err(e) => error!(error = %e, "Offline sweep failed"),
        }
    }
}
