//! Load a small demo herd into the configured database.
//!
//! Running it twice is harmless: animals whose device is already bound to an
//! active animal are skipped.

use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use herdwatch::config::Config;
use herdwatch::model::{AnimalStatus, NewAnimal};
use herdwatch::storage::{self, Storage};

const DEMO_HERD: &[(&str, Option<&str>)] = &[
    ("Marguerite", Some("M5-001")),
    ("Bella", Some("M5-002")),
    ("Daisy", None),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("seed_demo=info".parse()?))
        .init();

    let config = Config::from_env()?;
    let storage = Storage::new(&config.database_url).await?;
    let mut conn = storage.acquire().await?;

    for (name, device) in DEMO_HERD {
        if let Some(device) = device {
            let owners = storage::find_active_animals_by_device(&mut conn, device).await?;
            if !owners.is_empty() {
                info!(name, device, "Device already assigned, skipping");
                continue;
            }
        }

        let animal = storage::insert_animal(
            &mut conn,
            &NewAnimal {
                name: name.to_string(),
                assigned_device: device.map(str::to_string),
                status: AnimalStatus::Active,
            },
        )
        .await?;

        info!(animal_id = animal.id, name, device = ?device, "Animal registered");
    }

    Ok(())
}
