//! Device registry lookup: which animal is wearing a tracker right now.
//!
//! The binding is re-resolved on every call. Nothing is cached, so a device
//! moved to another animal takes effect on the very next reading.

use sqlx::sqlite::SqliteConnection;
use tracing::{error, instrument};

use crate::error::CoreError;
use crate::model::Animal;
use crate::storage;

/// Resolve `device_id` to the unique active animal wearing it.
///
/// Fails with [`CoreError::UnassignedDevice`] when no active animal has the
/// device. More than one active owner is a registry integrity fault and is
/// reported as [`CoreError::Internal`] rather than guessing.
#[instrument(skip(conn))]
pub async fn resolve_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Animal, CoreError> {
    let mut owners = storage::find_active_animals_by_device(conn, device_id).await?;

    match owners.len() {
        0 => Err(CoreError::UnassignedDevice {
            device_id: device_id.to_string(),
        }),
        1 => Ok(owners.remove(0)),
        n => {
            let ids: Vec<i64> = owners.iter().map(|a| a.id).collect();
            error!(device_id, owners = ?ids, "Device bound to several active animals");
            Err(CoreError::Internal(anyhow::anyhow!(
                "device {device_id} is assigned to {n} active animals"
            )))
        }
    }
}
