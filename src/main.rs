//! Herdwatch server.
//!
//! Configuration comes from `HERDWATCH_*` environment variables; see
//! [`herdwatch::config::Config`]. Log verbosity follows `RUST_LOG`.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use herdwatch::api::{self, AppState};
use herdwatch::config::Config;
use herdwatch::storage::Storage;
use herdwatch::worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("herdwatch=info".parse()?))
        .init();

    let config = Config::from_env()?;

    info!(
        port = config.port,
        db_url = %config.database_url,
        "Starting Herdwatch server"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    if let Some(interval) = config.offline_sweep_interval {
        tokio::spawn(worker::run_offline_sweep(
            storage.clone(),
            interval,
            config.offline_timeout,
        ));
    } else {
        info!("Offline sweep worker disabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = api::router(AppState::new(storage, config));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Herdwatch is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
