use anyhow::Context;
use tracing::info;

use kdeconnectd::config::{default_config_dir, Settings};
use kdeconnectd::infrastructure::storage::ConfigStore;
use kdeconnectd::utils::logging;
use kdeconnectd::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let settings = Settings::from_env();
    let config_dir = default_config_dir().context("resolving config directory")?;
    let store = ConfigStore::new(config_dir);

    let engine =
        Engine::load_or_create(settings, store).context("initializing engine")?;
    engine.start().await.context("starting engine")?;
    info!(device_id = %engine.identity().device_id, "daemon running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    engine.shutdown().await;
    Ok(())
}
