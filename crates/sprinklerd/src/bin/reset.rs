//! Reset tool, run unconditionally on stop/restart: read the config,
//! build the hardware driver, force every zone off, record a CANCEL, exit.

use anyhow::Result;
use tracing::info;

use sprinklerd::config;
use sprinklerd::events::{Action, EventRecord, EventSink};
use sprinklerd::hardware::{self, HardwareDriver as _};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load(&config::search_path("config.json"))?;
    let hw = hardware::load_hardware_config(&config::search_path("hardware.json"));

    let mut driver = hardware::build_driver(&hw, &cfg);
    for zone in 0..cfg.zones.len() {
        driver.set_zone(zone, false);
    }
    driver.apply();

    let db_path = config::search_path("events.db");
    let events = EventSink::open(&format!("sqlite:{}?mode=rwc", db_path.display())).await?;
    events.set_options(cfg.event.syslog, cfg.event.cleanup);
    events.record(EventRecord::new(Action::Cancel)).await;

    info!(zones = cfg.zones.len(), "all zones off");
    Ok(())
}
