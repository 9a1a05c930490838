//! Daemon entry point: load configuration, wire up the hardware driver,
//! event store, adjusters, calendar importer, run queue, and the periodic
//! tasks, then wait for signals.
//!
//! - SIGINT/SIGTERM: all zones off, exit 0
//! - SIGHUP: reload configuration, keeping the last good one on a parse error

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use sprinklerd::calendar::CalendarImporter;
use sprinklerd::config;
use sprinklerd::controller::Engine;
use sprinklerd::events::{Action, EventRecord, EventSink};
use sprinklerd::executor::{self, Command};
use sprinklerd::hardware::{self, HardwareDriver, SharedDriver};
use sprinklerd::raindelay::RainDelay;
use sprinklerd::scheduler::{Scheduler, TICK_INTERVAL_SEC};
use sprinklerd::weather::{
    HttpIndexProvider, WateringIndexAdjuster, WeatherAdjuster, WundergroundProvider,
};

/// Heartbeat for the calendar/weather/index refreshers.
const REFRESH_TICK_SEC: u64 = 60;

/// Boot-race retry cadence for drivers whose pins are not up yet.
const HARDWARE_RETRY_MS: u64 = 200;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config_path = config::search_path("config.json");
    let cfg = config::load(&config_path)?;
    info!(path = %config_path.display(), zones = cfg.zones.len(), "configuration loaded");

    let hw = hardware::load_hardware_config(&config::search_path("hardware.json"));

    // ── Hardware ────────────────────────────────────────────────────
    let driver: SharedDriver = Arc::new(tokio::sync::Mutex::new(hardware::build_driver(&hw, &cfg)));

    // ── Event store ─────────────────────────────────────────────────
    let db_path = config::search_path("events.db");
    let events = EventSink::open(&format!("sqlite:{}?mode=rwc", db_path.display()))
        .await
        .context("failed to open event store")?;
    events.set_options(cfg.event.syslog, cfg.event.cleanup);
    events.record(EventRecord::new(Action::Startup)).await;

    // ── Adjusters + calendar ────────────────────────────────────────
    let now = Utc::now();
    let mut weather = WeatherAdjuster::new(Arc::new(WundergroundProvider::new()));
    weather.configure(cfg.weather.clone(), cfg.zipcode.clone(), now);
    let mut windex = WateringIndexAdjuster::new(Arc::new(HttpIndexProvider::new()));
    windex.configure(cfg.wateringindex.clone(), cfg.zipcode.clone(), now);
    let mut calendar = CalendarImporter::new();
    calendar.configure(&cfg);

    let config = Arc::new(RwLock::new(cfg));
    let weather = Arc::new(RwLock::new(weather));
    let windex = Arc::new(RwLock::new(windex));

    // ── Run queue ───────────────────────────────────────────────────
    let (exec, exec_rx, exec_handle) = executor::new(
        Arc::clone(&driver),
        events.clone(),
        Arc::clone(&config),
        Arc::clone(&weather),
        Arc::clone(&windex),
    );
    tokio::spawn(exec.run(exec_rx));

    let engine = Arc::new(Engine {
        config,
        hardware: hw,
        events,
        driver,
        weather,
        windex,
        calendar: Arc::new(RwLock::new(calendar)),
        raindelay: Arc::new(RwLock::new(RainDelay::new())),
        exec: exec_handle,
    });

    // ── Hardware edge callbacks ─────────────────────────────────────
    {
        let (rain_tx, mut rain_rx) = tokio::sync::mpsc::unbounded_channel();
        engine
            .driver
            .lock()
            .await
            .rain_interrupt(Box::new(move |level| {
                if level {
                    let _ = rain_tx.send(());
                }
            }));
        let raindelay = Arc::clone(&engine.raindelay);
        let cfg = Arc::clone(&engine.config);
        tokio::spawn(async move {
            while rain_rx.recv().await.is_some() {
                if cfg.read().await.raindelay {
                    raindelay.write().await.extend(Utc::now());
                    info!("rain edge — hold extended");
                }
            }
        });

        let button_tx = engine.exec.tx.clone();
        engine
            .driver
            .lock()
            .await
            .button_interrupt(Box::new(move |level| {
                if level {
                    let _ = button_tx.try_send(Command::ButtonPress);
                }
            }));
    }

    // ── Driver boot retry ───────────────────────────────────────────
    {
        let driver = Arc::clone(&engine.driver);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(HARDWARE_RETRY_MS));
            loop {
                ticker.tick().await;
                let mut driver = driver.lock().await;
                if driver.ready() {
                    break;
                }
                driver.retry_init();
            }
        });
    }

    // ── Scheduler tick ──────────────────────────────────────────────
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut scheduler = Scheduler::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                let tz = engine.config.read().await.tz();
                scheduler.tick(&engine, Utc::now().with_timezone(&tz)).await;
            }
        });
    }

    // ── Refresh tick ────────────────────────────────────────────────
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(REFRESH_TICK_SEC));
            let mut weather_seen: Option<i64> = None;
            let mut windex_seen: Option<i64> = None;
            loop {
                ticker.tick().await;
                let cfg = engine.config.read().await.clone();
                let now = Utc::now().with_timezone(&cfg.tz());

                engine.calendar.write().await.refresh(&cfg, now).await;

                if engine.weather.write().await.refresh(now).await {
                    let weather = engine.weather.read().await;
                    let updated = weather.updated();
                    if weather_seen.is_some() && updated > weather_seen {
                        let mut update = EventRecord::new(Action::Update);
                        update.source = Some(weather.source().to_string());
                        update.adjustment = Some(weather.adjustment());
                        if let Some(obs) = weather.observation() {
                            update.temperature = Some(obs.temperature);
                            update.humidity = Some(obs.humidity);
                            update.rain = Some(obs.rain_today);
                        }
                        drop(weather);
                        engine.events.record(update).await;
                    }
                    weather_seen = updated;
                }

                if engine.windex.write().await.refresh(now).await {
                    let windex = engine.windex.read().await;
                    let updated = windex.updated();
                    if windex_seen.is_some() && updated > windex_seen {
                        let mut update = EventRecord::new(Action::Update);
                        update.source = Some(windex.source());
                        update.adjustment = Some(windex.adjustment());
                        drop(windex);
                        engine.events.record(update).await;
                    }
                    windex_seen = updated;
                }
            }
        });
    }

    // ── Signals ─────────────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let exit_reason;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
            _ = sighup.recv() => {
                match config::load(&config_path) {
                    Ok(new) => engine.activate_config(new).await,
                    Err(e) => {
                        error!("config reload failed: {e:#} — keeping last good config");
                    }
                }
            }
        }
    }

    // ── Graceful shutdown: everything off ───────────────────────────
    warn!(signal = exit_reason, "shutting down — all zones off");
    engine.all_off().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let zone_count = engine.config.read().await.zones.len();
        let mut driver = engine.driver.lock().await;
        for zone in 0..zone_count {
            driver.set_zone(zone, false);
        }
        driver.apply();
    }

    info!("shutdown complete");
    Ok(())
}
