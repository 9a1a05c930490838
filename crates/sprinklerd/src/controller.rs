//! The engine value that ties the components together, plus the control
//! operations an external surface (HTTP, UDP discovery, CLI) consumes.
//! There is exactly one engine per process; config activation re-seats
//! every component's state without touching the in-flight run.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::calendar::{CalendarImporter, CalendarStatus};
use crate::config::Config;
use crate::events::{Action, EventFilter, EventRecord, EventSink};
use crate::executor::{Command, ExecutorHandle, RunStatus};
use crate::hardware::{HardwareConfig, SharedDriver};
use crate::program::Program;
use crate::raindelay::RainDelay;
use crate::weather::{AdjusterStatus, WateringIndexAdjuster, WeatherAdjuster};

// ---------------------------------------------------------------------------
// Errors returned to an external caller
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown program id '{0}'")]
    UnknownProgram(String),
    #[error("zone {0} out of range")]
    InvalidZone(usize),
    #[error("invalid duration {0}")]
    InvalidDuration(i64),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    pub config: Arc<RwLock<Config>>,
    pub hardware: HardwareConfig,
    pub events: EventSink,
    pub driver: SharedDriver,
    pub weather: Arc<RwLock<WeatherAdjuster>>,
    pub windex: Arc<RwLock<WateringIndexAdjuster>>,
    pub calendar: Arc<RwLock<CalendarImporter>>,
    pub raindelay: Arc<RwLock<RainDelay>>,
    pub exec: ExecutorHandle,
}

/// Whole-core run mode. `Running` reports an in-flight run even while a
/// rain hold is armed; the hold itself is visible as `raindelay_remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    Off,
    Idle,
    RainHold,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub index: usize,
    pub name: String,
    pub manual: bool,
    pub master: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub on: bool,
    pub mode: RunMode,
    pub raindelay_remaining: Option<i64>,
    pub run: RunStatus,
    pub zones: Vec<ZoneStatus>,
    pub weather: AdjusterStatus,
    pub wateringindex: AdjusterStatus,
    pub calendars: Vec<CalendarStatus>,
    pub events: Vec<EventRecord>,
}

impl Engine {
    /// Re-seat every component from a new configuration document. The run
    /// queue and any in-flight run are deliberately left alone.
    pub async fn activate_config(&self, new: Config) {
        let now = Utc::now();
        {
            let mut driver = self.driver.lock().await;
            driver.configure(&self.hardware, &new);
        }
        self.weather
            .write()
            .await
            .configure(new.weather.clone(), new.zipcode.clone(), now);
        self.windex
            .write()
            .await
            .configure(new.wateringindex.clone(), new.zipcode.clone(), now);
        self.calendar.write().await.configure(&new);
        self.events.set_options(new.event.syslog, new.event.cleanup);

        info!(
            zones = new.zones.len(),
            programs = new.programs.len(),
            calendars = new.calendars.len(),
            "configuration activated"
        );
        *self.config.write().await = new;
    }

    // -- Toggles ------------------------------------------------------------

    pub async fn set_on(&self, on: bool) {
        self.config.write().await.on = on;
        let action = if on { Action::On } else { Action::Off };
        self.events.record(EventRecord::new(action)).await;
    }

    pub async fn set_raindelay_enabled(&self, enabled: bool) {
        self.config.write().await.raindelay = enabled;
        if !enabled {
            self.raindelay.write().await.clear();
        }
    }

    /// Arm or extend the hold by the standard interval.
    pub async fn extend_raindelay(&self) {
        self.raindelay.write().await.extend(Utc::now());
    }

    pub async fn clear_raindelay(&self) {
        self.raindelay.write().await.clear();
    }

    pub async fn set_weather_enabled(&self, on: bool) {
        self.weather.write().await.set_enabled(on);
        if let Some(w) = self.config.write().await.weather.as_mut() {
            w.enable = on;
        }
    }

    pub async fn set_index_enabled(&self, on: bool) {
        self.windex.write().await.set_enabled(on);
        if let Some(wi) = self.config.write().await.wateringindex.as_mut() {
            wi.enable = on;
        }
    }

    /// Ask every refresher to fetch on its next heartbeat.
    pub async fn refresh_now(&self) {
        let now = Utc::now();
        self.weather.write().await.force_refresh(now);
        self.windex.write().await.force_refresh(now);
        self.calendar.write().await.force_refresh();
    }

    // -- Launch / stop ------------------------------------------------------

    /// Start a program by external id: `C<idx>` indexes the imported list,
    /// `L<idx>` or a bare integer indexes the local list.
    pub async fn start_program(&self, id: &str) -> Result<(), ControlError> {
        let bad = || ControlError::UnknownProgram(id.to_string());

        let program: Program = if let Some(rest) = id.strip_prefix('C') {
            let idx: usize = rest.parse().map_err(|_| bad())?;
            self.calendar
                .read()
                .await
                .programs()
                .get(idx)
                .cloned()
                .ok_or_else(bad)?
        } else {
            let rest = id.strip_prefix('L').unwrap_or(id);
            let idx: usize = rest.parse().map_err(|_| bad())?;
            self.config
                .read()
                .await
                .programs
                .get(idx)
                .cloned()
                .ok_or_else(bad)?
        };

        self.exec.send(Command::Launch(program)).await;
        Ok(())
    }

    pub async fn zone_on_manual(&self, zone: usize, seconds: i64) -> Result<(), ControlError> {
        if seconds <= 0 {
            return Err(ControlError::InvalidDuration(seconds));
        }
        if zone >= self.config.read().await.zones.len() {
            return Err(ControlError::InvalidZone(zone));
        }
        self.exec.send(Command::ManualZone { zone, seconds }).await;
        Ok(())
    }

    pub async fn all_off(&self) {
        self.exec.send(Command::AllOff).await;
    }

    pub async fn button_press(&self) {
        self.exec.send(Command::ButtonPress).await;
    }

    // -- Introspection ------------------------------------------------------

    pub async fn run_mode(&self) -> RunMode {
        if !self.config.read().await.on {
            return RunMode::Off;
        }
        if self.exec.status.read().await.running.is_some() {
            return RunMode::Running;
        }
        if self.raindelay.read().await.active(Utc::now()) {
            return RunMode::RainHold;
        }
        RunMode::Idle
    }

    pub async fn status(&self) -> StatusSnapshot {
        let cfg = self.config.read().await;
        let zones = cfg
            .zones
            .iter()
            .enumerate()
            .map(|(index, z)| ZoneStatus {
                index,
                name: z.name.clone(),
                manual: z.manual,
                master: z.master,
            })
            .collect();
        let on = cfg.on;
        drop(cfg);

        StatusSnapshot {
            on,
            mode: self.run_mode().await,
            raindelay_remaining: self.raindelay.read().await.remaining(Utc::now()),
            run: self.exec.status.read().await.clone(),
            zones,
            weather: self.weather.read().await.status(),
            wateringindex: self.windex.read().await.status(),
            calendars: self.calendar.read().await.status(),
            events: self.events.recent(),
        }
    }

    pub async fn history(&self, filter: &EventFilter) -> anyhow::Result<Vec<EventRecord>> {
        self.events.find(filter).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
