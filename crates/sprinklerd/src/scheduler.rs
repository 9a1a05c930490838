//! Minute-gated scheduler: every 10 seconds, decide at most once per
//! wall-clock minute which programs are due, honouring the rain hold,
//! season gates, and per-occurrence exceptions, and hand launches to the
//! run queue.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::config::SeasonConfig;
use crate::controller::Engine;
use crate::executor::Command;
use crate::program::{check_due, format_yyyymmdd, season_allows, Program};

/// How often the scheduler wakes; evaluation itself is per minute.
pub const TICK_INTERVAL_SEC: u64 = 10;

pub struct Scheduler {
    last_minute: Option<String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { last_minute: None }
    }

    pub async fn tick(&mut self, engine: &Engine, now: DateTime<Tz>) {
        // Each wall-clock minute is evaluated at most once.
        let minute_key = now.format("%H:%M").to_string();
        if self.last_minute.as_deref() == Some(minute_key.as_str()) {
            return;
        }
        self.last_minute = Some(minute_key);

        let (raindelay_enabled, on) = {
            let cfg = engine.config.read().await;
            (cfg.raindelay, cfg.on)
        };
        let now_utc = now.with_timezone(&Utc);

        if raindelay_enabled {
            let hardware_rain = engine.driver.lock().await.rain_sensor();
            let weather_rain = engine.weather.read().await.rainsensor();
            if hardware_rain || weather_rain {
                info!(hardware_rain, weather_rain, "rain detected — extending hold");
                engine.raindelay.write().await.extend(now_utc);
            }
            if engine.raindelay.read().await.active(now_utc) {
                // The hold blocks launches only; an in-flight run continues.
                debug!("rain hold active — skipping program evaluation");
                return;
            }
        }

        if !on {
            return;
        }

        // User programs first, calendar imports second.
        let user_launches = {
            let mut cfg = engine.config.write().await;
            let seasons = cfg.seasons.clone();
            collect_due(&mut cfg.programs, &seasons, &now)
        };
        let calendar_launches = {
            let seasons = engine.config.read().await.seasons.clone();
            let mut importer = engine.calendar.write().await;
            collect_due(importer.programs_mut(), &seasons, &now)
        };

        for program in user_launches.into_iter().chain(calendar_launches) {
            info!(program = %program.name, "program due");
            engine.exec.send(Command::Launch(program)).await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk one program list, applying the due rule and its write-backs
/// (anchor dates, one-shot retirement) in place. Exceptions are checked
/// before their program; the first that fires wins the minute.
fn collect_due(
    programs: &mut [Program],
    seasons: &[SeasonConfig],
    now: &DateTime<Tz>,
) -> Vec<Program> {
    let mut launches = Vec::new();

    for program in programs.iter_mut() {
        if !program.active {
            continue;
        }
        if let Some(season_name) = program.season.clone() {
            if let Some(season) = seasons.iter().find(|s| s.name == season_name) {
                if !season_allows(season, now) {
                    continue;
                }
            }
        }

        let mut exception_fired = false;
        for exception in program.exceptions.iter_mut() {
            if !exception.active {
                continue;
            }
            let decision = check_due(exception, now);
            if let Some(anchor) = decision.anchor {
                exception.date = Some(format_yyyymmdd(anchor));
            }
            if decision.deactivate {
                exception.active = false;
            }
            if decision.due {
                launches.push(exception.clone());
                exception_fired = true;
                break;
            }
        }
        if exception_fired {
            continue;
        }

        let decision = check_due(program, now);
        if let Some(anchor) = decision.anchor {
            program.date = Some(format_yyyymmdd(anchor));
        }
        if decision.deactivate {
            program.active = false;
        }
        if decision.due {
            launches.push(program.clone());
        }
    }

    launches
}

// ===========================================================================
// Tests
// ===========================================================================
