//! Run queue: turns a launched program into a serialised sequence of zone
//! activations with pulse splitting, master-valve co-activation, per-second
//! countdown, inter-item settle, cancellation, and event logging.
//!
//! A single task owns the queue and the running state; everything else
//! talks to it through the command channel, including the hardware button.

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::Config;
use crate::events::{Action, EventRecord, EventSink};
use crate::hardware::SharedDriver;
use crate::program::Program;
use crate::weather::{percent_of, WateringIndexAdjuster, WeatherAdjuster};

/// Pulse residuals shorter than this (and shorter than the pulse) are
/// dropped rather than queued as a fragment.
const TAIL_DROP_SEC: i64 = 15;

/// Rest between consecutive queue items, letting the line depressurise.
const SETTLE_SEC: u64 = 2;

/// Button walk-through: presses settle for this long before starting.
const BUTTON_SETTLE_SEC: u64 = 2;

/// Button walk-through run duration.
const BUTTON_RUN_SEC: i64 = 900;

// ---------------------------------------------------------------------------
// Queue items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneTarget {
    Zone(usize),
    /// Sleep between pulse rounds, attributable to `parent`.
    Pause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunItem {
    pub zone: ZoneTarget,
    pub seconds: i64,
    pub parent: Option<String>,
    pub adjust_source: Option<String>,
    pub ratio: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Expand and enqueue a program (clearing the queue unless `append`).
    Launch(Program),
    /// Direct zone activation: clears the queue first.
    ManualZone { zone: usize, seconds: i64 },
    /// One physical button press; the walk-through index advances.
    ButtonPress,
    /// Cancel everything and de-energise the bank.
    AllOff,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    /// None while sleeping between pulses.
    pub zone: Option<usize>,
    pub parent: Option<String>,
    pub seconds: i64,
    pub remaining: i64,
    pub started_at: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RunStatus {
    pub running: Option<RunningInfo>,
    pub queued: usize,
}

// ---------------------------------------------------------------------------
// Program expansion
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Expansion {
    pub items: Vec<RunItem>,
    /// Zones skipped because their config marks them manual-only.
    pub skipped: Vec<usize>,
}

struct ZonePlan {
    zone: usize,
    remaining: i64,
    pulse: i64,
    pause: i64,
    source: Option<String>,
    ratio: Option<i64>,
}

fn profile_ratio(
    cfg: &Config,
    profile_name: &str,
    now: &DateTime<Tz>,
) -> Option<(i64, String)> {
    let profile = cfg.adjust_profile(profile_name)?;
    if let Some(weekly) = &profile.weekly {
        let week = now.iso_week().week() as usize;
        let ratio = weekly.get(week.saturating_sub(1)).copied()?;
        return Some((ratio, format!("{} (weekly)", profile.name)));
    }
    if let Some(monthly) = &profile.monthly {
        let ratio = monthly.get(now.month() as usize - 1).copied()?;
        return Some((ratio, format!("{} (monthly)", profile.name)));
    }
    None
}

/// Expand a program into the pulsed run plan. Per zone, the adjustment
/// source priority is: named profile table, watering index, weather, none.
pub fn expand_program(
    program: &Program,
    cfg: &Config,
    weather: &WeatherAdjuster,
    windex: &WateringIndexAdjuster,
    now: &DateTime<Tz>,
) -> Expansion {
    let mut expansion = Expansion::default();
    let mut plans: Vec<ZonePlan> = Vec::new();

    for pz in &program.zones {
        let zone_cfg = cfg.zone(pz.zone);
        if zone_cfg.map(|z| z.manual).unwrap_or(false) {
            expansion.skipped.push(pz.zone);
            continue;
        }

        let raw = pz.seconds;
        let profile_name = zone_cfg
            .and_then(|z| z.adjust.as_deref())
            .unwrap_or("default");

        let (adjusted, source) = match profile_ratio(cfg, profile_name, now) {
            Some((ratio, tag)) => (percent_of(raw, ratio), Some(tag)),
            None if windex.enabled() => (windex.adjust(raw), Some(windex.source())),
            None if weather.enabled() => (weather.adjust(raw), Some(weather.source().to_string())),
            None => (raw, None),
        };

        let ratio = (raw > 0).then(|| adjusted * 100 / raw);
        let mut pulse = zone_cfg.and_then(|z| z.pulse).unwrap_or(adjusted);
        if pulse <= 0 {
            pulse = adjusted.max(1);
        }

        plans.push(ZonePlan {
            zone: pz.zone,
            remaining: adjusted,
            pulse,
            pause: zone_cfg.and_then(|z| z.pause).unwrap_or(0),
            source,
            ratio,
        });
    }

    // Round-robin pulse rounds with one group-level pause between rounds.
    loop {
        let mut emitted = false;
        let mut max_pause = 0;
        for plan in plans.iter_mut() {
            if plan.remaining <= 0 {
                continue;
            }
            emitted = true;
            let slice = plan.remaining.min(plan.pulse);
            expansion.items.push(RunItem {
                zone: ZoneTarget::Zone(plan.zone),
                seconds: slice,
                parent: Some(program.name.clone()),
                adjust_source: plan.source.clone(),
                ratio: plan.ratio,
            });
            plan.remaining -= slice;
            if plan.remaining > 0 && plan.remaining < TAIL_DROP_SEC && plan.remaining < plan.pulse
            {
                plan.remaining = 0;
            }
            if plan.remaining > 0 {
                max_pause = max_pause.max(plan.pause);
            }
        }
        if !emitted {
            break;
        }
        if max_pause >= 1 {
            expansion.items.push(RunItem {
                zone: ZoneTarget::Pause,
                seconds: max_pause,
                parent: Some(program.name.clone()),
                adjust_source: None,
                ratio: None,
            });
        }
    }

    expansion
}

// ---------------------------------------------------------------------------
// Executor task
// ---------------------------------------------------------------------------

struct Active {
    item: RunItem,
    remaining: i64,
    started_at: i64,
}

struct ButtonWalk {
    candidate: usize,
    deadline: Instant,
}

#[derive(Clone)]
pub struct ExecutorHandle {
    pub tx: mpsc::Sender<Command>,
    pub status: Arc<RwLock<RunStatus>>,
}

impl ExecutorHandle {
    pub async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            error!("run queue task is gone");
        }
    }
}

pub struct Executor {
    driver: SharedDriver,
    events: EventSink,
    config: Arc<RwLock<Config>>,
    weather: Arc<RwLock<WeatherAdjuster>>,
    windex: Arc<RwLock<WateringIndexAdjuster>>,
    status: Arc<RwLock<RunStatus>>,

    queue: VecDeque<RunItem>,
    running: Option<Active>,
    tick_at: Option<Instant>,
    settle_until: Option<Instant>,
    button: Option<ButtonWalk>,
    ran_since_idle: bool,
}

/// Build the executor and its handle; the caller spawns `run`.
pub fn new(
    driver: SharedDriver,
    events: EventSink,
    config: Arc<RwLock<Config>>,
    weather: Arc<RwLock<WeatherAdjuster>>,
    windex: Arc<RwLock<WateringIndexAdjuster>>,
) -> (Executor, mpsc::Receiver<Command>, ExecutorHandle) {
    let (tx, rx) = mpsc::channel(32);
    let status = Arc::new(RwLock::new(RunStatus::default()));
    let executor = Executor {
        driver,
        events,
        config,
        weather,
        windex,
        status: Arc::clone(&status),
        queue: VecDeque::new(),
        running: None,
        tick_at: None,
        settle_until: None,
        button: None,
        ran_since_idle: false,
    };
    (executor, rx, ExecutorHandle { tx, status })
}

impl Executor {
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            // Start the next queued item when nothing is running or settling.
            if self.running.is_none() && self.settle_until.is_none() {
                if let Some(item) = self.queue.pop_front() {
                    self.start_item(item).await;
                    continue;
                }
                if self.ran_since_idle {
                    self.ran_since_idle = false;
                    self.events.record(EventRecord::new(Action::Idle)).await;
                }
            }

            let tick_at = self.tick_at.unwrap_or_else(Instant::now);
            let settle_at = self.settle_until.unwrap_or_else(Instant::now);
            let button_at = self
                .button
                .as_ref()
                .map(|b| b.deadline)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(tick_at), if self.tick_at.is_some() => {
                    self.tick_second().await;
                }
                _ = tokio::time::sleep_until(settle_at), if self.settle_until.is_some() => {
                    self.settle_until = None;
                }
                _ = tokio::time::sleep_until(button_at), if self.button.is_some() => {
                    self.button_fire().await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Launch(program) => self.program_on(program).await,
            Command::ManualZone { zone, seconds } => {
                self.kill_queue().await;
                self.queue.push_back(RunItem {
                    zone: ZoneTarget::Zone(zone),
                    seconds,
                    parent: None,
                    adjust_source: None,
                    ratio: None,
                });
            }
            Command::ButtonPress => {
                let candidate = self.button.as_ref().map(|b| b.candidate + 1).unwrap_or(0);
                self.button = Some(ButtonWalk {
                    candidate,
                    deadline: Instant::now() + Duration::from_secs(BUTTON_SETTLE_SEC),
                });
            }
            Command::AllOff => self.kill_queue().await,
        }
    }

    // -- Launch -------------------------------------------------------------

    async fn program_on(&mut self, program: Program) {
        if !program.options.append {
            self.kill_queue().await;
        }

        let (expansion, start) = {
            let cfg = self.config.read().await;
            let weather = self.weather.read().await;
            let windex = self.windex.read().await;
            let now = Utc::now().with_timezone(&cfg.tz());

            let expansion = expand_program(&program, &cfg, &weather, &windex, &now);

            // Annotate the program START with the live adjustment source.
            let mut start = EventRecord::new(Action::Start);
            start.program = Some(program.name.clone());
            if windex.enabled() {
                start.source = Some(windex.source());
                start.adjustment = Some(windex.adjustment());
            } else if weather.enabled() {
                start.source = Some(weather.source().to_string());
                start.adjustment = Some(weather.adjustment());
                if let Some(obs) = weather.observation() {
                    start.temperature = Some(obs.temperature);
                    start.humidity = Some(obs.humidity);
                    start.rain = Some(obs.rain_today);
                }
            }
            (expansion, start)
        };

        for zone in &expansion.skipped {
            let mut skip = EventRecord::new(Action::Skip);
            skip.zone = Some(*zone as i64);
            skip.parent = Some(program.name.clone());
            self.events.record(skip).await;
        }

        info!(
            program = %program.name,
            items = expansion.items.len(),
            "program launched"
        );
        self.events.record(start).await;
        self.queue.extend(expansion.items);
        self.publish_status().await;
    }

    // -- Item lifecycle -----------------------------------------------------

    async fn start_item(&mut self, item: RunItem) {
        if item.seconds <= 0 {
            return;
        }

        if let ZoneTarget::Zone(zone) = item.zone {
            let (zone_count, master) = {
                let cfg = self.config.read().await;
                (cfg.zones.len(), cfg.zone(zone).and_then(|z| z.master))
            };
            if zone >= zone_count {
                error!(zone, "run item for unknown zone — dropped");
                return;
            }

            let mut start = EventRecord::new(Action::Start);
            start.zone = Some(zone as i64);
            start.seconds = Some(item.seconds);
            start.parent = item.parent.clone();
            start.source = item.adjust_source.clone();
            start.ratio = item.ratio;
            self.events.record(start).await;

            // Branch valve first, then the supply: the main line must never
            // pressurise against a closed branch.
            let mut driver = self.driver.lock().await;
            driver.set_zone(zone, true);
            driver.apply();
            if let Some(master) = master.filter(|m| *m != zone && *m < zone_count) {
                driver.set_zone(master, true);
                driver.apply();
            }
        }

        self.ran_since_idle = true;
        self.running = Some(Active {
            remaining: item.seconds,
            started_at: Utc::now().timestamp(),
            item,
        });
        self.tick_at = Some(Instant::now() + Duration::from_secs(1));
        self.publish_status().await;
    }

    async fn tick_second(&mut self) {
        let Some(active) = self.running.as_mut() else {
            self.tick_at = None;
            return;
        };
        active.remaining -= 1;
        if active.remaining > 0 {
            self.tick_at = Some(self.tick_at.unwrap_or_else(Instant::now) + Duration::from_secs(1));
            self.publish_status().await;
            return;
        }
        self.tick_at = None;
        self.finish_current().await;
    }

    async fn finish_current(&mut self) {
        let Some(active) = self.running.take() else {
            return;
        };

        if let ZoneTarget::Zone(zone) = active.item.zone {
            {
                // Supply closes first, branch second, mirroring start-up.
                let (zone_count, master) = {
                    let cfg = self.config.read().await;
                    (cfg.zones.len(), cfg.zone(zone).and_then(|z| z.master))
                };
                let mut driver = self.driver.lock().await;
                if let Some(master) = master.filter(|m| *m != zone && *m < zone_count) {
                    driver.set_zone(master, false);
                    driver.apply();
                }
                driver.set_zone(zone, false);
                driver.apply();
            }

            let mut end = EventRecord::new(Action::End);
            end.zone = Some(zone as i64);
            end.seconds = Some(active.item.seconds);
            end.parent = active.item.parent.clone();
            self.events.record(end).await;

            self.settle_until = Some(Instant::now() + Duration::from_secs(SETTLE_SEC));
        }

        // END for the outgoing program once its last item has run.
        if let Some(parent) = &active.item.parent {
            let next_parent = self.queue.front().and_then(|n| n.parent.as_deref());
            if next_parent != Some(parent.as_str()) {
                let mut end = EventRecord::new(Action::End);
                end.program = Some(parent.clone());
                self.events.record(end).await;
            }
        }

        self.publish_status().await;
    }

    // -- Cancellation -------------------------------------------------------

    /// Drain the queue, cancel the in-flight run, de-energise the bank.
    /// Safe to call when already idle.
    async fn kill_queue(&mut self) {
        self.tick_at = None;
        self.settle_until = None;

        if let Some(active) = self.running.take() {
            let mut cancel = EventRecord::new(Action::Cancel);
            if let ZoneTarget::Zone(zone) = active.item.zone {
                cancel.zone = Some(zone as i64);
            }
            cancel.parent = active.item.parent.clone();
            cancel.runtime = Some(active.item.seconds - active.remaining);
            self.events.record(cancel).await;
        }
        self.queue.clear();

        let zone_count = self.config.read().await.zones.len();
        let mut driver = self.driver.lock().await;
        for zone in 0..zone_count {
            driver.set_zone(zone, false);
        }
        driver.apply();
        drop(driver);

        self.publish_status().await;
    }

    // -- Button walk-through ------------------------------------------------

    async fn button_fire(&mut self) {
        let Some(walk) = self.button.take() else {
            return;
        };
        let zone_count = self.config.read().await.zones.len();
        if walk.candidate >= zone_count {
            // Walked past the last zone: park, start nothing this cycle.
            info!("button walk wrapped — no zone started");
            return;
        }
        info!(zone = walk.candidate, "button start");
        self.kill_queue().await;
        self.queue.push_back(RunItem {
            zone: ZoneTarget::Zone(walk.candidate),
            seconds: BUTTON_RUN_SEC,
            parent: None,
            adjust_source: None,
            ratio: None,
        });
    }

    // -- Status -------------------------------------------------------------

    async fn publish_status(&self) {
        let running = self.running.as_ref().map(|a| RunningInfo {
            zone: match a.item.zone {
                ZoneTarget::Zone(z) => Some(z),
                ZoneTarget::Pause => None,
            },
            parent: a.item.parent.clone(),
            seconds: a.item.seconds,
            remaining: a.remaining,
            started_at: a.started_at,
        });
        *self.status.write().await = RunStatus {
            running,
            queued: self.queue.len(),
        };
    }
}

// ===========================================================================
// Tests
// ===========================================================================
