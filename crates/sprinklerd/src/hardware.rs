//! Output-bank drivers. The `gpio` feature gates the real rppal relay
//! board; the simulated driver covers development boxes, `production:
//! false` deployments, and tests (which also use its forced-input hooks).

use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;

/// Edge callback payload: the new input level.
pub type EdgeCallback = Box<dyn Fn(bool) + Send + Sync>;

// ---------------------------------------------------------------------------
// Capability contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub id: &'static str,
    pub title: &'static str,
    /// Zones can be added freely (no fixed bank size).
    pub add_zones: bool,
    /// Zones address individual pins rather than bank positions.
    pub pin_per_zone: bool,
    pub max_zones: Option<usize>,
}

/// The operations the engine calls on any output back-end.
///
/// `set_zone` and `apply` are best-effort and never raise: a driver whose
/// pins are not yet accessible stores the intended value and flushes it
/// once ready. Drivers that cannot observe an input report `false`.
pub trait HardwareDriver: Send + Sync {
    fn info(&self) -> DriverInfo;

    /// Rebuild pin state from configuration. Re-entrant: called once at
    /// boot and again on every config activation.
    fn configure(&mut self, hw: &HardwareConfig, cfg: &Config);

    fn set_zone(&mut self, index: usize, on: bool);

    /// Commit pending bank state to the hardware. A no-op for per-pin
    /// drivers; shift-register banks transfer the whole bank here.
    fn apply(&mut self);

    fn rain_sensor(&self) -> bool;
    fn button(&self) -> bool;

    fn rain_interrupt(&mut self, cb: EdgeCallback);
    fn button_interrupt(&mut self, cb: EdgeCallback);

    /// Boot-race support: false while the driver is still waiting for its
    /// pins. The daemon retries `retry_init` at 200 ms until ready.
    fn ready(&self) -> bool {
        true
    }
    fn retry_init(&mut self) {}
}

pub type SharedDriver = Arc<tokio::sync::Mutex<Box<dyn HardwareDriver>>>;

// ---------------------------------------------------------------------------
// hardware.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "HardwareConfig::default_driver")]
    pub driver: String,
    /// Default output polarity; a zone's `on: "HIGH"|"LOW"` overrides it.
    #[serde(default = "HardwareConfig::default_active_low")]
    pub active_low: bool,
    /// Input pins for the rain sensor and button, where the board has them.
    #[serde(default)]
    pub rain_pin: Option<u8>,
    #[serde(default)]
    pub button_pin: Option<u8>,
}

impl HardwareConfig {
    fn default_driver() -> String {
        "sim".to_string()
    }
    fn default_active_low() -> bool {
        true
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            driver: Self::default_driver(),
            active_low: Self::default_active_low(),
            rain_pin: None,
            button_pin: None,
        }
    }
}

/// Read `hardware.json`; a missing file selects the simulated driver.
pub fn load_hardware_config(path: &Path) -> HardwareConfig {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(hw) => hw,
            Err(e) => {
                warn!("bad hardware config {}: {e} — using simulated driver", path.display());
                HardwareConfig::default()
            }
        },
        Err(_) => HardwareConfig::default(),
    }
}

/// Pick a driver for the configuration. Anything but the real board on a
/// `production` config comes back simulated.
pub fn build_driver(hw: &HardwareConfig, cfg: &Config) -> Box<dyn HardwareDriver> {
    #[cfg(feature = "gpio")]
    if cfg.production && hw.driver == "relay" {
        let mut driver = relay::RelayDriver::new();
        driver.configure(hw, cfg);
        return Box::new(driver);
    }

    if cfg.production {
        warn!(driver = %hw.driver, "no hardware back-end available — simulating");
    }
    let mut driver = SimDriver::new();
    driver.configure(hw, cfg);
    Box::new(driver)
}

// ---------------------------------------------------------------------------
// Simulated driver
// ---------------------------------------------------------------------------

/// Shared view of a simulated bank's committed state, for status display
/// and test assertions while the driver itself is boxed behind the trait.
pub type BankHandle = Arc<std::sync::Mutex<Vec<bool>>>;

/// In-memory bank. Writes land in `pending` and only become visible in
/// `applied` after `apply()`, mimicking a shift-register transfer so the
/// engine's commit discipline is exercised in tests.
pub struct SimDriver {
    pending: Vec<bool>,
    applied: BankHandle,
    rain: Arc<AtomicBool>,
    button: Arc<AtomicBool>,
    rain_cb: Option<EdgeCallback>,
    button_cb: Option<EdgeCallback>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            applied: Arc::new(std::sync::Mutex::new(Vec::new())),
            rain: Arc::new(AtomicBool::new(false)),
            button: Arc::new(AtomicBool::new(false)),
            rain_cb: None,
            button_cb: None,
        }
    }

    /// Handle to the committed bank state; stays valid after the driver is
    /// moved behind `dyn HardwareDriver`.
    pub fn bank(&self) -> BankHandle {
        Arc::clone(&self.applied)
    }

    /// Handle to the rain input, for forcing it from outside the trait.
    pub fn rain_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.rain)
    }

    /// Test hook: force the rain input and fire the registered edge callback.
    pub fn force_rain(&self, level: bool) {
        self.rain.store(level, Ordering::SeqCst);
        if let Some(cb) = &self.rain_cb {
            cb(level);
        }
    }

    /// Test hook: force the button input and fire the registered edge callback.
    pub fn force_button(&self, level: bool) {
        self.button.store(level, Ordering::SeqCst);
        if let Some(cb) = &self.button_cb {
            cb(level);
        }
    }

    /// Committed state of one zone.
    pub fn zone_state(&self, index: usize) -> bool {
        self.applied.lock().unwrap().get(index).copied().unwrap_or(false)
    }

    /// Number of committed-on zones.
    pub fn active_count(&self) -> usize {
        self.applied.lock().unwrap().iter().filter(|on| **on).count()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareDriver for SimDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            id: "sim",
            title: "Simulated output bank",
            add_zones: true,
            pin_per_zone: false,
            max_zones: None,
        }
    }

    fn configure(&mut self, _hw: &HardwareConfig, cfg: &Config) {
        self.pending = vec![false; cfg.zones.len()];
        *self.applied.lock().unwrap() = vec![false; cfg.zones.len()];
        info!(zones = cfg.zones.len(), "simulated output bank configured");
    }

    fn set_zone(&mut self, index: usize, on: bool) {
        if let Some(slot) = self.pending.get_mut(index) {
            *slot = on;
        } else {
            warn!(zone = index, "set_zone out of range — ignored");
        }
    }

    fn apply(&mut self) {
        self.applied.lock().unwrap().clone_from(&self.pending);
    }

    fn rain_sensor(&self) -> bool {
        self.rain.load(Ordering::SeqCst)
    }

    fn button(&self) -> bool {
        self.button.load(Ordering::SeqCst)
    }

    fn rain_interrupt(&mut self, cb: EdgeCallback) {
        self.rain_cb = Some(cb);
    }

    fn button_interrupt(&mut self, cb: EdgeCallback) {
        self.button_cb = Some(cb);
    }
}

// ---------------------------------------------------------------------------
// Relay board (production — rppal, one GPIO pin per zone)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
mod relay {
    use super::*;
    use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

    struct ZonePin {
        pin_no: u8,
        active_low: bool,
        pin: Option<OutputPin>,
    }

    /// Per-pin relay bank. `apply()` is a no-op; writes go straight to the
    /// pins once the GPIO chip is accessible. Until then the intended
    /// values are stored and flushed by the daemon's 200 ms retry loop.
    pub struct RelayDriver {
        hw: HardwareConfig,
        zones: Vec<ZonePin>,
        desired: Vec<bool>,
        rain_input: Option<InputPin>,
        ready: bool,
    }

    impl RelayDriver {
        pub fn new() -> Self {
            Self {
                hw: HardwareConfig::default(),
                zones: Vec::new(),
                desired: Vec::new(),
                rain_input: None,
                ready: false,
            }
        }

        fn write(&mut self, index: usize, on: bool) {
            let Some(zone) = self.zones.get_mut(index) else {
                return;
            };
            let Some(pin) = zone.pin.as_mut() else {
                return;
            };
            if on != zone.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }

        fn try_open(&mut self) -> bool {
            let gpio = match Gpio::new() {
                Ok(g) => g,
                Err(_) => return false,
            };
            for zone in &mut self.zones {
                match gpio.get(zone.pin_no) {
                    Ok(pin) => zone.pin = Some(pin.into_output()),
                    Err(_) => return false,
                }
            }
            if let Some(rain_pin) = self.hw.rain_pin {
                if let Ok(pin) = gpio.get(rain_pin) {
                    self.rain_input = Some(pin.into_input_pullup());
                }
            }
            true
        }
    }

    impl HardwareDriver for RelayDriver {
        fn info(&self) -> DriverInfo {
            DriverInfo {
                id: "relay",
                title: "GPIO relay board",
                add_zones: false,
                pin_per_zone: true,
                max_zones: Some(26),
            }
        }

        fn configure(&mut self, hw: &HardwareConfig, cfg: &Config) {
            self.hw = hw.clone();
            self.zones = cfg
                .zones
                .iter()
                .map(|z| ZonePin {
                    pin_no: z.pin.unwrap_or(0),
                    active_low: match z.on.as_deref() {
                        Some("HIGH") => false,
                        Some("LOW") => true,
                        _ => hw.active_low,
                    },
                    pin: None,
                })
                .collect();
            self.desired = vec![false; cfg.zones.len()];
            self.ready = self.try_open();
            if self.ready {
                // Fail-safe: every output off at configure time.
                for i in 0..self.zones.len() {
                    self.write(i, false);
                }
            } else {
                warn!("gpio not accessible yet — retrying in background");
            }
        }

        fn set_zone(&mut self, index: usize, on: bool) {
            if let Some(slot) = self.desired.get_mut(index) {
                *slot = on;
            }
            if self.ready {
                self.write(index, on);
            }
        }

        fn apply(&mut self) {}

        fn rain_sensor(&self) -> bool {
            self.rain_input
                .as_ref()
                .map(|pin| pin.is_low())
                .unwrap_or(false)
        }

        fn button(&self) -> bool {
            false
        }

        fn rain_interrupt(&mut self, cb: EdgeCallback) {
            if let Some(pin) = self.rain_input.as_mut() {
                let _ = pin.set_async_interrupt(Trigger::FallingEdge, move |_| cb(true));
            }
        }

        fn button_interrupt(&mut self, _cb: EdgeCallback) {}

        fn ready(&self) -> bool {
            self.ready
        }

        fn retry_init(&mut self) {
            if self.try_open() {
                self.ready = true;
                let desired = self.desired.clone();
                for (i, on) in desired.into_iter().enumerate() {
                    self.write(i, on);
                }
                info!("gpio became accessible — stored zone states applied");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
