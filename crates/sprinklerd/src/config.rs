//! JSON configuration document: zones, programs, calendars, seasons,
//! adjustment profiles, weather/index providers, event-log options.
//!
//! The daemon looks for `config.json` in the current directory first and
//! falls back to `/var/lib/sprinkler/config.json`; the same search applies
//! to `hardware.json` and the event database. A reload that fails to parse
//! keeps the last good configuration.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::program::Program;

/// Fallback directory for configuration and state files.
pub const STATE_DIR: &str = "/var/lib/sprinkler";

/// Default port for the external control surface.
const DEFAULT_WEB_PORT: u16 = 8080;

fn default_true() -> bool {
    true
}

fn default_web() -> WebServerConfig {
    WebServerConfig {
        port: DEFAULT_WEB_PORT,
    }
}

// ---------------------------------------------------------------------------
// Document structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master enable: when false the scheduler launches nothing
    /// (manual activation still works).
    #[serde(default = "default_true")]
    pub on: bool,
    /// When false, the hardware back-end is simulated.
    #[serde(default)]
    pub production: bool,
    /// Whether rain detection arms a 24h-1min launch hold.
    #[serde(default)]
    pub raindelay: bool,
    /// IANA timezone for all schedule decisions.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Calendar events must carry this location (case-insensitive).
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,

    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default)]
    pub calendars: Vec<CalendarConfig>,
    #[serde(default)]
    pub seasons: Vec<SeasonConfig>,
    #[serde(default)]
    pub adjust: Vec<AdjustProfileConfig>,

    #[serde(default)]
    pub weather: Option<WeatherConfig>,
    #[serde(default)]
    pub wateringindex: Option<WateringIndexConfig>,

    #[serde(default)]
    pub event: EventConfig,
    #[serde(default = "default_web")]
    pub webserver: WebServerConfig,
    #[serde(default)]
    pub udp: Option<UdpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            on: true,
            production: false,
            raindelay: false,
            timezone: None,
            location: None,
            zipcode: None,
            zones: Vec::new(),
            programs: Vec::new(),
            calendars: Vec::new(),
            seasons: Vec::new(),
            adjust: Vec::new(),
            weather: None,
            wateringindex: None,
            event: EventConfig::default(),
            webserver: default_web(),
            udp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    /// Output pin identifier; absent for bank positions addressed by index.
    #[serde(default)]
    pub pin: Option<u8>,
    /// "HIGH" or "LOW" active level for this output.
    #[serde(default)]
    pub on: Option<String>,
    /// Adjustment-profile name; "default" is consulted when absent.
    #[serde(default)]
    pub adjust: Option<String>,
    /// Split program runs into pulses of this many seconds.
    #[serde(default)]
    pub pulse: Option<i64>,
    /// Rest between pulse rounds, seconds.
    #[serde(default)]
    pub pause: Option<i64>,
    /// Zone index of the supply valve co-activated with this zone.
    #[serde(default)]
    pub master: Option<usize>,
    /// Program runs skip this zone; direct activation still works.
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub name: String,
    pub format: String,
    pub source: String,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// A season gates programs to months/weeks whose bit is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub name: String,
    #[serde(default)]
    pub monthly: Option<Vec<bool>>,
    #[serde(default)]
    pub weekly: Option<Vec<bool>>,
}

/// A named table of integer watering percentages by month or ISO week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustProfileConfig {
    pub name: String,
    #[serde(default)]
    pub monthly: Option<Vec<i64>>,
    #[serde(default)]
    pub weekly: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub station: Option<String>,
    /// Inches of rain today at which the provider counts as a rain sensor.
    #[serde(default)]
    pub raintrigger: f64,
    /// "HH" or "HH:MM" fetch slots, one shot per hour each.
    #[serde(default)]
    pub refresh: Vec<String>,
    #[serde(default)]
    pub adjust: WeatherAdjustConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherAdjustConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "WeatherAdjustConfig::default_min")]
    pub min: i64,
    #[serde(default = "WeatherAdjustConfig::default_max")]
    pub max: i64,
    #[serde(default = "WeatherAdjustConfig::default_temperature")]
    pub temperature: f64,
    #[serde(default = "WeatherAdjustConfig::default_humidity")]
    pub humidity: f64,
    #[serde(default = "WeatherAdjustConfig::default_sensitivity")]
    pub sensitivity: i64,
}

impl WeatherAdjustConfig {
    fn default_min() -> i64 {
        0
    }
    fn default_max() -> i64 {
        200
    }
    fn default_temperature() -> f64 {
        70.0
    }
    fn default_humidity() -> f64 {
        30.0
    }
    fn default_sensitivity() -> i64 {
        100
    }
}

impl Default for WeatherAdjustConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min: Self::default_min(),
            max: Self::default_max(),
            temperature: Self::default_temperature(),
            humidity: Self::default_humidity(),
            sensitivity: Self::default_sensitivity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WateringIndexConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "WateringIndexConfig::default_provider")]
    pub provider: String,
    #[serde(default)]
    pub refresh: Vec<String>,
    #[serde(default)]
    pub adjust: IndexAdjustConfig,
}

impl WateringIndexConfig {
    fn default_provider() -> String {
        "waterdex".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexAdjustConfig {
    #[serde(default = "WeatherAdjustConfig::default_min")]
    pub min: i64,
    #[serde(default = "WeatherAdjustConfig::default_max")]
    pub max: i64,
}

impl Default for IndexAdjustConfig {
    fn default() -> Self {
        Self { min: 0, max: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Mirror every record as a formatted log line.
    #[serde(default)]
    pub syslog: bool,
    /// Purge records older than this many days; 0 disables.
    #[serde(default)]
    pub cleanup: i64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            syslog: false,
            cleanup: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Zone index + lookup helpers
// ---------------------------------------------------------------------------

impl Config {
    /// The configured timezone, falling back to UTC when absent or invalid.
    pub fn tz(&self) -> Tz {
        self.timezone
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or(Tz::UTC)
    }

    /// Map a zone display name to its index (case-insensitive).
    pub fn zone_index(&self, name: &str) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| z.name.eq_ignore_ascii_case(name))
    }

    pub fn zone(&self, index: usize) -> Option<&ZoneConfig> {
        self.zones.get(index)
    }

    pub fn season(&self, name: &str) -> Option<&SeasonConfig> {
        self.seasons.iter().find(|s| s.name == name)
    }

    pub fn adjust_profile(&self, name: &str) -> Option<&AdjustProfileConfig> {
        self.adjust.iter().find(|a| a.name == name)
    }

    /// UDP discovery port defaults to the web port.
    pub fn udp_port(&self) -> u16 {
        self.udp
            .as_ref()
            .map(|u| u.port)
            .unwrap_or(self.webserver.port)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Resolve a state file: current directory first, then the system path.
pub fn search_path(file: &str) -> PathBuf {
    let local = PathBuf::from(file);
    if local.exists() {
        return local;
    }
    Path::new(STATE_DIR).join(file)
}

/// Read and parse a JSON config file.
pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(contents)?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
