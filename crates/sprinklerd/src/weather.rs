//! Runtime adjustment providers: current-conditions weather and the
//! published watering index. Both poll on an armed-slot schedule from the
//! 60-second heartbeat and convert configured zone seconds through an
//! integer percentage.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{WateringIndexConfig, WeatherConfig};

/// Without configured slots, fetch when this much time has passed.
const FALLBACK_REFRESH_SEC: i64 = 6 * 3600;

/// Re-configuring with data already cached defers the next fetch this far.
const RECONFIGURE_DEFER_SEC: i64 = 600;

/// Integer percentage application with half-up rounding.
pub fn percent_of(seconds: i64, percent: i64) -> i64 {
    ((seconds * percent) + 50) / 100
}

// ---------------------------------------------------------------------------
// Refresh schedule (arming is data, not control flow)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSlot {
    pub hour: u32,
    pub minute: u32,
    pub armed: bool,
}

/// Ordered one-shot-per-hour fetch slots plus a pending override used for
/// the initial fetch and the post-reconfigure defer.
#[derive(Debug, Default)]
pub struct RefreshSchedule {
    slots: Vec<RefreshSlot>,
    last_attempt: Option<DateTime<Utc>>,
    pending_at: Option<DateTime<Utc>>,
}

impl RefreshSchedule {
    /// Parse "HH" / "HH:MM" slot specs; malformed entries are dropped.
    pub fn new(specs: &[String]) -> Self {
        let slots = specs
            .iter()
            .filter_map(|s| {
                let (h, m) = match s.split_once(':') {
                    Some((h, m)) => (h.parse().ok()?, m.parse().ok()?),
                    None => (s.trim().parse().ok()?, 0),
                };
                (h < 24 && m < 60).then_some(RefreshSlot {
                    hour: h,
                    minute: m,
                    armed: true,
                })
            })
            .collect();
        Self {
            slots,
            last_attempt: None,
            pending_at: None,
        }
    }

    /// Schedule a one-off fetch at `at`, overriding the slot logic until it
    /// fires.
    pub fn pend(&mut self, at: DateTime<Utc>) {
        self.pending_at = Some(at);
    }

    /// Heartbeat decision: should a fetch happen now? Updates slot arming.
    pub fn due(&mut self, now: DateTime<Tz>) -> bool {
        let now_utc = now.with_timezone(&Utc);

        if let Some(pending) = self.pending_at {
            if now_utc >= pending {
                self.pending_at = None;
                return true;
            }
            return false;
        }

        let mut due = false;
        for slot in &mut self.slots {
            if now.hour() != slot.hour {
                slot.armed = true;
            } else if slot.armed && now.minute() >= slot.minute {
                slot.armed = false;
                due = true;
            }
        }
        if due {
            return true;
        }

        if self.slots.is_empty() {
            return match self.last_attempt {
                None => true,
                Some(last) => (now_utc - last).num_seconds() >= FALLBACK_REFRESH_SEC,
            };
        }
        false
    }

    pub fn mark_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

/// One station observation, already unit-normalised: °F, %, inches today.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub temperature: f64,
    pub humidity: f64,
    pub rain_today: f64,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, cfg: &WeatherConfig, zipcode: Option<&str>) -> Result<Observation>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjusterStatus {
    pub enabled: bool,
    pub ok: bool,
    pub updated: Option<i64>,
    pub adjustment: i64,
}

pub struct WeatherAdjuster {
    cfg: Option<WeatherConfig>,
    zipcode: Option<String>,
    schedule: RefreshSchedule,
    provider: Arc<dyn WeatherProvider>,
    observation: Option<Observation>,
    updated: Option<i64>,
    ok: bool,
}

impl WeatherAdjuster {
    pub fn new(provider: Arc<dyn WeatherProvider>) -> Self {
        Self {
            cfg: None,
            zipcode: None,
            schedule: RefreshSchedule::default(),
            provider,
            observation: None,
            updated: None,
            ok: false,
        }
    }

    /// Rebuild from configuration. Cached data survives, and when present
    /// the next fetch is deferred so a fleet of re-activations cannot
    /// stampede the provider.
    pub fn configure(&mut self, cfg: Option<WeatherConfig>, zipcode: Option<String>, now: DateTime<Utc>) {
        self.schedule = RefreshSchedule::new(
            cfg.as_ref().map(|c| c.refresh.as_slice()).unwrap_or(&[]),
        );
        let defer = if self.observation.is_some() {
            RECONFIGURE_DEFER_SEC
        } else {
            0
        };
        self.schedule.pend(now + chrono::Duration::seconds(defer));
        self.cfg = cfg;
        self.zipcode = zipcode;
    }

    pub fn enabled(&self) -> bool {
        self.cfg
            .as_ref()
            .map(|c| c.enable && c.adjust.enable)
            .unwrap_or(false)
    }

    pub fn set_enabled(&mut self, on: bool) {
        if let Some(cfg) = &mut self.cfg {
            cfg.enable = on;
        }
    }

    pub fn source(&self) -> &'static str {
        "WEATHER"
    }

    pub fn updated(&self) -> Option<i64> {
        self.updated
    }

    pub fn observation(&self) -> Option<&Observation> {
        self.observation.as_ref()
    }

    pub fn status(&self) -> AdjusterStatus {
        AdjusterStatus {
            enabled: self.enabled(),
            ok: self.ok,
            updated: self.updated,
            adjustment: self.adjustment(),
        }
    }

    /// Documented adjustment formula, as a percentage of normal watering:
    /// `humidity_base − humidity + 4·(temp − temp_base) − 200·rain`,
    /// scaled by sensitivity, floored at zero around the 100% baseline.
    pub fn adjustment(&self) -> i64 {
        let (Some(cfg), Some(obs)) = (&self.cfg, &self.observation) else {
            return 100;
        };
        let a = &cfg.adjust;
        let delta = a.humidity - obs.humidity + 4.0 * (obs.temperature - a.temperature)
            - 200.0 * obs.rain_today;
        let scaled = delta * a.sensitivity as f64 / 100.0;
        ((100.0 + scaled) as i64).max(0)
    }

    /// Adjusted seconds, clamped to the configured min/max percentages.
    pub fn adjust(&self, seconds: i64) -> i64 {
        let Some(cfg) = &self.cfg else {
            return seconds;
        };
        percent_of(seconds, self.adjustment()).clamp(
            percent_of(seconds, cfg.adjust.min),
            percent_of(seconds, cfg.adjust.max),
        )
    }

    /// True when today's rain has reached the configured trigger depth.
    pub fn rainsensor(&self) -> bool {
        match (&self.cfg, &self.observation) {
            (Some(cfg), Some(obs)) if cfg.enable => cfg.raintrigger > 0.0 && cfg.raintrigger <= obs.rain_today,
            _ => false,
        }
    }

    /// Ask the control surface for a fetch on the next heartbeat.
    pub fn force_refresh(&mut self, now: DateTime<Utc>) {
        self.schedule.pend(now);
    }

    /// Heartbeat. Fetches only when a slot is due; returns true when a
    /// fetch succeeded (the caller records the UPDATE event).
    pub async fn refresh(&mut self, now: DateTime<Tz>) -> bool {
        let Some(cfg) = self.cfg.clone().filter(|c| c.enable) else {
            return false;
        };
        if !self.schedule.due(now) {
            return false;
        }
        let now_utc = now.with_timezone(&Utc);
        self.schedule.mark_attempt(now_utc);

        match self.provider.fetch(&cfg, self.zipcode.as_deref()).await {
            Ok(obs) => {
                info!(
                    temperature = obs.temperature,
                    humidity = obs.humidity,
                    rain = obs.rain_today,
                    "weather updated"
                );
                self.observation = Some(obs);
                self.updated = Some(now_utc.timestamp());
                self.ok = true;
                true
            }
            Err(e) => {
                warn!("weather fetch failed: {e:#}");
                self.ok = false;
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watering index
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IndexProvider: Send + Sync {
    async fn fetch(&self, cfg: &WateringIndexConfig, zipcode: Option<&str>) -> Result<i64>;
}

pub struct WateringIndexAdjuster {
    cfg: Option<WateringIndexConfig>,
    zipcode: Option<String>,
    schedule: RefreshSchedule,
    provider: Arc<dyn IndexProvider>,
    percent: Option<i64>,
    updated: Option<i64>,
    ok: bool,
}

impl WateringIndexAdjuster {
    pub fn new(provider: Arc<dyn IndexProvider>) -> Self {
        Self {
            cfg: None,
            zipcode: None,
            schedule: RefreshSchedule::default(),
            provider,
            percent: None,
            updated: None,
            ok: false,
        }
    }

    pub fn configure(&mut self, cfg: Option<WateringIndexConfig>, zipcode: Option<String>, now: DateTime<Utc>) {
        self.schedule = RefreshSchedule::new(
            cfg.as_ref().map(|c| c.refresh.as_slice()).unwrap_or(&[]),
        );
        let defer = if self.percent.is_some() {
            RECONFIGURE_DEFER_SEC
        } else {
            0
        };
        self.schedule.pend(now + chrono::Duration::seconds(defer));
        self.cfg = cfg;
        self.zipcode = zipcode;
    }

    pub fn enabled(&self) -> bool {
        self.cfg.as_ref().map(|c| c.enable).unwrap_or(false)
    }

    pub fn set_enabled(&mut self, on: bool) {
        if let Some(cfg) = &mut self.cfg {
            cfg.enable = on;
        }
    }

    /// Uppercased provider tag, e.g. "WATERDEX".
    pub fn source(&self) -> String {
        self.cfg
            .as_ref()
            .map(|c| c.provider.to_uppercase())
            .unwrap_or_else(|| "INDEX".to_string())
    }

    pub fn updated(&self) -> Option<i64> {
        self.updated
    }

    /// Published percentage of normal watering; 100 when unavailable.
    pub fn adjustment(&self) -> i64 {
        self.percent.unwrap_or(100)
    }

    pub fn adjust(&self, seconds: i64) -> i64 {
        let Some(cfg) = &self.cfg else {
            return seconds;
        };
        percent_of(seconds, self.adjustment()).clamp(
            percent_of(seconds, cfg.adjust.min),
            percent_of(seconds, cfg.adjust.max),
        )
    }

    pub fn status(&self) -> AdjusterStatus {
        AdjusterStatus {
            enabled: self.enabled(),
            ok: self.ok,
            updated: self.updated,
            adjustment: self.adjustment(),
        }
    }

    pub fn force_refresh(&mut self, now: DateTime<Utc>) {
        self.schedule.pend(now);
    }

    pub async fn refresh(&mut self, now: DateTime<Tz>) -> bool {
        let Some(cfg) = self.cfg.clone().filter(|c| c.enable) else {
            return false;
        };
        if !self.schedule.due(now) {
            return false;
        }
        let now_utc = now.with_timezone(&Utc);
        self.schedule.mark_attempt(now_utc);

        match self.provider.fetch(&cfg, self.zipcode.as_deref()).await {
            Ok(percent) => {
                info!(percent, provider = %cfg.provider, "watering index updated");
                self.percent = Some(percent);
                self.updated = Some(now_utc.timestamp());
                self.ok = true;
                true
            }
            Err(e) => {
                warn!("watering index fetch failed: {e:#}");
                self.ok = false;
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP providers
// ---------------------------------------------------------------------------

/// Personal-weather-station observations over the Weather Underground API.
pub struct WundergroundProvider {
    client: reqwest::Client,
}

impl WundergroundProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for WundergroundProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WeatherProvider for WundergroundProvider {
    async fn fetch(&self, cfg: &WeatherConfig, _zipcode: Option<&str>) -> Result<Observation> {
        let station = cfg
            .station
            .as_deref()
            .ok_or_else(|| anyhow!("no weather station configured"))?;
        let url = format!(
            "https://api.weather.com/v2/pws/observations/current?stationId={station}&format=json&units=e&apiKey={}",
            cfg.key
        );

        let response = self.client.get(&url).send().await.context("request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("station query returned {}", response.status()));
        }
        let body: serde_json::Value = response.json().await.context("bad response body")?;

        let obs = body
            .get("observations")
            .and_then(|o| o.get(0))
            .ok_or_else(|| anyhow!("no observations in response"))?;
        let imperial = obs
            .get("imperial")
            .ok_or_else(|| anyhow!("no imperial block in observation"))?;

        Ok(Observation {
            temperature: imperial
                .get("temp")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow!("missing temperature"))?,
            humidity: obs
                .get("humidity")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow!("missing humidity"))?,
            rain_today: imperial
                .get("precipTotal")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        })
    }
}

/// Published watering-index percentage, scraped from the provider page.
pub struct HttpIndexProvider {
    client: reqwest::Client,
}

impl HttpIndexProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for HttpIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// First integer immediately preceding a '%' in the body.
pub fn scrape_percent(body: &str) -> Option<i64> {
    let bytes = body.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let mut start = i;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start < i {
            if let Ok(v) = body[start..i].parse() {
                return Some(v);
            }
        }
    }
    None
}

#[async_trait]
impl IndexProvider for HttpIndexProvider {
    async fn fetch(&self, cfg: &WateringIndexConfig, zipcode: Option<&str>) -> Result<i64> {
        let url = match cfg.provider.as_str() {
            "waterdex" => format!(
                "https://waterdex.com/watering-index/{}",
                zipcode.unwrap_or("")
            ),
            "mwdsocal" => "https://www.mwdsocal.org/en/your-water/how-to-save-water/watering-index".to_string(),
            other => return Err(anyhow!("unknown watering-index provider '{other}'")),
        };

        let response = self.client.get(&url).send().await.context("request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("index query returned {}", response.status()));
        }
        let body = response.text().await.context("bad response body")?;
        scrape_percent(&body).ok_or_else(|| anyhow!("no percentage found in response"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
