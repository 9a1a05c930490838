//! Calendar import: fetch each configured iCalendar source on an
//! hour-aligned schedule, synthesise programs from the events, and keep
//! the imported list merged, deduplicated, and pruned.

pub mod ical;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{CalendarConfig, Config};
use crate::program::Program;

/// Sources refresh during the last minutes of each hour.
const REFRESH_MINUTE: u32 = 55;

// ---------------------------------------------------------------------------
// Per-calendar state
// ---------------------------------------------------------------------------

struct CalendarSource {
    cfg: CalendarConfig,
    /// False for unsupported format/scheme combinations or `disabled: true`.
    enabled: bool,
    ok: bool,
    updated: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarStatus {
    pub name: String,
    pub ok: bool,
    pub updated: Option<i64>,
}

fn source_supported(cfg: &CalendarConfig) -> bool {
    let format_ok = cfg.format.eq_ignore_ascii_case("icalendar")
        || cfg.format.eq_ignore_ascii_case("ical")
        || cfg.format.eq_ignore_ascii_case("ics");
    let scheme_ok = cfg.source.starts_with("http://")
        || cfg.source.starts_with("https://")
        || cfg.source.starts_with("file:");
    format_ok && scheme_ok
}

// ---------------------------------------------------------------------------
// Importer
// ---------------------------------------------------------------------------

pub struct CalendarImporter {
    sources: Vec<CalendarSource>,
    programs: Vec<Program>,
    /// "YYYYMMDDHH" of the last refresh pass; one pass per wall-clock hour.
    last_fetch_hour: Option<String>,
    forced: bool,
    client: reqwest::Client,
}

impl CalendarImporter {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            programs: Vec::new(),
            last_fetch_hour: None,
            forced: false,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Rebuild the source list from configuration and prune programs whose
    /// parent calendar no longer exists.
    pub fn configure(&mut self, cfg: &Config) {
        self.sources = cfg
            .calendars
            .iter()
            .map(|c| {
                let supported = source_supported(c);
                if !supported {
                    warn!(
                        calendar = %c.name,
                        format = %c.format,
                        source = %c.source,
                        "unsupported calendar — disabled"
                    );
                }
                CalendarSource {
                    enabled: supported && !c.disabled,
                    cfg: c.clone(),
                    ok: false,
                    updated: None,
                }
            })
            .collect();

        self.programs.retain(|p| {
            p.parent_calendar()
                .map(|cal| self.sources.iter().any(|s| s.cfg.name == cal))
                .unwrap_or(false)
        });
    }

    /// Currently active imported programs.
    pub fn programs(&self) -> Vec<Program> {
        self.programs.iter().filter(|p| p.active).cloned().collect()
    }

    /// The scheduler writes anchors and one-shot deactivation through this.
    pub fn programs_mut(&mut self) -> &mut Vec<Program> {
        &mut self.programs
    }

    pub fn status(&self) -> Vec<CalendarStatus> {
        self.sources
            .iter()
            .map(|s| CalendarStatus {
                name: s.cfg.name.clone(),
                ok: s.ok,
                updated: s.updated,
            })
            .collect()
    }

    /// Bypass the hourly throttle on the next heartbeat.
    pub fn force_refresh(&mut self) {
        self.forced = true;
    }

    /// Heartbeat. Fetches at most once per wall-clock hour, only at minute
    /// ≥ 55, sources strictly one at a time; a failing source keeps its
    /// previous programs and the rest of the pass continues.
    pub async fn refresh(&mut self, cfg: &Config, now: DateTime<Tz>) {
        let hour_key = now.format("%Y%m%d%H").to_string();
        if !self.forced {
            if now.minute() < REFRESH_MINUTE {
                return;
            }
            if self.last_fetch_hour.as_deref() == Some(hour_key.as_str()) {
                return;
            }
        }
        self.forced = false;
        self.last_fetch_hour = Some(hour_key);

        for i in 0..self.sources.len() {
            if !self.sources[i].enabled {
                continue;
            }
            let source_cfg = self.sources[i].cfg.clone();
            match fetch_text(&self.client, &source_cfg.source).await {
                Ok(text) => {
                    let fresh = ical::import_calendar(&text, &source_cfg, cfg, now);
                    info!(
                        calendar = %source_cfg.name,
                        programs = fresh.len(),
                        "calendar refreshed"
                    );
                    self.merge(&source_cfg.name, fresh);
                    self.sources[i].ok = true;
                    self.sources[i].updated = Some(now.with_timezone(&Utc).timestamp());
                }
                Err(e) => {
                    warn!(calendar = %source_cfg.name, "calendar fetch failed: {e:#}");
                    self.sources[i].ok = false;
                }
            }
        }

        self.dedup();
    }

    /// Replace one calendar's programs with a fresh parse. A program that
    /// was inactive before the parse stays inactive: refreshed entries
    /// inherit the flag, entries the parse no longer produces survive as
    /// inactive tombstones so a ran one-shot cannot re-arm.
    fn merge(&mut self, calendar: &str, fresh: Vec<Program>) {
        let mut previous: Vec<Program> = Vec::new();
        self.programs.retain(|p| {
            if p.parent_calendar() == Some(calendar) {
                previous.push(p.clone());
                false
            } else {
                true
            }
        });

        let mut merged = fresh;
        for program in &mut merged {
            if let Some(old) = previous.iter().find(|o| o.name == program.name) {
                if !old.active {
                    program.active = false;
                }
            }
        }
        for old in previous {
            if !old.active && !merged.iter().any(|p| p.name == old.name) {
                merged.push(old);
            }
        }
        self.programs.extend(merged);
    }

    fn dedup(&mut self) {
        let mut seen: Vec<String> = Vec::new();
        self.programs.retain(|p| {
            if seen.contains(&p.name) {
                false
            } else {
                seen.push(p.name.clone());
                true
            }
        });
    }
}

impl Default for CalendarImporter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

async fn fetch_text(client: &reqwest::Client, source: &str) -> Result<String> {
    if let Some(path) = source
        .strip_prefix("file://")
        .or_else(|| source.strip_prefix("file:"))
    {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {path}"));
    }

    let response = client
        .get(source)
        .send()
        .await
        .with_context(|| format!("request to {source} failed"))?;
    if !response.status().is_success() {
        return Err(anyhow!("{source} returned {}", response.status()));
    }
    response.text().await.context("bad response body")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use chrono::TimeZone;

    const TZ: Tz = chrono_tz::America::Denver;

    fn at(d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        TZ.with_ymd_and_hms(2024, 6, d, h, mi, 0).unwrap()
    }

    fn write_ics(name: &str, body: &str) -> String {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, body).unwrap();
        format!("file:{}", path.display())
    }

    fn config_with_calendar(source: &str) -> Config {
        config::parse(&format!(
            r#"{{
                "timezone": "America/Denver",
                "zones": [{{"name": "lawn"}}, {{"name": "beds"}}],
                "calendars": [{{"name": "yard", "format": "iCalendar", "source": "{source}"}}]
            }}"#
        ))
        .unwrap()
    }

    const WEEKLY_EVENT: &str = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:1\r\nSUMMARY:Mow\r\n\
        DTSTART:20240604T060000\r\nRRULE:FREQ=WEEKLY;BYDAY=TU\r\nDESCRIPTION:lawn=10\r\n\
        END:VEVENT\r\nEND:VCALENDAR\r\n";

    // -- Source validation --------------------------------------------------

    #[test]
    fn unsupported_format_or_scheme_is_disabled() {
        let mut importer = CalendarImporter::new();
        let cfg = config::parse(
            r#"{"calendars": [
                {"name": "a", "format": "csv", "source": "http://x"},
                {"name": "b", "format": "iCalendar", "source": "ftp://x"},
                {"name": "c", "format": "iCalendar", "source": "https://x"}
            ]}"#,
        )
        .unwrap();
        importer.configure(&cfg);
        assert!(!importer.sources[0].enabled);
        assert!(!importer.sources[1].enabled);
        assert!(importer.sources[2].enabled);
    }

    #[test]
    fn disabled_flag_is_honoured() {
        let mut importer = CalendarImporter::new();
        let cfg = config::parse(
            r#"{"calendars": [{"name": "a", "format": "iCalendar",
                               "source": "https://x", "disabled": true}]}"#,
        )
        .unwrap();
        importer.configure(&cfg);
        assert!(!importer.sources[0].enabled);
    }

    // -- Throttle -----------------------------------------------------------

    #[tokio::test]
    async fn refresh_waits_for_minute_55() {
        let source = write_ics("throttle_a.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.refresh(&cfg, at(10, 12, 30)).await;
        assert!(importer.programs().is_empty());

        importer.refresh(&cfg, at(10, 12, 56)).await;
        assert_eq!(importer.programs().len(), 1);
    }

    #[tokio::test]
    async fn refresh_runs_once_per_hour() {
        let source = write_ics("throttle_b.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.refresh(&cfg, at(10, 12, 55)).await;
        let first = importer.status()[0].updated;
        assert!(first.is_some());

        importer.refresh(&cfg, at(10, 12, 58)).await;
        assert_eq!(importer.status()[0].updated, first);

        importer.refresh(&cfg, at(10, 13, 55)).await;
        assert!(importer.status()[0].updated > first);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_throttle() {
        let source = write_ics("throttle_c.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 5)).await;
        assert_eq!(importer.programs().len(), 1);
    }

    // -- Failure handling ---------------------------------------------------

    #[tokio::test]
    async fn missing_file_marks_calendar_failed() {
        let cfg = config_with_calendar("file:/nonexistent/cal.ics");
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 55)).await;

        let status = importer.status();
        assert!(!status[0].ok);
        assert!(status[0].updated.is_none());
    }

    #[tokio::test]
    async fn failed_source_keeps_previous_programs() {
        let source = write_ics("keep_prev.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 55)).await;
        assert_eq!(importer.programs().len(), 1);

        // Swap the source for a missing path; the program list survives.
        let cfg_bad = config_with_calendar("file:/nonexistent/cal.ics");
        importer.configure(&cfg_bad);
        importer.force_refresh();
        importer.refresh(&cfg_bad, at(10, 13, 55)).await;
        assert_eq!(importer.programs().len(), 1);
        assert!(!importer.status()[0].ok);
    }

    // -- Merge semantics ----------------------------------------------------

    #[tokio::test]
    async fn inactive_refreshed_program_stays_inactive() {
        let source = write_ics("merge_a.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 55)).await;
        importer.programs_mut()[0].active = false;

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 13, 55)).await;
        assert!(importer.programs().is_empty());
        assert_eq!(importer.programs_mut().len(), 1);
        assert!(!importer.programs_mut()[0].active);
    }

    #[tokio::test]
    async fn vanished_inactive_program_survives_as_tombstone() {
        let source = write_ics("merge_b.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 55)).await;
        importer.programs_mut()[0].active = false;

        // The event disappears from the calendar.
        std::fs::write(
            std::env::temp_dir().join("merge_b.ics"),
            "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n",
        )
        .unwrap();
        importer.force_refresh();
        importer.refresh(&cfg, at(10, 13, 55)).await;

        assert_eq!(importer.programs_mut().len(), 1);
        assert!(!importer.programs_mut()[0].active);
    }

    #[tokio::test]
    async fn configure_prunes_orphaned_calendars() {
        let source = write_ics("prune_a.ics", WEEKLY_EVENT);
        let cfg = config_with_calendar(&source);
        let mut importer = CalendarImporter::new();
        importer.configure(&cfg);

        importer.force_refresh();
        importer.refresh(&cfg, at(10, 12, 55)).await;
        assert_eq!(importer.programs().len(), 1);

        // The calendar leaves the configuration entirely.
        let empty = config::parse(r#"{"zones": [{"name": "lawn"}]}"#).unwrap();
        importer.configure(&empty);
        assert!(importer.programs().is_empty());
    }
}
