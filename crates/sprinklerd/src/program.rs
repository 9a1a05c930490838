//! Watering programs: the authored/imported plan entities and the
//! "is it due this minute" evaluation the scheduler runs once per minute.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::SeasonConfig;

/// Exclusion moments match an occurrence within this many seconds.
const EXCLUSION_WINDOW_SEC: i64 = 60;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    None,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramZone {
    pub zone: usize,
    pub seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgramOptions {
    /// Launch without clearing the current run queue.
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Unique across the merged user+calendar list; imported programs are
    /// named `summary@calendar`.
    pub name: String,
    #[serde(default = "Program::default_active")]
    pub active: bool,
    /// Local start time, "HH:MM".
    pub start: String,
    #[serde(default)]
    pub repeat: Repeat,
    /// Every Nth day for `repeat: daily`.
    #[serde(default = "Program::default_interval")]
    pub interval: i64,
    /// Weekday mask for `repeat: weekly`, Sunday first.
    #[serde(default)]
    pub days: Vec<bool>,
    /// YYYYMMDD anchor; set to today the first time the start minute matches.
    #[serde(default)]
    pub date: Option<String>,
    /// YYYYMMDD upper bound.
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub options: ProgramOptions,
    #[serde(default)]
    pub zones: Vec<ProgramZone>,
    /// Replacement one-shot programs for specific occurrences (imported).
    #[serde(default)]
    pub exceptions: Vec<Program>,
    /// Occurrence moments to skip, local wall time (imported).
    #[serde(default)]
    pub exclusions: Vec<NaiveDateTime>,
}

impl Program {
    fn default_active() -> bool {
        true
    }

    fn default_interval() -> i64 {
        1
    }

    /// Calendar name for imported programs (`summary@calendar`).
    pub fn parent_calendar(&self) -> Option<&str> {
        self.name.rsplit_once('@').map(|(_, cal)| cal)
    }
}

// ---------------------------------------------------------------------------
// Due evaluation
// ---------------------------------------------------------------------------

/// Outcome of evaluating one program at one minute. The write-backs are
/// explicit so the caller owns the config mutation: `anchor` sets the
/// missing date, `deactivate` retires a one-shot whether or not it fired.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DueDecision {
    pub due: bool,
    pub anchor: Option<NaiveDate>,
    pub deactivate: bool,
}

pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

pub fn parse_yyyymmdd(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d").ok()
}

pub fn format_yyyymmdd(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

/// Decide whether `program` fires at `now`. Mirrors one scheduler minute:
/// start-minute match, `until` bound, exclusion window, date anchoring,
/// then the repeat rule.
pub fn check_due(program: &Program, now: &DateTime<Tz>) -> DueDecision {
    let mut decision = DueDecision::default();

    let Some((hour, minute)) = parse_hhmm(&program.start) else {
        return decision;
    };
    if now.hour() != hour || now.minute() != minute {
        return decision;
    }

    if let Some(until) = program.until.as_deref().and_then(parse_yyyymmdd) {
        if now.date_naive() > until {
            return decision;
        }
    }

    let now_naive = now.naive_local();
    for excl in &program.exclusions {
        if (now_naive - *excl).num_seconds().abs() < EXCLUSION_WINDOW_SEC {
            return decision;
        }
    }

    let delta = match program.date.as_deref().and_then(parse_yyyymmdd) {
        Some(anchor) => {
            let delta = (now.date_naive() - anchor).num_days();
            if delta < 0 {
                return decision;
            }
            delta
        }
        None => {
            decision.anchor = Some(now.date_naive());
            0
        }
    };

    match program.repeat {
        Repeat::Weekly => {
            let weekday = now.weekday().num_days_from_sunday() as usize;
            decision.due = program.days.get(weekday).copied().unwrap_or(false);
        }
        Repeat::Daily => {
            let interval = program.interval.max(1);
            decision.due = delta % interval == 0;
        }
        Repeat::None => {
            decision.deactivate = true;
            decision.due = delta == 0;
        }
    }

    decision
}

/// A program tagged with a season runs only when the current ISO week or
/// month bit is true; a missing bit does not block.
pub fn season_allows(season: &SeasonConfig, now: &DateTime<Tz>) -> bool {
    if let Some(weekly) = &season.weekly {
        let week = now.iso_week().week() as usize;
        return weekly.get(week.saturating_sub(1)).copied().unwrap_or(true);
    }
    if let Some(monthly) = &season.monthly {
        let month = now.month() as usize;
        return monthly.get(month - 1).copied().unwrap_or(true);
    }
    true
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    const TZ: Tz = chrono_tz::America::Denver;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        TZ.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn base_program() -> Program {
        Program {
            name: "P".into(),
            active: true,
            start: "07:00".into(),
            repeat: Repeat::Daily,
            interval: 1,
            days: Vec::new(),
            date: None,
            until: None,
            season: None,
            options: ProgramOptions::default(),
            zones: vec![ProgramZone {
                zone: 0,
                seconds: 60,
            }],
            exceptions: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    // -- Minute gate --------------------------------------------------------

    #[test]
    fn wrong_minute_is_never_due() {
        let p = base_program();
        let d = check_due(&p, &at(2024, 1, 2, 7, 1));
        assert!(!d.due);
        assert!(d.anchor.is_none());
        assert!(!d.deactivate);
    }

    #[test]
    fn unparseable_start_is_never_due() {
        let mut p = base_program();
        p.start = "7 o'clock".into();
        assert!(!check_due(&p, &at(2024, 1, 2, 7, 0)).due);
    }

    // -- Date anchoring -----------------------------------------------------

    #[test]
    fn missing_date_anchors_to_today_and_fires() {
        let p = base_program();
        let d = check_due(&p, &at(2024, 1, 2, 7, 0));
        assert!(d.due);
        assert_eq!(d.anchor, Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
    }

    #[test]
    fn future_anchor_does_not_fire() {
        let mut p = base_program();
        p.date = Some("20240110".into());
        assert!(!check_due(&p, &at(2024, 1, 2, 7, 0)).due);
    }

    // -- Daily interval -----------------------------------------------------

    #[test]
    fn daily_interval_two_skips_odd_days() {
        let mut p = base_program();
        p.interval = 2;
        p.date = Some("20240101".into());

        assert!(!check_due(&p, &at(2024, 1, 2, 7, 0)).due);
        assert!(check_due(&p, &at(2024, 1, 3, 7, 0)).due);
    }

    #[test]
    fn daily_interval_zero_behaves_like_every_day() {
        let mut p = base_program();
        p.interval = 0;
        p.date = Some("20240101".into());
        assert!(check_due(&p, &at(2024, 1, 2, 7, 0)).due);
    }

    // -- Weekly -------------------------------------------------------------

    #[test]
    fn weekly_fires_only_on_masked_days() {
        let mut p = base_program();
        p.repeat = Repeat::Weekly;
        p.start = "06:00".into();
        // Tuesday only (Sunday first).
        p.days = vec![false, false, true, false, false, false, false];

        // 2024-01-02 is a Tuesday.
        assert!(check_due(&p, &at(2024, 1, 2, 6, 0)).due);
        // Wednesday.
        assert!(!check_due(&p, &at(2024, 1, 3, 6, 0)).due);
    }

    #[test]
    fn weekly_short_mask_defaults_to_false() {
        let mut p = base_program();
        p.repeat = Repeat::Weekly;
        p.days = vec![true]; // Sunday only, rest missing
        assert!(!check_due(&p, &at(2024, 1, 2, 7, 0)).due); // Tuesday
    }

    // -- One-shot -----------------------------------------------------------

    #[test]
    fn one_shot_fires_on_its_day_and_deactivates() {
        let mut p = base_program();
        p.repeat = Repeat::None;
        p.date = Some("20240102".into());

        let d = check_due(&p, &at(2024, 1, 2, 7, 0));
        assert!(d.due);
        assert!(d.deactivate);
    }

    #[test]
    fn one_shot_past_its_day_deactivates_without_firing() {
        let mut p = base_program();
        p.repeat = Repeat::None;
        p.date = Some("20240102".into());

        let d = check_due(&p, &at(2024, 1, 5, 7, 0));
        assert!(!d.due);
        assert!(d.deactivate);
    }

    // -- Until / exclusions -------------------------------------------------

    #[test]
    fn lapsed_until_blocks() {
        let mut p = base_program();
        p.date = Some("20240101".into());
        p.until = Some("20240103".into());

        assert!(check_due(&p, &at(2024, 1, 3, 7, 0)).due);
        assert!(!check_due(&p, &at(2024, 1, 4, 7, 0)).due);
    }

    #[test]
    fn exclusion_within_a_minute_blocks() {
        let mut p = base_program();
        p.date = Some("20240101".into());
        p.exclusions = vec![NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(7, 0, 30)
            .unwrap()];

        assert!(!check_due(&p, &at(2024, 1, 2, 7, 0)).due);
        // The next day is outside the window.
        assert!(check_due(&p, &at(2024, 1, 3, 7, 0)).due);
    }

    // -- Seasons ------------------------------------------------------------

    #[test]
    fn monthly_season_gates_by_month_bit() {
        let season = SeasonConfig {
            name: "summer".into(),
            monthly: Some(vec![
                false, false, false, false, true, true, true, true, false, false, false, false,
            ]),
            weekly: None,
        };
        assert!(!season_allows(&season, &at(2024, 1, 2, 7, 0)));
        assert!(season_allows(&season, &at(2024, 6, 2, 7, 0)));
    }

    #[test]
    fn weekly_season_gates_by_iso_week_bit() {
        let mut weekly = vec![true; 53];
        weekly[0] = false; // ISO week 1 blocked
        let season = SeasonConfig {
            name: "w".into(),
            monthly: None,
            weekly: Some(weekly),
        };
        // 2024-01-02 is in ISO week 1.
        assert!(!season_allows(&season, &at(2024, 1, 2, 7, 0)));
        assert!(season_allows(&season, &at(2024, 1, 9, 7, 0)));
    }

    #[test]
    fn season_with_no_vectors_allows() {
        let season = SeasonConfig {
            name: "empty".into(),
            monthly: None,
            weekly: None,
        };
        assert!(season_allows(&season, &at(2024, 1, 2, 7, 0)));
    }

    // -- Serde --------------------------------------------------------------

    #[test]
    fn program_deserializes_with_defaults() {
        let p: Program =
            serde_json::from_str(r#"{"name": "N", "start": "05:30"}"#).unwrap();
        assert!(p.active);
        assert_eq!(p.repeat, Repeat::None);
        assert_eq!(p.interval, 1);
        assert!(!p.options.append);
        assert!(p.zones.is_empty());
    }

    #[test]
    fn parent_calendar_splits_imported_names() {
        let mut p = base_program();
        assert_eq!(p.parent_calendar(), None);
        p.name = "Mow day@backyard".into();
        assert_eq!(p.parent_calendar(), Some("backyard"));
    }
}
