//! iCalendar text to watering programs: RFC 5545 unfolding, VEVENT
//! collection with RECURRENCE-ID update handling, timezone resolution,
//! recurrence mapping, and the event-description zone DSL.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::{CalendarConfig, Config};
use crate::program::{format_yyyymmdd, Program, ProgramOptions, ProgramZone, Repeat};

/// Single-occurrence events older than this are dropped at import.
const EXPIRY_GRACE_SEC: i64 = 60;

// ---------------------------------------------------------------------------
// Line-level parsing
// ---------------------------------------------------------------------------

/// Undo RFC 5545 §3.1 line folding: a line starting with SP/HTAB continues
/// the previous one.
pub fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
            if let Some(prev) = lines.last_mut() {
                prev.push_str(rest);
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

#[derive(Debug, Clone)]
struct Property {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

fn parse_property(line: &str) -> Option<Property> {
    let (head, value) = line.split_once(':')?;
    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            Some((k.trim().to_ascii_uppercase(), v.trim().to_string()))
        })
        .collect();
    Some(Property {
        name,
        params,
        value: value.to_string(),
    })
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Undo text escaping in DESCRIPTION/SUMMARY values.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Time resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcalTime {
    /// All-day (VALUE=DATE).
    Date(NaiveDate),
    /// Wall time already converted to the controller's timezone.
    Local(NaiveDateTime),
}

/// Resolve a DATE/DATE-TIME value to controller-local time. Precedence:
/// trailing `Z` (UTC), `TZID=` parameter, the calendar's VTIMEZONE, then
/// the controller's own timezone.
fn parse_datetime(
    value: &str,
    params: &[(String, String)],
    cal_tz: Option<Tz>,
    local: Tz,
) -> Option<IcalTime> {
    if param(params, "VALUE") == Some("DATE") || (value.len() == 8 && !value.contains('T')) {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(IcalTime::Date);
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let ndt = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        let utc = Utc.from_utc_datetime(&ndt);
        return Some(IcalTime::Local(utc.with_timezone(&local).naive_local()));
    }

    let ndt = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    let tz = param(params, "TZID")
        .and_then(|t| t.parse::<Tz>().ok())
        .or(cal_tz);
    match tz {
        Some(tz) => {
            let dt = tz
                .from_local_datetime(&ndt)
                .earliest()
                .or_else(|| tz.from_local_datetime(&ndt).latest())?;
            Some(IcalTime::Local(dt.with_timezone(&local).naive_local()))
        }
        None => Some(IcalTime::Local(ndt)),
    }
}

// ---------------------------------------------------------------------------
// VEVENT collection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct RawEvent {
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    dtstart: Option<Property>,
    rrule: Option<String>,
    exdates: Vec<Property>,
    recurrence_id: Option<Property>,
    sequence: i64,
}

#[derive(Debug, Default)]
struct ParsedCalendar {
    tzid: Option<Tz>,
    events: Vec<RawEvent>,
}

fn collect_events(lines: &[String]) -> ParsedCalendar {
    let mut cal = ParsedCalendar::default();
    let mut current: Option<RawEvent> = None;
    let mut in_timezone = false;

    for line in lines {
        let Some(prop) = parse_property(line) else {
            continue;
        };

        match (prop.name.as_str(), prop.value.as_str()) {
            ("BEGIN", "VEVENT") => {
                current = Some(RawEvent::default());
                continue;
            }
            ("END", "VEVENT") => {
                if let Some(ev) = current.take() {
                    cal.events.push(ev);
                }
                continue;
            }
            ("BEGIN", "VTIMEZONE") => {
                in_timezone = true;
                continue;
            }
            ("END", "VTIMEZONE") => {
                in_timezone = false;
                continue;
            }
            _ => {}
        }

        if in_timezone {
            if prop.name == "TZID" && cal.tzid.is_none() {
                cal.tzid = prop.value.parse().ok();
            }
            continue;
        }

        let Some(ev) = current.as_mut() else {
            continue;
        };
        match prop.name.as_str() {
            "UID" => ev.uid = Some(prop.value),
            "SUMMARY" => ev.summary = Some(unescape(&prop.value)),
            "DESCRIPTION" => ev.description = Some(unescape(&prop.value)),
            "LOCATION" => ev.location = Some(unescape(&prop.value)),
            "DTSTART" => ev.dtstart = Some(prop),
            "RRULE" => ev.rrule = Some(prop.value),
            "EXDATE" => ev.exdates.push(prop),
            "RECURRENCE-ID" => ev.recurrence_id = Some(prop),
            "SEQUENCE" => ev.sequence = prop.value.parse().unwrap_or(0),
            _ => {}
        }
    }
    cal
}

// ---------------------------------------------------------------------------
// RRULE
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Rrule {
    freq: String,
    interval: i64,
    until: Option<String>,
    byday: Vec<String>,
}

fn parse_rrule(value: &str) -> Rrule {
    let mut rule = Rrule {
        interval: 1,
        ..Default::default()
    };
    for part in value.split(';') {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        match k.trim().to_ascii_uppercase().as_str() {
            "FREQ" => rule.freq = v.trim().to_ascii_uppercase(),
            "INTERVAL" => rule.interval = v.trim().parse().unwrap_or(1),
            "UNTIL" => rule.until = Some(v.trim().to_string()),
            "BYDAY" => {
                rule.byday = v.split(',').map(|d| d.trim().to_ascii_uppercase()).collect()
            }
            _ => {}
        }
    }
    rule
}

fn byday_mask(byday: &[String]) -> Vec<bool> {
    const ORDER: [&str; 7] = ["SU", "MO", "TU", "WE", "TH", "FR", "SA"];
    ORDER
        .iter()
        .map(|d| byday.iter().any(|b| b == d))
        .collect()
}

// ---------------------------------------------------------------------------
// Description DSL
// ---------------------------------------------------------------------------

/// Parse the event body: `name[=|:]minutes` tokens select zones by display
/// name, a bare `append` token preserves the queue. One unknown zone name
/// rejects the whole event.
pub fn parse_description(
    desc: &str,
    cfg: &Config,
) -> Result<(Vec<ProgramZone>, ProgramOptions), String> {
    let mut zones = Vec::new();
    let mut options = ProgramOptions::default();

    for token in desc.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.eq_ignore_ascii_case("append") {
            options.append = true;
            continue;
        }
        let Some((name, value)) = token.split_once(['=', ':']) else {
            continue;
        };
        let Ok(minutes) = value.trim().parse::<i64>() else {
            continue;
        };
        match cfg.zone_index(name.trim()) {
            Some(zone) => zones.push(ProgramZone {
                zone,
                seconds: minutes * 60,
            }),
            None => return Err(name.trim().to_string()),
        }
    }
    Ok((zones, options))
}

// ---------------------------------------------------------------------------
// Program synthesis
// ---------------------------------------------------------------------------

/// Turn one calendar's iCalendar text into programs. Rejected events are
/// logged and skipped; the rest of the calendar proceeds.
pub fn import_calendar(
    text: &str,
    cal: &CalendarConfig,
    cfg: &Config,
    now: DateTime<Tz>,
) -> Vec<Program> {
    let local = cfg.tz();
    let parsed = collect_events(&unfold(text));

    // Main events keyed by UID; updates (same UID + RECURRENCE-ID) attach
    // to their main event by replaced occurrence time, later SEQUENCE wins.
    let mut updates: HashMap<String, HashMap<NaiveDateTime, RawEvent>> = HashMap::new();
    let mut mains: Vec<RawEvent> = Vec::new();
    for ev in parsed.events {
        match &ev.recurrence_id {
            Some(rid) => {
                let Some(uid) = ev.uid.clone() else {
                    continue;
                };
                let Some(IcalTime::Local(when)) =
                    parse_datetime(&rid.value, &rid.params, parsed.tzid, local)
                else {
                    continue;
                };
                let slot = updates.entry(uid).or_default();
                match slot.get(&when) {
                    Some(existing) if existing.sequence >= ev.sequence => {}
                    _ => {
                        slot.insert(when, ev);
                    }
                }
            }
            None => mains.push(ev),
        }
    }

    let mut programs = Vec::new();
    for main in &mains {
        let uid = main.uid.clone().unwrap_or_default();
        let event_updates = updates.remove(&uid).unwrap_or_default();
        match synthesize(main, event_updates, parsed.tzid, cal, cfg, now) {
            Some(program) => programs.push(program),
            None => debug!(calendar = %cal.name, uid = %uid, "calendar event skipped"),
        }
    }
    programs
}

fn synthesize(
    main: &RawEvent,
    updates: HashMap<NaiveDateTime, RawEvent>,
    cal_tz: Option<Tz>,
    cal: &CalendarConfig,
    cfg: &Config,
    now: DateTime<Tz>,
) -> Option<Program> {
    let local = cfg.tz();
    let summary = main.summary.as_deref()?;

    // Location gate: events carrying a different site are someone else's.
    if let (Some(here), Some(there)) = (cfg.location.as_deref(), main.location.as_deref()) {
        if !here.eq_ignore_ascii_case(there) {
            return None;
        }
    }

    let dtstart = main.dtstart.as_ref()?;
    let start = match parse_datetime(&dtstart.value, &dtstart.params, cal_tz, local)? {
        IcalTime::Date(_) => return None, // all-day events are ignored
        IcalTime::Local(ndt) => ndt,
    };

    let (zones, options) = match main.description.as_deref().map(|d| parse_description(d, cfg)) {
        Some(Ok(parsed)) => parsed,
        Some(Err(unknown)) => {
            warn!(
                calendar = %cal.name,
                summary,
                zone = %unknown,
                "calendar event rejected: unknown zone name"
            );
            return None;
        }
        None => (Vec::new(), ProgramOptions::default()),
    };
    if zones.is_empty() {
        return None;
    }

    let now_naive = now.naive_local();
    let mut program = Program {
        name: format!("{summary}@{}", cal.name),
        active: true,
        start: start.format("%H:%M").to_string(),
        repeat: Repeat::None,
        interval: 1,
        days: Vec::new(),
        date: Some(format_yyyymmdd(start.date())),
        until: None,
        season: cal.season.clone(),
        options,
        zones,
        exceptions: Vec::new(),
        exclusions: Vec::new(),
    };

    match main.rrule.as_deref().map(parse_rrule) {
        Some(rule) => {
            match rule.freq.as_str() {
                "DAILY" => {
                    program.repeat = Repeat::Daily;
                    program.interval = rule.interval.max(1);
                }
                "WEEKLY" => {
                    program.repeat = Repeat::Weekly;
                    program.days = byday_mask(&rule.byday);
                }
                other => {
                    warn!(
                        calendar = %cal.name,
                        summary,
                        freq = other,
                        "calendar event rejected: unsupported recurrence"
                    );
                    return None;
                }
            }
            if let Some(until) = &rule.until {
                let until_time = match parse_datetime(until, &[], cal_tz, local)? {
                    IcalTime::Date(d) => d.and_hms_opt(23, 59, 59)?,
                    IcalTime::Local(ndt) => ndt,
                };
                if until_time < now_naive {
                    return None; // recurrence fully in the past
                }
                program.until = Some(format_yyyymmdd(until_time.date()));
            }
        }
        None => {
            // Single occurrence: drop once it has passed.
            if start < now_naive - chrono::Duration::seconds(EXPIRY_GRACE_SEC) {
                return None;
            }
        }
    }

    // Updates with a start or replaced time still ahead become one-shot
    // replacement programs; the replaced occurrence is excluded either way.
    for (replaced, update) in updates {
        let update_start = update.dtstart.as_ref().and_then(|p| {
            match parse_datetime(&p.value, &p.params, cal_tz, local) {
                Some(IcalTime::Local(ndt)) => Some(ndt),
                _ => None,
            }
        });
        let Some(update_start) = update_start else {
            continue;
        };
        if update_start <= now_naive && replaced <= now_naive {
            continue;
        }

        let (zones, options) = match update.description.as_deref().map(|d| parse_description(d, cfg)) {
            Some(Ok((zones, options))) if !zones.is_empty() => (zones, options),
            Some(Err(unknown)) => {
                warn!(
                    calendar = %cal.name,
                    summary,
                    zone = %unknown,
                    "calendar update rejected: unknown zone name"
                );
                continue;
            }
            _ => (program.zones.clone(), program.options),
        };

        program.exceptions.push(Program {
            name: program.name.clone(),
            active: true,
            start: update_start.format("%H:%M").to_string(),
            repeat: Repeat::None,
            interval: 1,
            days: Vec::new(),
            date: Some(format_yyyymmdd(update_start.date())),
            until: None,
            season: cal.season.clone(),
            options,
            zones,
            exceptions: Vec::new(),
            exclusions: Vec::new(),
        });
        program.exclusions.push(replaced);
    }

    for exdate in &main.exdates {
        for value in exdate.value.split(',') {
            if let Some(IcalTime::Local(ndt)) =
                parse_datetime(value.trim(), &exdate.params, cal_tz, local)
            {
                program.exclusions.push(ndt);
            }
        }
    }

    Some(program)
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

    fn test_config() -> Config {
        config::parse(
            r#"{
                "timezone": "America/Denver",
                "location": "Home",
                "zones": [{"name": "lawn"}, {"name": "beds"}, {"name": "drip"}]
            }"#,
        )
        .unwrap()
    }

    fn test_cal() -> CalendarConfig {
        CalendarConfig {
            name: "yard".into(),
            format: "iCalendar".into(),
            source: "file:test.ics".into(),
            season: None,
            disabled: false,
        }
    }

    fn now() -> DateTime<Tz> {
        TZ.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn import(ics: &str) -> Vec<Program> {
        import_calendar(ics, &test_cal(), &test_config(), now())
    }

    fn event(body: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\n{body}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
        )
    }

    // -- Unfolding ----------------------------------------------------------

    #[test]
    fn unfold_joins_continuation_lines() {
        let lines = unfold("DESCRIPTION:lawn=10\r\n  beds=5\r\nSUMMARY:Water\r\n");
        assert_eq!(lines[0], "DESCRIPTION:lawn=10 beds=5");
        assert_eq!(lines[1], "SUMMARY:Water");
    }

    #[test]
    fn unfold_handles_tab_continuations() {
        let lines = unfold("SUMMARY:Long\n\tsummary\n");
        assert_eq!(lines, vec!["SUMMARY:Longsummary"]);
    }

    // -- DSL ----------------------------------------------------------------

    #[test]
    fn description_tokens_are_minutes() {
        let cfg = test_config();
        let (zones, options) = parse_description("lawn=10, beds:5", &cfg).unwrap();
        assert_eq!(
            zones,
            vec![
                ProgramZone { zone: 0, seconds: 600 },
                ProgramZone { zone: 1, seconds: 300 },
            ]
        );
        assert!(!options.append);
    }

    #[test]
    fn append_token_sets_option() {
        let cfg = test_config();
        let (zones, options) = parse_description("append lawn=1", &cfg).unwrap();
        assert_eq!(zones.len(), 1);
        assert!(options.append);
    }

    #[test]
    fn unknown_zone_rejects_whole_description() {
        let cfg = test_config();
        assert_eq!(
            parse_description("lawn=10 pond=5", &cfg),
            Err("pond".to_string())
        );
    }

    #[test]
    fn free_text_tokens_are_ignored() {
        let cfg = test_config();
        let (zones, options) = parse_description("water the lawn=10 thoroughly", &cfg).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone, 0);
        assert!(!options.append);
    }

    // -- Basic import -------------------------------------------------------

    #[test]
    fn single_future_event_becomes_one_shot_program() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Soak\r\nDTSTART:20240611T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs.len(), 1);
        let p = &programs[0];
        assert_eq!(p.name, "Soak@yard");
        assert_eq!(p.repeat, Repeat::None);
        assert_eq!(p.start, "06:00");
        assert_eq!(p.date.as_deref(), Some("20240611"));
        assert_eq!(p.zones[0].seconds, 600);
    }

    #[test]
    fn expired_single_event_is_dropped() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Old\r\nDTSTART:20240601T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn all_day_event_is_ignored() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Party\r\nDTSTART;VALUE=DATE:20240611\r\nDESCRIPTION:lawn=10",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn event_without_zones_is_ignored() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Note\r\nDTSTART:20240611T060000\r\nDESCRIPTION:remember the mower",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn unknown_zone_rejects_event() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Bad\r\nDTSTART:20240611T060000\r\nDESCRIPTION:pond=10",
        ));
        assert!(programs.is_empty());
    }

    // -- Location filter ----------------------------------------------------

    #[test]
    fn mismatched_location_is_ignored() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Away\r\nLOCATION:Cabin\r\nDTSTART:20240611T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn location_match_is_case_insensitive() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Here\r\nLOCATION:HOME\r\nDTSTART:20240611T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs.len(), 1);
    }

    // -- Timezones ----------------------------------------------------------

    #[test]
    fn utc_times_convert_to_local() {
        // 12:00 UTC on Jun 11 is 06:00 in Denver (UTC-6 in DST).
        let programs = import(&event(
            "UID:1\r\nSUMMARY:Z\r\nDTSTART:20240611T120000Z\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].start, "06:00");
    }

    #[test]
    fn tzid_param_wins() {
        // 08:00 Eastern is 06:00 in Denver.
        let programs = import(&event(
            "UID:1\r\nSUMMARY:E\r\nDTSTART;TZID=America/New_York:20240611T080000\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].start, "06:00");
    }

    #[test]
    fn vtimezone_provides_default_zone() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VTIMEZONE\r\nTZID:America/New_York\r\nEND:VTIMEZONE\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:V\r\nDTSTART:20240611T080000\r\nDESCRIPTION:lawn=10\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let programs = import(ics);
        assert_eq!(programs[0].start, "06:00");
    }

    // -- Recurrence ---------------------------------------------------------

    #[test]
    fn daily_rrule_maps_interval() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:D\r\nDTSTART:20240601T060000\r\nRRULE:FREQ=DAILY;INTERVAL=2\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].repeat, Repeat::Daily);
        assert_eq!(programs[0].interval, 2);
    }

    #[test]
    fn weekly_rrule_maps_byday() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:W\r\nDTSTART:20240601T060000\r\nRRULE:FREQ=WEEKLY;BYDAY=TU,SA\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].repeat, Repeat::Weekly);
        assert_eq!(
            programs[0].days,
            vec![false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn unsupported_frequency_rejects_event() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:M\r\nDTSTART:20240601T060000\r\nRRULE:FREQ=MONTHLY\r\nDESCRIPTION:lawn=10",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn lapsed_until_drops_recurrence() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:U\r\nDTSTART:20240101T060000\r\nRRULE:FREQ=DAILY;UNTIL=20240301T000000Z\r\nDESCRIPTION:lawn=10",
        ));
        assert!(programs.is_empty());
    }

    #[test]
    fn future_until_becomes_program_bound() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:U\r\nDTSTART:20240601T060000\r\nRRULE:FREQ=DAILY;UNTIL=20240901T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].until.as_deref(), Some("20240901"));
    }

    // -- Exceptions / exclusions --------------------------------------------

    #[test]
    fn recurrence_update_becomes_exception_and_exclusion() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nDTSTART:20240604T060000\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=TU\r\nDESCRIPTION:lawn=10\r\nEND:VEVENT\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nRECURRENCE-ID:20240611T060000\r\n\
                   DTSTART:20240611T070000\r\nDESCRIPTION:lawn=5\r\nSEQUENCE:1\r\nEND:VEVENT\r\n\
                   END:VCALENDAR\r\n";
        let programs = import(ics);
        assert_eq!(programs.len(), 1);
        let p = &programs[0];

        assert_eq!(p.exceptions.len(), 1);
        let ex = &p.exceptions[0];
        assert_eq!(ex.start, "07:00");
        assert_eq!(ex.date.as_deref(), Some("20240611"));
        assert_eq!(ex.repeat, Repeat::None);
        assert_eq!(ex.zones[0].seconds, 300);

        assert_eq!(p.exclusions.len(), 1);
        assert_eq!(
            p.exclusions[0],
            NaiveDate::from_ymd_opt(2024, 6, 11)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn later_sequence_wins_for_same_occurrence() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nDTSTART:20240604T060000\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=TU\r\nDESCRIPTION:lawn=10\r\nEND:VEVENT\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nRECURRENCE-ID:20240611T060000\r\n\
                   DTSTART:20240611T070000\r\nDESCRIPTION:lawn=5\r\nSEQUENCE:1\r\nEND:VEVENT\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nRECURRENCE-ID:20240611T060000\r\n\
                   DTSTART:20240611T080000\r\nDESCRIPTION:lawn=7\r\nSEQUENCE:2\r\nEND:VEVENT\r\n\
                   END:VCALENDAR\r\n";
        let programs = import(ics);
        assert_eq!(programs[0].exceptions.len(), 1);
        assert_eq!(programs[0].exceptions[0].start, "08:00");
        assert_eq!(programs[0].exceptions[0].zones[0].seconds, 420);
    }

    #[test]
    fn update_without_description_inherits_main_zones() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nDTSTART:20240604T060000\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=TU\r\nDESCRIPTION:lawn=10\r\nEND:VEVENT\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nRECURRENCE-ID:20240611T060000\r\n\
                   DTSTART:20240611T090000\r\nEND:VEVENT\r\n\
                   END:VCALENDAR\r\n";
        let programs = import(ics);
        assert_eq!(programs[0].exceptions[0].zones[0].seconds, 600);
    }

    #[test]
    fn past_update_is_excluded_but_not_an_exception() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nDTSTART:20240507T060000\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=TU\r\nDESCRIPTION:lawn=10\r\nEND:VEVENT\r\n\
                   BEGIN:VEVENT\r\nUID:1\r\nSUMMARY:W\r\nRECURRENCE-ID:20240514T060000\r\n\
                   DTSTART:20240514T070000\r\nEND:VEVENT\r\n\
                   END:VCALENDAR\r\n";
        let programs = import(ics);
        assert!(programs[0].exceptions.is_empty());
        assert!(programs[0].exclusions.is_empty());
    }

    #[test]
    fn exdate_values_append_to_exclusions() {
        let programs = import(&event(
            "UID:1\r\nSUMMARY:W\r\nDTSTART:20240604T060000\r\nRRULE:FREQ=WEEKLY;BYDAY=TU\r\n\
             EXDATE:20240618T060000,20240625T060000\r\nDESCRIPTION:lawn=10",
        ));
        assert_eq!(programs[0].exclusions.len(), 2);
    }
}
