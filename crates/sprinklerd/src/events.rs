//! Append-only event log: a capped in-memory ring for live status plus
//! sqlite persistence for history queries, with an optional syslog-style
//! line fanout.
//!
//! `(timestamp, sequence)` totally orders records: sequence restarts at 1
//! whenever the wall-clock second advances and increments within a second.
//! Persistence failures are logged; the in-memory append still counts.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Maximum number of records retained in the in-memory ring.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Startup,
    On,
    Off,
    Start,
    End,
    Cancel,
    Skip,
    Update,
    Idle,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Startup => "STARTUP",
            Action::On => "ON",
            Action::Off => "OFF",
            Action::Start => "START",
            Action::End => "END",
            Action::Cancel => "CANCEL",
            Action::Skip => "SKIP",
            Action::Update => "UPDATE",
            Action::Idle => "IDLE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "STARTUP" => Action::Startup,
            "ON" => Action::On,
            "OFF" => Action::Off,
            "START" => Action::Start,
            "END" => Action::End,
            "CANCEL" => Action::Cancel,
            "SKIP" => Action::Skip,
            "UPDATE" => Action::Update,
            "IDLE" => Action::Idle,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: i64,
    pub sequence: i64,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<i64>,
}

impl EventRecord {
    pub fn new(action: Action) -> Self {
        Self {
            timestamp: 0,
            sequence: 0,
            action,
            zone: None,
            program: None,
            parent: None,
            seconds: None,
            runtime: None,
            adjustment: None,
            source: None,
            temperature: None,
            humidity: None,
            rain: None,
            ratio: None,
        }
    }

    /// Syslog fanout line: `<action> [zone N] [program P] [(program P')]`.
    pub fn fanout_line(&self) -> String {
        let mut line = self.action.as_str().to_string();
        if let Some(zone) = self.zone {
            line.push_str(&format!(" zone {zone}"));
        }
        if let Some(program) = &self.program {
            line.push_str(&format!(" program {program}"));
        }
        if let Some(parent) = &self.parent {
            line.push_str(&format!(" (program {parent})"));
        }
        line
    }
}

/// History query filter; unset fields match everything.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EventFilter {
    pub action: Option<Action>,
    pub zone: Option<i64>,
    pub program: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

struct SinkInner {
    last_timestamp: i64,
    last_sequence: i64,
    ring: VecDeque<EventRecord>,
    syslog: bool,
    cleanup_days: i64,
}

#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Mutex<SinkInner>>,
    pool: Pool<Sqlite>,
}

impl EventSink {
    /// db_url examples:
    /// - "sqlite:/var/lib/sprinkler/events.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn open(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Tests run under a paused tokio clock, where a lazily-established
        // extra connection can race the pool's acquire timeout. Give the
        // in-memory test path enough headroom that it never needs to open
        // a connection on demand once `pool()` has pre-warmed it.
        let max_connections = if db_url == "sqlite::memory:" { 8 } else { 2 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open event db: {db_url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run event db migrations")?;

        // Seed the ordering counters from the store so a restart within
        // the same second cannot collide with persisted records.
        let last: Option<(i64, i64)> =
            sqlx::query_as("SELECT ts, seq FROM events ORDER BY ts DESC, seq DESC LIMIT 1")
                .fetch_optional(&pool)
                .await
                .unwrap_or(None);
        let (last_timestamp, last_sequence) = last.unwrap_or((0, 0));

        Ok(Self {
            inner: Arc::new(Mutex::new(SinkInner {
                last_timestamp,
                last_sequence,
                ring: VecDeque::with_capacity(MAX_EVENTS),
                syslog: false,
                cleanup_days: 0,
            })),
            pool,
        })
    }

    /// Apply the `event` section of the configuration.
    pub fn set_options(&self, syslog: bool, cleanup_days: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.syslog = syslog;
        inner.cleanup_days = cleanup_days;
    }

    /// Stamp, order, fan out, and persist one record.
    pub async fn record(&self, data: EventRecord) {
        self.record_at(Utc::now().timestamp(), data).await;
    }

    pub(crate) async fn record_at(&self, now: i64, mut data: EventRecord) {
        let cleanup_days;
        {
            let mut inner = self.inner.lock().unwrap();
            data.timestamp = now;
            data.sequence = if data.timestamp > inner.last_timestamp {
                1
            } else {
                inner.last_sequence + 1
            };
            inner.last_timestamp = data.timestamp;
            inner.last_sequence = data.sequence;

            if inner.ring.len() >= MAX_EVENTS {
                inner.ring.pop_front();
            }
            inner.ring.push_back(data.clone());

            if inner.syslog {
                info!(target: "events", "{}", data.fanout_line());
            }
            cleanup_days = inner.cleanup_days;
        }

        if let Err(e) = self.insert(&data).await {
            error!("event insert failed: {e:#}");
        }

        if cleanup_days > 0 && data.sequence == 1 {
            let cutoff = data.timestamp - cleanup_days * 86_400;
            if let Err(e) = sqlx::query("DELETE FROM events WHERE ts < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await
            {
                error!("event retention purge failed: {e}");
            }
        }
    }

    async fn insert(&self, r: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (
              ts, seq, action, zone, program, parent,
              seconds, runtime, adjustment, source,
              temperature, humidity, rain, ratio
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp)
        .bind(r.sequence)
        .bind(r.action.as_str())
        .bind(r.zone)
        .bind(r.program.as_deref())
        .bind(r.parent.as_deref())
        .bind(r.seconds)
        .bind(r.runtime)
        .bind(r.adjustment)
        .bind(r.source.as_deref())
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.rain)
        .bind(r.ratio)
        .execute(&self.pool)
        .await
        .context("insert failed")?;
        Ok(())
    }

    /// All matching records, newest first.
    pub async fn find(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT ts, seq, action, zone, program, parent, seconds, runtime, \
             adjustment, source, temperature, humidity, rain, ratio FROM events",
        );

        let mut has_where = false;
        let mut sep = |qb: &mut QueryBuilder<Sqlite>| {
            qb.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
        };

        if let Some(action) = filter.action {
            sep(&mut qb);
            qb.push("action = ").push_bind(action.as_str());
        }
        if let Some(zone) = filter.zone {
            sep(&mut qb);
            qb.push("zone = ").push_bind(zone);
        }
        if let Some(program) = &filter.program {
            sep(&mut qb);
            qb.push("program = ").push_bind(program.clone());
        }
        if let Some(since) = filter.since {
            sep(&mut qb);
            qb.push("ts >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            sep(&mut qb);
            qb.push("ts <= ").push_bind(until);
        }

        qb.push(" ORDER BY ts DESC, seq DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("event query failed")?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let action = Action::parse(row.get::<String, _>("action").as_str())?;
                Some(EventRecord {
                    timestamp: row.get("ts"),
                    sequence: row.get("seq"),
                    action,
                    zone: row.get("zone"),
                    program: row.get("program"),
                    parent: row.get("parent"),
                    seconds: row.get("seconds"),
                    runtime: row.get("runtime"),
                    adjustment: row.get("adjustment"),
                    source: row.get("source"),
                    temperature: row.get("temperature"),
                    humidity: row.get("humidity"),
                    rain: row.get("rain"),
                    ratio: row.get("ratio"),
                })
            })
            .collect())
    }

    /// Recent records from the in-memory ring, newest first.
    pub fn recent(&self) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap();
        inner.ring.iter().rev().cloned().collect()
    }

    /// Test-only escape hatch so callers can pre-establish every pool
    /// connection before pausing tokio's virtual clock (paused time races
    /// the pool's lazy connection setup otherwise).
    #[cfg(test)]
    pub(crate) async fn warm_pool(&self) {
        let max = self.pool.options().get_max_connections();
        let mut conns = Vec::with_capacity(max as usize);
        for _ in 0..max {
            conns.push(self.pool.acquire().await.unwrap());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn sink() -> EventSink {
        EventSink::open("sqlite::memory:").await.unwrap()
    }

    fn start_zone(zone: i64, parent: &str) -> EventRecord {
        let mut r = EventRecord::new(Action::Start);
        r.zone = Some(zone);
        r.parent = Some(parent.to_string());
        r
    }

    // -- Sequencing ---------------------------------------------------------

    #[tokio::test]
    async fn sequence_restarts_on_new_timestamp() {
        let s = sink().await;
        s.record_at(100, EventRecord::new(Action::Startup)).await;
        s.record_at(100, EventRecord::new(Action::Start)).await;
        s.record_at(101, EventRecord::new(Action::End)).await;

        let recent = s.recent();
        assert_eq!(recent.len(), 3);
        // Newest first: (101,1), (100,2), (100,1).
        assert_eq!((recent[0].timestamp, recent[0].sequence), (101, 1));
        assert_eq!((recent[1].timestamp, recent[1].sequence), (100, 2));
        assert_eq!((recent[2].timestamp, recent[2].sequence), (100, 1));
    }

    #[tokio::test]
    async fn sequence_increments_within_same_second() {
        let s = sink().await;
        for _ in 0..4 {
            s.record_at(500, EventRecord::new(Action::Start)).await;
        }
        let recent = s.recent();
        let seqs: Vec<i64> = recent.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![4, 3, 2, 1]);
    }

    // -- Persistence + find -------------------------------------------------

    #[tokio::test]
    async fn find_orders_newest_first() {
        let s = sink().await;
        s.record_at(100, EventRecord::new(Action::Startup)).await;
        s.record_at(101, start_zone(0, "P")).await;
        s.record_at(101, start_zone(1, "P")).await;

        let all = s.find(&EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!((all[0].timestamp, all[0].sequence), (101, 2));
        assert_eq!((all[1].timestamp, all[1].sequence), (101, 1));
        assert_eq!((all[2].timestamp, all[2].sequence), (100, 1));
    }

    #[tokio::test]
    async fn find_filters_by_action_and_zone() {
        let s = sink().await;
        s.record_at(100, EventRecord::new(Action::Startup)).await;
        s.record_at(101, start_zone(0, "P")).await;
        s.record_at(102, start_zone(1, "P")).await;

        let starts = s
            .find(&EventFilter {
                action: Some(Action::Start),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(starts.len(), 2);

        let zone1 = s
            .find(&EventFilter {
                zone: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(zone1.len(), 1);
        assert_eq!(zone1[0].zone, Some(1));
    }

    #[tokio::test]
    async fn find_respects_time_range_and_limit() {
        let s = sink().await;
        for ts in [100, 200, 300, 400] {
            s.record_at(ts, EventRecord::new(Action::Start)).await;
        }

        let mid = s
            .find(&EventFilter {
                since: Some(150),
                until: Some(350),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mid.len(), 2);

        let limited = s
            .find(&EventFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].timestamp, 400);
    }

    // -- Retention ----------------------------------------------------------

    #[tokio::test]
    async fn retention_purges_old_rows_when_second_advances() {
        let s = sink().await;
        s.set_options(false, 1);

        let old = 1_000_000;
        s.record_at(old, EventRecord::new(Action::Startup)).await;
        // Two days later: first record of the new second triggers the purge.
        s.record_at(old + 2 * 86_400, EventRecord::new(Action::Start))
            .await;

        let all = s.find(&EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, Action::Start);
    }

    // -- Ring ---------------------------------------------------------------

    #[tokio::test]
    async fn ring_caps_at_max_events() {
        let s = sink().await;
        for i in 0..(MAX_EVENTS as i64 + 25) {
            s.record_at(1000 + i, EventRecord::new(Action::Start)).await;
        }
        assert_eq!(s.recent().len(), MAX_EVENTS);
        // Oldest were evicted.
        assert_eq!(s.recent().last().unwrap().timestamp, 1025);
    }

    // -- Fanout formatting --------------------------------------------------

    #[test]
    fn fanout_line_includes_present_fields_only() {
        let mut r = EventRecord::new(Action::Start);
        assert_eq!(r.fanout_line(), "START");

        r.zone = Some(3);
        assert_eq!(r.fanout_line(), "START zone 3");

        r.program = Some("Morning".into());
        r.parent = Some("Evening".into());
        assert_eq!(
            r.fanout_line(),
            "START zone 3 program Morning (program Evening)"
        );
    }
}
