//! Delta Store (C3): an append-oriented ledger of position-delta events. A `Clone` handle
//! holding only a path, short-lived connections opened per operation, WAL + NORMAL
//! synchronous pragmas so concurrent readers never block behind a writer.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Open,
    Close,
    Adjust,
    Observe,
    Target,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Close => "close",
            Action::Adjust => "adjust",
            Action::Observe => "observe",
            Action::Target => "target",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Action::Open),
            "close" => Some(Action::Close),
            "adjust" => Some(Action::Adjust),
            "observe" => Some(Action::Observe),
            "target" => Some(Action::Target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub id: Option<i64>,
    pub account_id: String,
    pub instrument_id: String,
    pub correlation_id: Option<String>,
    pub action: Action,
    pub target_delta: Option<Decimal>,
    pub move_position_delta: Option<Decimal>,
    pub observed_delta: Option<Decimal>,
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tv_signal_id: Option<String>,
}

impl DeltaRecord {
    /// The logical-content key used for idempotent upsert: everything but `id`/`created_at`.
    fn content_key(&self) -> (String, String, Option<String>, &'static str) {
        (
            self.account_id.clone(),
            self.instrument_id.clone(),
            self.correlation_id.clone(),
            self.action.as_str(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaSummary {
    pub count_by_action: Vec<(String, i64)>,
    pub net_observed_delta: Option<Decimal>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct DeltaStore {
    path: String,
    // Each `:memory:` database is private to the connection that opened it, so a store backed
    // by one would lose its schema and rows between `open_conn()` calls. For memory mode we
    // instead open a named, shared-cache memory database and keep one sentinel connection to it
    // alive for as long as any clone of this store exists; every other connection to the same
    // URI then sees the same database. `None` for file-backed stores, which don't need this.
    _memory_guard: Option<Arc<Mutex<Connection>>>,
}

impl DeltaStore {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("delta store path is empty");
        }
        if path == ":memory:" {
            let uri = format!("file:deltastore-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
            let guard = Connection::open(&uri).with_context(|| "open sqlite in-memory sentinel connection")?;
            return Ok(Self { path: uri, _memory_guard: Some(Arc::new(Mutex::new(guard))) });
        }
        if !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }
        Ok(Self { path: path.to_string(), _memory_guard: None })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS deltas (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id TEXT NOT NULL,
  instrument_id TEXT NOT NULL,
  correlation_id TEXT,
  action TEXT NOT NULL,
  target_delta TEXT,
  move_position_delta TEXT,
  observed_delta TEXT,
  order_id TEXT,
  created_at_ms INTEGER NOT NULL,
  tv_signal_id TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_deltas_identity
  ON deltas (account_id, instrument_id, COALESCE(correlation_id, ''), action, created_at_ms);

CREATE INDEX IF NOT EXISTS idx_deltas_account_time ON deltas (account_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_deltas_instrument ON deltas (account_id, instrument_id, created_at_ms);
"#,
        )?;
        Ok(())
    }

    /// Idempotent append: if a row with the same `(account_id, instrument_id,
    /// correlation_id, action)` already exists with identical content (ignoring
    /// `created_at`), this is a no-op. Otherwise a new row is appended with `record.created_at`
    /// Callers are expected to pass a non-decreasing clock per writer.
    pub fn upsert(&self, record: &DeltaRecord) -> Result<DeltaRecord> {
        if record.target_delta.is_none() && record.move_position_delta.is_none() && record.observed_delta.is_none() {
            anyhow::bail!("delta record must carry at least one of target_delta, move_position_delta, observed_delta");
        }

        let conn = self.open_conn()?;
        let (account_id, instrument_id, correlation_id, action) = record.content_key();

        let existing: Option<(i64, Option<String>, Option<String>, Option<String>, Option<String>, i64, Option<String>)> = conn
            .query_row(
                r#"SELECT id, target_delta, move_position_delta, observed_delta, order_id, created_at_ms, tv_signal_id
                   FROM deltas
                   WHERE account_id = ?1 AND instrument_id = ?2
                     AND COALESCE(correlation_id, '') = COALESCE(?3, '')
                     AND action = ?4
                   ORDER BY created_at_ms DESC LIMIT 1"#,
                params![account_id, instrument_id, correlation_id, action],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, target, mv, observed, order_id, _created_at_ms, tv_signal)) = existing {
            let same = decimal_opt_eq(&target, &record.target_delta)
                && decimal_opt_eq(&mv, &record.move_position_delta)
                && decimal_opt_eq(&observed, &record.observed_delta)
                && order_id == record.order_id
                && tv_signal == record.tv_signal_id;
            if same {
                return self.get_by_id(id)?.context("upsert found row but could not reload it");
            }
        }

        conn.execute(
            r#"INSERT INTO deltas
               (account_id, instrument_id, correlation_id, action, target_delta, move_position_delta,
                observed_delta, order_id, created_at_ms, tv_signal_id)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                account_id,
                instrument_id,
                record.correlation_id,
                action,
                record.target_delta.map(|d| d.to_string()),
                record.move_position_delta.map(|d| d.to_string()),
                record.observed_delta.map(|d| d.to_string()),
                record.order_id,
                record.created_at.timestamp_millis(),
                record.tv_signal_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.get_by_id(id)?.context("insert did not produce a readable row")
    }

    fn get_by_id(&self, id: i64) -> Result<Option<DeltaRecord>> {
        let conn = self.open_conn()?;
        let row = conn
            .query_row(
                r#"SELECT id, account_id, instrument_id, correlation_id, action, target_delta,
                          move_position_delta, observed_delta, order_id, created_at_ms, tv_signal_id
                   FROM deltas WHERE id = ?1"#,
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    pub fn by_account(
        &self,
        account_id: &str,
        time_range: (DateTime<Utc>, DateTime<Utc>),
        actions: Option<&[Action]>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeltaRecord>> {
        let conn = self.open_conn()?;
        let (from_ms, to_ms) = (time_range.0.timestamp_millis(), time_range.1.timestamp_millis());

        let action_filter: Option<Vec<String>> = actions.map(|a| a.iter().map(|x| x.as_str().to_string()).collect());

        let mut stmt = conn.prepare(
            r#"SELECT id, account_id, instrument_id, correlation_id, action, target_delta,
                      move_position_delta, observed_delta, order_id, created_at_ms, tv_signal_id
               FROM deltas
               WHERE account_id = ?1 AND created_at_ms BETWEEN ?2 AND ?3
               ORDER BY created_at_ms DESC, id DESC
               LIMIT ?4 OFFSET ?5"#,
        )?;
        let rows = stmt.query_map(params![account_id, from_ms, to_ms, limit, offset], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if let Some(allowed) = &action_filter {
                if !allowed.contains(&record.action.as_str().to_string()) {
                    continue;
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    pub fn latest_by_instrument(&self, account_id: &str, instrument_id: &str) -> Result<Option<DeltaRecord>> {
        let conn = self.open_conn()?;
        conn.query_row(
            r#"SELECT id, account_id, instrument_id, correlation_id, action, target_delta,
                      move_position_delta, observed_delta, order_id, created_at_ms, tv_signal_id
               FROM deltas
               WHERE account_id = ?1 AND instrument_id = ?2
               ORDER BY created_at_ms DESC, id DESC LIMIT 1"#,
            params![account_id, instrument_id],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn summary(&self, account_id: &str, time_range: (DateTime<Utc>, DateTime<Utc>)) -> Result<DeltaSummary> {
        let conn = self.open_conn()?;
        let (from_ms, to_ms) = (time_range.0.timestamp_millis(), time_range.1.timestamp_millis());

        let mut stmt = conn.prepare(
            r#"SELECT action, COUNT(*) FROM deltas
               WHERE account_id = ?1 AND created_at_ms BETWEEN ?2 AND ?3
               GROUP BY action"#,
        )?;
        let count_by_action: Vec<(String, i64)> = stmt
            .query_map(params![account_id, from_ms, to_ms], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let net_observed_raw: Option<String> = conn
            .query_row(
                r#"SELECT SUM(CAST(observed_delta AS REAL)) FROM deltas
                   WHERE account_id = ?1 AND created_at_ms BETWEEN ?2 AND ?3 AND observed_delta IS NOT NULL"#,
                params![account_id, from_ms, to_ms],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .map(|f| f.to_string());
        let net_observed_delta = net_observed_raw.and_then(|s| Decimal::from_str(&s).ok());

        let last_updated_ms: Option<i64> = conn
            .query_row(
                r#"SELECT MAX(created_at_ms) FROM deltas WHERE account_id = ?1 AND created_at_ms BETWEEN ?2 AND ?3"#,
                params![account_id, from_ms, to_ms],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        Ok(DeltaSummary {
            count_by_action,
            net_observed_delta,
            last_updated: last_updated_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    /// Prunes rows older than `retention_days`. Deletes are row-granular so a concurrent
    /// reader observes either the pre- or post-prune state for each row it touches, never a
    /// half-deleted row.
    pub fn prune_older_than(&self, retention_days: i64) -> Result<usize> {
        let conn = self.open_conn()?;
        let cutoff_ms = Utc::now().timestamp_millis() - retention_days * 24 * 60 * 60 * 1000;
        let deleted = conn.execute("DELETE FROM deltas WHERE created_at_ms < ?1", params![cutoff_ms])?;
        Ok(deleted)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DeltaRecord> {
    let action_str: String = row.get(4)?;
    let created_at_ms: i64 = row.get(9)?;
    Ok(DeltaRecord {
        id: Some(row.get(0)?),
        account_id: row.get(1)?,
        instrument_id: row.get(2)?,
        correlation_id: row.get(3)?,
        action: Action::from_str_loose(&action_str).unwrap_or(Action::Observe),
        target_delta: parse_decimal_col(row, 5)?,
        move_position_delta: parse_decimal_col(row, 6)?,
        observed_delta: parse_decimal_col(row, 7)?,
        order_id: row.get(8)?,
        created_at: Utc.timestamp_millis_opt(created_at_ms).single().unwrap_or_else(Utc::now),
        tv_signal_id: row.get(10)?,
    })
}

fn parse_decimal_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| Decimal::from_str(&s).ok()))
}

fn decimal_opt_eq(stored: &Option<String>, incoming: &Option<Decimal>) -> bool {
    match (stored, incoming) {
        (None, None) => true,
        (Some(s), Some(d)) => Decimal::from_str(s).map(|parsed| &parsed == d).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(action: Action, correlation_id: Option<&str>, observed: Option<Decimal>) -> DeltaRecord {
        DeltaRecord {
            id: None,
            account_id: "acct1".to_string(),
            instrument_id: "XYZ-250101-100-C".to_string(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            action,
            target_delta: None,
            move_position_delta: None,
            observed_delta: observed,
            order_id: None,
            created_at: Utc::now(),
            tv_signal_id: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_for_identical_content() {
        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        let r1 = store.upsert(&record(Action::Observe, Some("corr-1"), Some(dec!(0.25)))).unwrap();
        let r2 = store.upsert(&record(Action::Observe, Some("corr-1"), Some(dec!(0.25)))).unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[test]
    fn upsert_appends_new_row_for_differing_content() {
        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        let r1 = store.upsert(&record(Action::Observe, Some("corr-1"), Some(dec!(0.25)))).unwrap();
        let r2 = store.upsert(&record(Action::Observe, Some("corr-1"), Some(dec!(0.30)))).unwrap();
        assert_ne!(r1.id, r2.id);
    }

    #[test]
    fn latest_by_instrument_returns_most_recent() {
        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        store.upsert(&record(Action::Open, Some("corr-1"), Some(dec!(0.10)))).unwrap();
        store.upsert(&record(Action::Adjust, Some("corr-2"), Some(dec!(0.20)))).unwrap();
        let latest = store.latest_by_instrument("acct1", "XYZ-250101-100-C").unwrap().unwrap();
        assert_eq!(latest.action, Action::Adjust);
    }

    #[test]
    fn upsert_rejects_all_null_deltas() {
        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        let mut r = record(Action::Observe, Some("corr-1"), None);
        r.target_delta = None;
        r.move_position_delta = None;
        r.observed_delta = None;
        assert!(store.upsert(&r).is_err());
    }

    #[test]
    fn prune_removes_only_old_rows() {
        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        let mut old = record(Action::Observe, Some("corr-old"), Some(dec!(0.1)));
        old.created_at = Utc::now() - chrono::Duration::days(200);
        store.upsert(&old).unwrap();
        store.upsert(&record(Action::Observe, Some("corr-new"), Some(dec!(0.2)))).unwrap();

        let deleted = store.prune_older_than(90).unwrap();
        assert_eq!(deleted, 1);
        let remaining = store
            .by_account("acct1", (Utc::now() - chrono::Duration::days(365), Utc::now()), None, 100, 0)
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
