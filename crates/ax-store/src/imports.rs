// Imported price history: one import record plus its bars

use std::fmt;

use ax_types::{AxResult, DataError, Interval, PriceRow, PriceSeries, StoreError, TIME_FORMAT};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{corrupt, not_found, parse_time, query_error, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::InProgress => "in_progress",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ImportStatus::Pending),
            "in_progress" => Some(ImportStatus::InProgress),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        matches!(
            (self, next),
            (ImportStatus::Pending, ImportStatus::InProgress)
                | (ImportStatus::InProgress, ImportStatus::Completed)
                | (ImportStatus::InProgress, ImportStatus::Failed)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceImport {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub asset: String,
    pub interval: Interval,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub status: ImportStatus,
    pub error: Option<String>,
    /// Actual first and last stored bar, which may differ from the request.
    pub first_bar: Option<NaiveDateTime>,
    pub last_bar: Option<NaiveDateTime>,
    pub bar_count: u64,
    pub created_at: DateTime<Utc>,
}

const IMPORT_COLUMNS: &str =
    "id, owner, name, asset, interval, start_date, end_date, status, error, first_bar, last_bar, bar_count, created_at";

struct ImportRow {
    id: i64,
    owner: String,
    name: String,
    asset: String,
    interval: String,
    start: Option<String>,
    end: Option<String>,
    status: String,
    error: Option<String>,
    first_bar: Option<String>,
    last_bar: Option<String>,
    bar_count: i64,
    created_at: String,
}

impl ImportRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            asset: row.get(3)?,
            interval: row.get(4)?,
            start: row.get(5)?,
            end: row.get(6)?,
            status: row.get(7)?,
            error: row.get(8)?,
            first_bar: row.get(9)?,
            last_bar: row.get(10)?,
            bar_count: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_import(self) -> AxResult<PriceImport> {
        let status = ImportStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("import {} has unknown status '{}'", self.id, self.status)))?;
        Ok(PriceImport {
            id: self.id,
            owner: self.owner,
            name: self.name,
            asset: self.asset,
            interval: Interval::parse(&self.interval)?,
            start: self.start.as_deref().map(parse_date).transpose()?,
            end: self.end.as_deref().map(parse_date).transpose()?,
            status,
            error: self.error,
            first_bar: self.first_bar.as_deref().map(parse_bar_time).transpose()?,
            last_bar: self.last_bar.as_deref().map(parse_bar_time).transpose()?,
            bar_count: self.bar_count.max(0) as u64,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn parse_date(value: &str) -> AxResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|err| corrupt(format!("bad date '{}': {}", value, err)))
}

fn parse_bar_time(value: &str) -> AxResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|err| corrupt(format!("bad bar timestamp '{}': {}", value, err)))
}

impl Store {
    pub fn create_import(
        &self,
        owner: &str,
        name: &str,
        asset: &str,
        interval: Interval,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> AxResult<PriceImport> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_imports (owner, name, asset, interval, start_date, end_date, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                owner,
                name,
                asset.to_uppercase(),
                interval.as_str(),
                start.map(|d| d.to_string()),
                end.map(|d| d.to_string()),
                ImportStatus::Pending.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(query_error("insert import"))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        debug!(import_id = id, asset, interval = %interval, "Created price import");
        self.get_import(id)
    }

    pub fn get_import(&self, id: i64) -> AxResult<PriceImport> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM price_imports WHERE id = ?1", IMPORT_COLUMNS),
                params![id],
                ImportRow::read,
            )
            .optional()
            .map_err(query_error("get import"))?;
        row.ok_or_else(|| not_found("price import", id))?.into_import()
    }

    /// Move an import along pending -> in_progress -> completed | failed.
    pub fn set_import_status(&self, id: i64, status: ImportStatus, error: Option<&str>) -> AxResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error("begin import update"))?;
        let current: Option<String> = tx
            .query_row("SELECT status FROM price_imports WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(query_error("get import status"))?;
        let current = current.ok_or_else(|| not_found("price import", id))?;
        let current = ImportStatus::parse(&current)
            .ok_or_else(|| corrupt(format!("import {} has unknown status '{}'", id, current)))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::QueryFailed {
                query: "update import status".to_string(),
                error: format!("import {} cannot move from {} to {}", id, current, status),
            }
            .into());
        }
        tx.execute(
            "UPDATE price_imports SET status = ?2, error = ?3 WHERE id = ?1",
            params![id, status.as_str(), error],
        )
        .map_err(query_error("update import status"))?;
        tx.commit().map_err(query_error("commit import update"))?;
        Ok(())
    }

    /// Store bars for an import, ignoring timestamps already present, and
    /// record the actual stored range. Returns the number of new bars.
    pub fn store_bars(&self, id: i64, series: &PriceSeries) -> AxResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error("begin bar insert"))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO price_bars
                     (import_id, timestamp, open, high, low, close, volume, adj_close)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(query_error("insert bars"))?;
            for row in series.rows() {
                inserted += stmt
                    .execute(params![
                        id,
                        row.date.format(TIME_FORMAT).to_string(),
                        row.open,
                        row.high,
                        row.low,
                        row.close,
                        row.volume,
                        row.adj_close,
                    ])
                    .map_err(query_error("insert bars"))?;
            }
        }
        tx.execute(
            "UPDATE price_imports SET
                first_bar = (SELECT MIN(timestamp) FROM price_bars WHERE import_id = ?1),
                last_bar = (SELECT MAX(timestamp) FROM price_bars WHERE import_id = ?1),
                bar_count = (SELECT COUNT(*) FROM price_bars WHERE import_id = ?1)
             WHERE id = ?1",
            params![id],
        )
        .map_err(query_error("update import range"))?;
        tx.commit().map_err(query_error("commit bar insert"))?;
        info!(import_id = id, asset = %series.asset, inserted, "Stored price bars");
        Ok(inserted)
    }

    /// All bars of an import as a normalized series.
    pub fn load_series(&self, id: i64) -> AxResult<PriceSeries> {
        let import = self.get_import(id)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, open, high, low, close, volume, adj_close
                 FROM price_bars WHERE import_id = ?1 ORDER BY timestamp",
            )
            .map_err(query_error("load bars"))?;
        let raw = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    [row.get::<_, f64>(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
                ))
            })
            .map_err(query_error("load bars"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_error("load bars"))?;

        if raw.is_empty() {
            return Err(DataError::Unavailable {
                asset: import.asset,
                start: import.start.map(|d| d.to_string()).unwrap_or_default(),
                end: import.end.map(|d| d.to_string()).unwrap_or_default(),
            }
            .into());
        }

        let mut rows = Vec::with_capacity(raw.len());
        for (timestamp, [open, high, low, close, volume, adj_close]) in raw {
            let mut row = PriceRow::new(parse_bar_time(&timestamp)?, open, high, low, close, volume);
            row.adj_close = adj_close;
            rows.push(row);
        }
        PriceSeries::new(import.asset, import.interval, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_store;
    use ax_types::AxError;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn series(days: &[u32]) -> PriceSeries {
        let rows = days
            .iter()
            .map(|&d| PriceRow::new(at(d, 0), 10.0, 11.0, 9.0, 10.5, 100.0 + d as f64))
            .collect();
        PriceSeries::new("BTC", Interval::Day, rows).unwrap()
    }

    #[test]
    fn test_import_lifecycle() {
        let (_dir, store) = temp_store();
        let start = NaiveDate::from_ymd_opt(2024, 2, 1);
        let import = store.create_import("alice", "btc daily", "btc", Interval::Day, start, None).unwrap();
        assert_eq!(import.status, ImportStatus::Pending);
        assert_eq!(import.asset, "BTC");

        assert!(store.set_import_status(import.id, ImportStatus::Completed, None).is_err());
        store.set_import_status(import.id, ImportStatus::InProgress, None).unwrap();
        assert_eq!(store.store_bars(import.id, &series(&[2, 3, 4])).unwrap(), 3);
        store.set_import_status(import.id, ImportStatus::Completed, None).unwrap();

        let stored = store.get_import(import.id).unwrap();
        assert_eq!(stored.status, ImportStatus::Completed);
        assert_eq!(stored.first_bar, Some(at(2, 0)));
        assert_eq!(stored.last_bar, Some(at(4, 0)));
        assert_eq!(stored.bar_count, 3);
        assert_eq!(stored.start, start);
    }

    #[test]
    fn test_duplicate_bars_are_ignored() {
        let (_dir, store) = temp_store();
        let import = store.create_import("alice", "btc", "BTC", Interval::Day, None, None).unwrap();
        assert_eq!(store.store_bars(import.id, &series(&[1, 2])).unwrap(), 2);
        assert_eq!(store.store_bars(import.id, &series(&[2, 3])).unwrap(), 1);

        let loaded = store.load_series(import.id).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.first().unwrap().date, at(1, 0));
        assert_eq!(loaded.last().unwrap().volume, 103.0);
        assert_eq!(loaded.interval, Interval::Day);
    }

    #[test]
    fn test_empty_import_is_unavailable() {
        let (_dir, store) = temp_store();
        let import = store.create_import("alice", "eth", "ETH", Interval::Hour, None, None).unwrap();
        assert!(matches!(
            store.load_series(import.id),
            Err(AxError::Data(DataError::Unavailable { .. }))
        ));
        assert!(matches!(
            store.load_series(import.id + 1),
            Err(AxError::Store(StoreError::NotFound { .. }))
        ));
    }
}
