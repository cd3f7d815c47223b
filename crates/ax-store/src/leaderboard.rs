// One leader per category, replaced only by a strictly better run

use ax_types::{
    is_improvement, AxResult, BacktestError, LeaderboardCategory, LeaderboardEntry, RunId, RunMetrics, RunStatus,
    StrategyId,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use crate::runs::load_run;
use crate::{corrupt, parse_time, parse_uuid, query_error, Store};

struct EntryRow {
    category: String,
    strategy_id: String,
    run_id: String,
    return_pct: Option<f64>,
    win_rate_pct: Option<f64>,
    sharpe_ratio: Option<f64>,
    updated_at: String,
}

impl EntryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            category: row.get(0)?,
            strategy_id: row.get(1)?,
            run_id: row.get(2)?,
            return_pct: row.get(3)?,
            win_rate_pct: row.get(4)?,
            sharpe_ratio: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_entry(self) -> AxResult<LeaderboardEntry> {
        let category = LeaderboardCategory::parse(&self.category)
            .ok_or_else(|| corrupt(format!("unknown leaderboard category '{}'", self.category)))?;
        Ok(LeaderboardEntry {
            category,
            strategy_id: parse_uuid(&self.strategy_id)?,
            run_id: parse_uuid(&self.run_id)?,
            // SQLite stores NaN as NULL
            return_pct: self.return_pct.unwrap_or(f64::NAN),
            win_rate_pct: self.win_rate_pct.unwrap_or(f64::NAN),
            sharpe_ratio: self.sharpe_ratio.unwrap_or(f64::NAN),
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

pub(crate) fn load_entry(conn: &Connection, category: LeaderboardCategory) -> AxResult<Option<LeaderboardEntry>> {
    let row = conn
        .query_row(
            "SELECT category, strategy_id, run_id, return_pct, win_rate_pct, sharpe_ratio, updated_at
             FROM leaderboard WHERE category = ?1",
            params![category.as_str()],
            EntryRow::read,
        )
        .optional()
        .map_err(query_error("get leaderboard entry"))?;
    row.map(EntryRow::into_entry).transpose()
}

/// Offer a run to every category; returns the categories it now leads.
///
/// Must run inside the caller's write transaction.
pub(crate) fn apply_run(
    conn: &Connection,
    run_id: RunId,
    strategy_id: StrategyId,
    metrics: &RunMetrics,
) -> AxResult<Vec<LeaderboardCategory>> {
    let mut won = Vec::new();
    for category in LeaderboardCategory::ALL {
        let incumbent = load_entry(conn, category)?;
        if incumbent.as_ref().map(|entry| entry.run_id) == Some(run_id) {
            continue;
        }
        if !is_improvement(category, metrics, incumbent.as_ref()) {
            continue;
        }

        let entry = LeaderboardEntry::from_run(category, run_id, strategy_id, metrics);
        conn.execute(
            "INSERT INTO leaderboard (category, strategy_id, run_id, return_pct, win_rate_pct, sharpe_ratio, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(category) DO UPDATE SET
                strategy_id = excluded.strategy_id,
                run_id = excluded.run_id,
                return_pct = excluded.return_pct,
                win_rate_pct = excluded.win_rate_pct,
                sharpe_ratio = excluded.sharpe_ratio,
                updated_at = excluded.updated_at",
            params![
                category.as_str(),
                entry.strategy_id.to_string(),
                entry.run_id.to_string(),
                entry.return_pct,
                entry.win_rate_pct,
                entry.sharpe_ratio,
                entry.updated_at.to_rfc3339(),
            ],
        )
        .map_err(query_error("upsert leaderboard entry"))?;

        info!(
            run_id = %run_id,
            category = %category,
            value = category.metric(metrics),
            previous = incumbent.map(|entry| entry.metric()),
            "New leaderboard leader"
        );
        won.push(category);
    }
    Ok(won)
}

impl Store {
    pub fn leaderboard_entry(&self, category: LeaderboardCategory) -> AxResult<Option<LeaderboardEntry>> {
        let conn = self.conn.lock();
        load_entry(&conn, category)
    }

    /// Current leaders in category order; empty categories are skipped.
    pub fn leaderboard(&self) -> AxResult<Vec<LeaderboardEntry>> {
        let conn = self.conn.lock();
        let mut entries = Vec::new();
        for category in LeaderboardCategory::ALL {
            if let Some(entry) = load_entry(&conn, category)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Re-offer a completed run to the leaderboard. Applying the same run
    /// twice changes nothing.
    pub fn update_leaderboard(&self, run_id: RunId) -> AxResult<Vec<LeaderboardCategory>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error("begin leaderboard update"))?;
        let run = load_run(&tx, run_id)?;
        let metrics = match (&run.status, &run.metrics) {
            (RunStatus::Completed, Some(metrics)) => metrics,
            _ => {
                return Err(BacktestError::ResultsProcessing {
                    message: format!("run {} has no completed metrics ({})", run_id, run.status),
                }
                .into())
            }
        };
        let won = apply_run(&tx, run.id, run.strategy_id, metrics)?;
        tx.commit().map_err(query_error("commit leaderboard update"))?;
        Ok(won)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_run, temp_store};
    use ax_types::{EventStreams, RunOutcome};

    fn outcome(sharpe: f64, return_pct: f64, win_rate_pct: f64) -> RunOutcome {
        RunOutcome {
            metrics: RunMetrics {
                return_pct,
                win_rate_pct,
                sharpe_ratio: sharpe,
                total_trades: 4,
                won_trades: 2,
                initial_value: 10_000.0,
                final_value: 10_000.0 * (1.0 + return_pct / 100.0),
            },
            log_text: "Performance Summary".to_string(),
            strategy_logs: Vec::new(),
            events: EventStreams::default(),
            price_snapshot: Vec::new(),
            chart_png: Vec::new(),
        }
    }

    fn complete(store: &Store, sharpe: f64, return_pct: f64, win_rate_pct: f64) -> RunId {
        let run = seeded_run(store);
        store.start_run(run.id).unwrap();
        store.complete_run(run.id, &outcome(sharpe, return_pct, win_rate_pct)).unwrap();
        run.id
    }

    #[test]
    fn test_lower_sharpe_keeps_first_leader() {
        let (_dir, store) = temp_store();
        let first = complete(&store, 1.2, 5.0, 50.0);
        let second = complete(&store, 0.8, 7.0, 50.0);

        let sharpe = store.leaderboard_entry(LeaderboardCategory::Sharpe).unwrap().unwrap();
        assert_eq!(sharpe.run_id, first);
        assert_eq!(sharpe.sharpe_ratio, 1.2);

        let ret = store.leaderboard_entry(LeaderboardCategory::Return).unwrap().unwrap();
        assert_eq!(ret.run_id, second);

        // Ties keep the incumbent.
        let win = store.leaderboard_entry(LeaderboardCategory::WinRate).unwrap().unwrap();
        assert_eq!(win.run_id, first);
    }

    #[test]
    fn test_reapplying_a_run_is_a_no_op() {
        let (_dir, store) = temp_store();
        let run_id = complete(&store, 1.0, 1.0, 1.0);
        let before = store.leaderboard().unwrap();
        assert_eq!(before.len(), 3);

        assert!(store.update_leaderboard(run_id).unwrap().is_empty());
        assert_eq!(store.leaderboard().unwrap(), before);
    }

    #[test]
    fn test_leaders_never_get_worse() {
        let (_dir, store) = temp_store();
        let mut best = f64::NEG_INFINITY;
        for sharpe in [0.3, 1.1, -0.5, 1.1, 0.9, 2.4, 1.0] {
            complete(&store, sharpe, 0.0, 0.0);
            let leader = store.leaderboard_entry(LeaderboardCategory::Sharpe).unwrap().unwrap();
            assert!(leader.sharpe_ratio >= best);
            best = leader.sharpe_ratio;
        }
        assert_eq!(best, 2.4);
    }

    #[test]
    fn test_pending_run_cannot_be_ranked() {
        let (_dir, store) = temp_store();
        let run = seeded_run(&store);
        assert!(store.update_leaderboard(run.id).is_err());
        assert!(store.leaderboard().unwrap().is_empty());
    }
}
