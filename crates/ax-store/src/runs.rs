// Run records and their guarded status transitions

use ax_types::{AxResult, Run, RunId, RunOutcome, RunStatus, RunStatusView};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::leaderboard::apply_run;
use crate::{corrupt, not_found, parse_time, parse_uuid, query_error, Store};

const RUN_COLUMNS: &str = "id, owner, strategy_id, snapshot, status, parameters, created_at, started_at, \
                           completed_at, log_text, strategy_logs, metrics, events, price_snapshot";

struct RunRow {
    id: String,
    owner: String,
    strategy_id: String,
    snapshot: String,
    status: String,
    parameters: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    log_text: Option<String>,
    strategy_logs: String,
    metrics: Option<String>,
    events: String,
    price_snapshot: String,
}

impl RunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            strategy_id: row.get(2)?,
            snapshot: row.get(3)?,
            status: row.get(4)?,
            parameters: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            log_text: row.get(9)?,
            strategy_logs: row.get(10)?,
            metrics: row.get(11)?,
            events: row.get(12)?,
            price_snapshot: row.get(13)?,
        })
    }

    fn into_run(self) -> AxResult<Run> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("run {} has unknown status '{}'", self.id, self.status)))?;
        Ok(Run {
            id: parse_uuid(&self.id)?,
            owner: self.owner,
            strategy_id: parse_uuid(&self.strategy_id)?,
            snapshot: serde_json::from_str(&self.snapshot)?,
            status,
            parameters: serde_json::from_str(&self.parameters)?,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            log_text: self.log_text,
            strategy_logs: serde_json::from_str(&self.strategy_logs)?,
            metrics: self.metrics.as_deref().map(serde_json::from_str).transpose()?,
            events: serde_json::from_str(&self.events)?,
            price_snapshot: serde_json::from_str(&self.price_snapshot)?,
        })
    }
}

pub(crate) fn load_run(conn: &Connection, id: RunId) -> AxResult<Run> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id.to_string()],
            RunRow::read,
        )
        .optional()
        .map_err(query_error("get run"))?;
    row.ok_or_else(|| not_found("run", id))?.into_run()
}

/// Write every mutable column of `run`.
fn save_state(conn: &Connection, run: &Run) -> AxResult<()> {
    let metrics = run.metrics.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE runs SET status = ?2, started_at = ?3, completed_at = ?4, log_text = ?5,
                strategy_logs = ?6, metrics = ?7, events = ?8, price_snapshot = ?9
         WHERE id = ?1",
        params![
            run.id.to_string(),
            run.status.as_str(),
            run.started_at.map(|t| t.to_rfc3339()),
            run.completed_at.map(|t| t.to_rfc3339()),
            run.log_text,
            serde_json::to_string(&run.strategy_logs)?,
            metrics,
            serde_json::to_string(&run.events)?,
            serde_json::to_string(&run.price_snapshot)?,
        ],
    )
    .map_err(query_error("update run"))?;
    Ok(())
}

impl Store {
    pub fn insert_run(&self, run: &Run) -> AxResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                RUN_COLUMNS
            ),
            params![
                run.id.to_string(),
                run.owner,
                run.strategy_id.to_string(),
                serde_json::to_string(&run.snapshot)?,
                run.status.as_str(),
                serde_json::to_string(&run.parameters)?,
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.log_text,
                serde_json::to_string(&run.strategy_logs)?,
                run.metrics.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&run.events)?,
                serde_json::to_string(&run.price_snapshot)?,
            ],
        )
        .map_err(query_error("insert run"))?;
        debug!(run_id = %run.id, owner = %run.owner, "Inserted run");
        Ok(())
    }

    pub fn get_run(&self, id: RunId) -> AxResult<Run> {
        let conn = self.conn.lock();
        load_run(&conn, id)
    }

    pub fn run_status(&self, id: RunId) -> AxResult<RunStatusView> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![id.to_string()], |row| row.get(0))
            .optional()
            .map_err(query_error("get run status"))?;
        let status = status.ok_or_else(|| not_found("run", id))?;
        let status = RunStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("run {} has unknown status '{}'", id, status)))?;
        Ok(RunStatusView { status })
    }

    /// Runs of one owner, newest first.
    pub fn list_runs(&self, owner: &str) -> AxResult<Vec<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM runs WHERE owner = ?1 ORDER BY created_at DESC",
                RUN_COLUMNS
            ))
            .map_err(query_error("list runs"))?;
        let rows = stmt
            .query_map(params![owner], RunRow::read)
            .map_err(query_error("list runs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_error("list runs"))?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub fn chart_png(&self, id: RunId) -> AxResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let chart: Option<Option<Vec<u8>>> = conn
            .query_row("SELECT chart_png FROM runs WHERE id = ?1", params![id.to_string()], |row| row.get(0))
            .optional()
            .map_err(query_error("get run chart"))?;
        chart.ok_or_else(|| not_found("run", id))
    }

    /// PENDING -> RUNNING. Any other starting state is refused.
    pub fn start_run(&self, id: RunId) -> AxResult<Run> {
        let run = self.transition(id, |_, run| run.mark_started())?;
        info!(run_id = %id, "Run started");
        Ok(run)
    }

    /// RUNNING -> COMPLETED, storing the outcome and updating the
    /// leaderboard in the same transaction.
    pub fn complete_run(&self, id: RunId, outcome: &RunOutcome) -> AxResult<Run> {
        let run = self.transition(id, |conn, run| {
            run.mark_completed(outcome)?;
            conn.execute(
                "UPDATE runs SET chart_png = ?2 WHERE id = ?1",
                params![run.id.to_string(), outcome.chart_png],
            )
            .map_err(query_error("store run chart"))?;
            let leads = apply_run(conn, run.id, run.strategy_id, &outcome.metrics)?;
            debug!(run_id = %run.id, ?leads, "Leaderboard updated");
            Ok(())
        })?;
        info!(run_id = %id, "Run completed");
        Ok(run)
    }

    /// RUNNING -> FAILED with the diagnostic log.
    pub fn fail_run(&self, id: RunId, log_text: String) -> AxResult<Run> {
        let run = self.transition(id, move |_, run| run.mark_failed(log_text))?;
        info!(run_id = %id, "Run failed");
        Ok(run)
    }

    fn transition<F>(&self, id: RunId, apply: F) -> AxResult<Run>
    where
        F: FnOnce(&Connection, &mut Run) -> AxResult<()>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_error("begin run transition"))?;
        let mut run = load_run(&tx, id)?;
        apply(&tx, &mut run)?;
        save_state(&tx, &run)?;
        tx.commit().map_err(query_error("commit run transition"))?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_run, temp_store};
    use ax_types::{AxError, BacktestError, EventStreams, LeaderboardCategory, RunMetrics};

    fn outcome() -> RunOutcome {
        RunOutcome {
            metrics: RunMetrics {
                return_pct: 10.0,
                win_rate_pct: 75.0,
                sharpe_ratio: 1.2,
                total_trades: 4,
                won_trades: 3,
                initial_value: 10_000.0,
                final_value: 11_000.0,
            },
            log_text: "Performance Summary".to_string(),
            strategy_logs: vec!["2024-01-02 00:00:00 BUY EXECUTED, 1.00".to_string()],
            events: EventStreams::default(),
            price_snapshot: Vec::new(),
            chart_png: vec![137, 80, 78, 71],
        }
    }

    fn is_invalid_transition(result: AxResult<Run>) -> bool {
        matches!(result, Err(AxError::Backtest(BacktestError::InvalidTransition { .. })))
    }

    #[test]
    fn test_run_round_trip() {
        let (_dir, store) = temp_store();
        let run = seeded_run(&store);
        assert_eq!(store.get_run(run.id).unwrap(), run);
        assert_eq!(store.run_status(run.id).unwrap().status, RunStatus::Pending);
        assert_eq!(store.list_runs("alice").unwrap().len(), 1);
        assert!(store.list_runs("bob").unwrap().is_empty());
        assert_eq!(store.chart_png(run.id).unwrap(), None);
    }

    #[test]
    fn test_completed_run_stores_everything() {
        let (_dir, store) = temp_store();
        let run = seeded_run(&store);
        store.start_run(run.id).unwrap();
        let completed = store.complete_run(run.id, &outcome()).unwrap();

        let stored = store.get_run(run.id).unwrap();
        assert_eq!(stored, completed);
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.metrics.unwrap().return_pct, 10.0);
        assert_eq!(stored.strategy_logs.len(), 1);
        assert!(stored.started_at.is_some() && stored.completed_at.is_some());
        assert_eq!(store.chart_png(run.id).unwrap(), Some(vec![137, 80, 78, 71]));

        let leader = store.leaderboard_entry(LeaderboardCategory::Sharpe).unwrap().unwrap();
        assert_eq!(leader.run_id, run.id);
    }

    #[test]
    fn test_transitions_are_guarded() {
        let (_dir, store) = temp_store();
        let run = seeded_run(&store);

        assert!(is_invalid_transition(store.complete_run(run.id, &outcome())));
        assert!(is_invalid_transition(store.fail_run(run.id, "early".to_string())));

        store.start_run(run.id).unwrap();
        assert!(is_invalid_transition(store.start_run(run.id)));

        store.fail_run(run.id, "boom".to_string()).unwrap();
        assert!(is_invalid_transition(store.complete_run(run.id, &outcome())));
        assert!(is_invalid_transition(store.start_run(run.id)));

        let stored = store.get_run(run.id).unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.log_text.as_deref(), Some("boom"));
        assert!(stored.metrics.is_none());
        // The refused completion left no trace on the leaderboard.
        assert!(store.leaderboard().unwrap().is_empty());
    }

    #[test]
    fn test_missing_run() {
        let (_dir, store) = temp_store();
        let id = uuid::Uuid::new_v4();
        assert!(store.get_run(id).is_err());
        assert!(store.run_status(id).is_err());
        assert!(store.start_run(id).is_err());
    }

    #[test]
    fn test_two_connections_share_state() {
        let (dir, store) = temp_store();
        let other = Store::open(dir.path().join("arbitrex.db")).unwrap();
        let run = seeded_run(&store);

        other.start_run(run.id).unwrap();
        assert!(is_invalid_transition(store.start_run(run.id)));
        store.complete_run(run.id, &outcome()).unwrap();
        assert_eq!(other.run_status(run.id).unwrap().status, RunStatus::Completed);
    }
}
