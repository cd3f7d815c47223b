use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{AxError, AxResult, BacktestError};
use crate::market::Interval;
use crate::orders::Side;

/// Unique run identifier
pub type RunId = Uuid;

/// Unique strategy identifier
pub type StrategyId = Uuid;

/// User-authored strategy as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub id: StrategyId,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub source_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategySpec {
    pub fn new(owner: &str, name: &str, description: &str, source_code: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            source_code: source_code.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            source_code: self.source_code.clone(),
        }
    }
}

/// Strategy content frozen onto a run at dispatch time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub name: String,
    pub description: String,
    pub source_code: String,
}

/// Where a run's price feed comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceSpec {
    /// Bars previously imported into the local price store.
    Import { import_id: i64 },
    /// Bars fetched from the upstream exchange at run time.
    Exchange {
        asset: String,
        interval: String,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

/// User-supplied run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub commission_pct: f64,
    pub slippage_pct: f64,
    pub leverage: f64,
    #[serde(default)]
    pub strategy_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceSpec>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            commission_pct: 0.1,
            slippage_pct: 0.01,
            leverage: 1.0,
            strategy_params: serde_json::Map::new(),
            data_sources: Vec::new(),
        }
    }
}

impl RunParameters {
    pub fn with_commission(mut self, commission_pct: f64) -> Self {
        self.commission_pct = commission_pct;
        self
    }

    pub fn with_slippage(mut self, slippage_pct: f64) -> Self {
        self.slippage_pct = slippage_pct;
        self
    }

    pub fn with_source(mut self, source: DataSourceSpec) -> Self {
        self.data_sources.push(source);
        self
    }

    pub fn with_strategy_param(mut self, name: &str, value: serde_json::Value) -> Self {
        self.strategy_params.insert(name.to_string(), value);
        self
    }

    /// Synchronous checks applied before a run is created.
    pub fn validate(&self) -> AxResult<()> {
        if !self.commission_pct.is_finite() || self.commission_pct < 0.0 {
            return Err(invalid("commission_pct", "must be a non-negative percentage"));
        }
        if !self.slippage_pct.is_finite() || self.slippage_pct < 0.0 {
            return Err(invalid("slippage_pct", "must be a non-negative percentage"));
        }
        if !self.leverage.is_finite() || self.leverage < 1.0 {
            return Err(invalid("leverage", "must be at least 1"));
        }

        for source in &self.data_sources {
            if let DataSourceSpec::Exchange { asset, interval, start, end } = source {
                if asset.trim().is_empty() {
                    return Err(invalid("asset", "must not be empty"));
                }
                Interval::parse(interval)?;
                if let (Some(start), Some(end)) = (start, end) {
                    if start > end {
                        return Err(invalid(
                            "start",
                            &format!("start date {} is after end date {}", start, end),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn invalid(parameter: &str, message: &str) -> AxError {
    AxError::InvalidParameter {
        parameter: parameter.to_string(),
        message: message.to_string(),
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(RunStatus::Pending),
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Transitions only move forward: PENDING -> RUNNING -> COMPLETED | FAILED.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status polling payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub status: RunStatus,
}

/// Headline performance numbers of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub return_pct: f64,
    pub win_rate_pct: f64,
    pub sharpe_ratio: f64,
    pub total_trades: u64,
    pub won_trades: u64,
    pub initial_value: f64,
    pub final_value: f64,
}

/// Trade or order record as serialized onto the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub time: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub portfolio_value: f64,
}

/// Portfolio value sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: String,
    pub portfolio_value: f64,
}

/// Chronologically ordered observer output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStreams {
    pub trades: Vec<TradeEvent>,
    pub orders: Vec<TradeEvent>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Bar stored with the run for charting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBar {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Denormalized copy of one input feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub name: String,
    pub interval: Interval,
    pub bars: Vec<SnapshotBar>,
}

/// Everything written onto a run when it completes
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub metrics: RunMetrics,
    pub log_text: String,
    pub strategy_logs: Vec<String>,
    pub events: EventStreams,
    pub price_snapshot: Vec<FeedSnapshot>,
    pub chart_png: Vec<u8>,
}

/// One backtest execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub owner: String,
    pub strategy_id: StrategyId,
    pub snapshot: StrategySnapshot,
    pub status: RunStatus,
    pub parameters: RunParameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub log_text: Option<String>,
    pub strategy_logs: Vec<String>,
    pub metrics: Option<RunMetrics>,
    pub events: EventStreams,
    pub price_snapshot: Vec<FeedSnapshot>,
}

impl Run {
    pub fn new(owner: &str, strategy: &StrategySpec, parameters: RunParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            strategy_id: strategy.id,
            snapshot: strategy.snapshot(),
            status: RunStatus::Pending,
            parameters,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            log_text: None,
            strategy_logs: Vec::new(),
            metrics: None,
            events: EventStreams::default(),
            price_snapshot: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunStatus) -> AxResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BacktestError::InvalidTransition {
                run_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_started(&mut self) -> AxResult<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, outcome: &RunOutcome) -> AxResult<()> {
        self.transition(RunStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.metrics = Some(outcome.metrics.clone());
        self.log_text = Some(outcome.log_text.clone());
        self.strategy_logs = outcome.strategy_logs.clone();
        self.events = outcome.events.clone();
        self.price_snapshot = outcome.price_snapshot.clone();
        Ok(())
    }

    pub fn mark_failed(&mut self, log_text: String) -> AxResult<()> {
        self.transition(RunStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.log_text = Some(log_text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> RunOutcome {
        RunOutcome {
            metrics: RunMetrics {
                return_pct: 10.0,
                win_rate_pct: 50.0,
                sharpe_ratio: 1.2,
                total_trades: 4,
                won_trades: 2,
                initial_value: 10_000.0,
                final_value: 11_000.0,
            },
            log_text: "Performance Summary".to_string(),
            strategy_logs: Vec::new(),
            events: EventStreams::default(),
            price_snapshot: Vec::new(),
            chart_png: Vec::new(),
        }
    }

    fn run() -> Run {
        let strategy = StrategySpec::new("alice", "Cross", "", "class X: pass");
        Run::new("alice", &strategy, RunParameters::default())
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = run();
        assert_eq!(run.status, RunStatus::Pending);
        run.mark_started().unwrap();
        run.mark_completed(&outcome()).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.metrics.as_ref().unwrap().return_pct, 10.0);

        // Terminal runs stay terminal
        assert!(run.mark_failed("late failure".to_string()).is_err());
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_cannot_complete_without_running() {
        let mut run = run();
        let err = run.mark_completed(&outcome()).unwrap_err();
        assert!(err.to_string().contains("PENDING -> COMPLETED"));
    }

    #[test]
    fn test_parameters_validation() {
        assert!(RunParameters::default().validate().is_ok());
        assert!(RunParameters::default().with_commission(-1.0).validate().is_err());

        let bad_interval = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "BTC".to_string(),
            interval: "2h".to_string(),
            start: None,
            end: None,
        });
        assert!(matches!(bad_interval.validate(), Err(AxError::InvalidParameter { .. })));

        let inverted = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "BTC".to_string(),
            interval: "1d".to_string(),
            start: NaiveDate::from_ymd_opt(2024, 2, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 1),
        });
        assert!(matches!(inverted.validate(), Err(AxError::InvalidParameter { .. })));
    }

    #[test]
    fn test_status_view_serialization() {
        let view = RunStatusView { status: RunStatus::Running };
        assert_eq!(serde_json::to_string(&view).unwrap(), r#"{"status":"RUNNING"}"#);
    }

    #[test]
    fn test_data_source_serialization() {
        let source = DataSourceSpec::Import { import_id: 7 };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["kind"], "import");
        assert_eq!(json["import_id"], 7);
    }
}
