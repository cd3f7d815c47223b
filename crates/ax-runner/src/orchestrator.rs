// Drives one run from PENDING to a terminal state

use std::any::Any;
use std::error::Error as _;
use std::sync::Arc;

use ax_data::PriceNormalizer;
use ax_engine::EngineSettings;
use ax_report::{build_outcome, ChartConfig};
use ax_script::{SandboxLimits, StrategyLoader, Validator};
use ax_types::{
    AxError, AxResult, BacktestError, DataError, DataSourceSpec, LogLine, PriceSeries, Run, RunId, RunOutcome,
    RunParameters, StoreError,
};
use ax_store::Store;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, SimulationConfig};

pub const NO_DATA_MESSAGE: &str = "No data import found for this backtest";

pub struct Orchestrator {
    store: Arc<Store>,
    normalizer: Option<PriceNormalizer>,
    validator: Validator,
    limits: SandboxLimits,
    simulation: SimulationConfig,
    chart: ChartConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, config: &AppConfig) -> AxResult<Self> {
        Ok(Self {
            store,
            normalizer: config.data.normalizer()?,
            validator: Validator::default(),
            limits: config.sandbox.limits(),
            simulation: config.simulation.clone(),
            chart: config.chart,
        })
    }

    pub fn with_normalizer(mut self, normalizer: Option<PriceNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Execute a PENDING run and return it in its terminal state.
    ///
    /// Only a run that cannot be started (missing or not PENDING) or a
    /// store failure while recording the outcome is returned as an error;
    /// everything in between ends as a FAILED run.
    pub async fn execute(&self, run_id: RunId) -> AxResult<Run> {
        let run = self.store.start_run(run_id)?;
        info!(run_id = %run_id, strategy = %run.snapshot.name, "Executing run");

        let outcome = match self.produce_outcome(&run).await {
            Ok(outcome) => outcome,
            Err(err) => return self.fail(run_id, &err),
        };

        match self.store.complete_run(run_id, &outcome) {
            Ok(run) => {
                if let Some(metrics) = &run.metrics {
                    info!(
                        run_id = %run_id,
                        return_pct = metrics.return_pct,
                        sharpe = metrics.sharpe_ratio,
                        trades = metrics.total_trades,
                        "Run completed"
                    );
                }
                Ok(run)
            }
            Err(err) => self.fail(run_id, &err),
        }
    }

    fn fail(&self, run_id: RunId, err: &AxError) -> AxResult<Run> {
        error!(run_id = %run_id, error = %err, "Run failed");
        self.store.fail_run(run_id, failure_log(err))
    }

    async fn produce_outcome(&self, run: &Run) -> AxResult<RunOutcome> {
        let series = self.resolve_sources(&run.parameters).await?;

        let source = self.validator.validate(&run.snapshot.source_code)?.to_string();
        let settings = EngineSettings::new(
            run.parameters.commission_pct,
            run.parameters.slippage_pct,
            run.parameters.leverage,
        )?
        .with_initial_cash(self.simulation.initial_cash)
        .with_sizer_percent(self.simulation.sizer_percent);

        let job = SimulationJob {
            source,
            overrides: run.parameters.strategy_params.clone(),
            series,
            settings,
            limits: self.limits.clone(),
            chart: self.chart,
        };

        // The interpreter is single-threaded; everything touching it stays on
        // this one blocking thread.
        match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(BacktestError::Simulation {
                message: format!("simulation panicked: {}", panic_message(join.into_panic())),
                trace: String::new(),
            }
            .into()),
            Err(join) => Err(ax_types::internal_error!("simulation task was cancelled: {}", join)),
        }
    }

    async fn resolve_sources(&self, parameters: &RunParameters) -> AxResult<Vec<PriceSeries>> {
        if parameters.data_sources.is_empty() {
            return Err(DataError::SourceNotFound(NO_DATA_MESSAGE.to_string()).into());
        }

        let mut feeds = Vec::with_capacity(parameters.data_sources.len());
        for source in &parameters.data_sources {
            let series = match source {
                DataSourceSpec::Import { import_id } => match self.store.load_series(*import_id) {
                    Err(AxError::Store(StoreError::NotFound { .. })) => {
                        return Err(DataError::SourceNotFound(format!(
                            "{} (import {} does not exist)",
                            NO_DATA_MESSAGE, import_id
                        ))
                        .into())
                    }
                    other => other?,
                },
                DataSourceSpec::Exchange {
                    asset,
                    interval,
                    start,
                    end,
                } => {
                    let normalizer = self.normalizer.as_ref().ok_or_else(|| {
                        DataError::SourceNotFound(format!(
                            "no upstream price provider is configured for {} {}",
                            asset, interval
                        ))
                    })?;
                    normalizer.fetch(asset, interval, *start, *end).await?
                }
            };
            debug!(asset = %series.asset, interval = %series.interval, bars = series.len(), "Resolved price feed");
            feeds.push(series);
        }
        Ok(feeds)
    }
}

/// Everything the blocking simulation thread needs, owned.
struct SimulationJob {
    source: String,
    overrides: serde_json::Map<String, serde_json::Value>,
    series: Vec<PriceSeries>,
    settings: EngineSettings,
    limits: SandboxLimits,
    chart: ChartConfig,
}

impl SimulationJob {
    fn run(self) -> AxResult<RunOutcome> {
        let (sender, receiver) = crossbeam_channel::unbounded::<LogLine>();
        let loader = StrategyLoader::new(self.limits);

        let output = {
            let mut strategy = loader.load(&self.source, Box::new(sender))?.instantiate(&self.overrides)?;
            ax_engine::run_with_settings(&self.series, &mut strategy, self.settings)?
        };

        let logs: Vec<LogLine> = receiver.try_iter().collect();
        if logs.is_empty() {
            warn!("Strategy produced no log output");
        }
        build_outcome(&output, &logs, &self.chart)
    }
}

/// Log stored on a FAILED run: the error, its source chain and any script
/// traceback.
pub fn failure_log(err: &AxError) -> String {
    let mut text = format!("Backtest failed: {}", err);
    let mut cause = err.source();
    while let Some(inner) = cause {
        text.push_str(&format!("\nCaused by: {}", inner));
        cause = inner.source();
    }
    if let Some(trace) = err.trace() {
        text.push_str("\n\nTraceback:\n");
        text.push_str(trace);
    }
    text
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{daily_series, harness, Harness, SMA_CROSS};
    use ax_data::SampleDataProvider;
    use ax_report::NO_TRADES_SUMMARY;
    use ax_types::{LeaderboardCategory, RunStatus, StrategySpec};
    use chrono::NaiveDate;

    const IDLE: &str = "import backtrader as bt\n\nclass Idle(bt.Strategy):\n    def next(self):\n        pass\n";

    fn pending_run(h: &Harness, source: &str, parameters: RunParameters) -> Run {
        let strategy = StrategySpec::new("alice", "Test", "", source);
        h.store.insert_strategy(&strategy).unwrap();
        let run = Run::new("alice", &strategy, parameters);
        h.store.insert_run(&run).unwrap();
        run
    }

    fn imported(h: &Harness, closes: &[f64]) -> DataSourceSpec {
        let import = h
            .store
            .create_import("alice", "btc", "BTC", ax_types::Interval::Day, None, None)
            .unwrap();
        h.store.store_bars(import.id, &daily_series(closes)).unwrap();
        DataSourceSpec::Import { import_id: import.id }
    }

    #[tokio::test]
    async fn test_completed_run_records_everything() {
        let h = harness();
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 7.0, 9.0, 12.0, 15.0, 14.0, 12.0, 9.0, 7.0, 6.0];
        let parameters = RunParameters::default()
            .with_slippage(0.0)
            .with_source(imported(&h, &closes));
        let run = pending_run(&h, SMA_CROSS, parameters);

        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let metrics = done.metrics.clone().unwrap();
        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.won_trades, 1);
        assert_eq!(metrics.win_rate_pct, 100.0);
        assert!(metrics.return_pct > 0.0);
        assert_eq!(
            done.strategy_logs,
            vec!["2024-01-08 00:00:00 BUY EXECUTED, 9.00", "2024-01-12 00:00:00 SELL EXECUTED, 12.00"]
        );
        assert!(done.log_text.as_deref().unwrap().starts_with("Performance Summary"));
        assert_eq!(done.events.orders.len(), 2);
        assert_eq!(done.events.trades.len(), 1);
        assert_eq!(done.events.equity_curve.len(), closes.len());
        assert_eq!(done.price_snapshot[0].bars.len(), closes.len());

        let png = h.store.chart_png(run.id).unwrap().unwrap();
        assert_eq!(png[..4], [137, 80, 78, 71]);
        let leader = h.store.leaderboard_entry(LeaderboardCategory::Return).unwrap().unwrap();
        assert_eq!(leader.run_id, run.id);
    }

    #[tokio::test]
    async fn test_missing_data_source_fails_run() {
        let h = harness();
        let run = pending_run(&h, IDLE, RunParameters::default());

        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.log_text.unwrap().contains("No data import found"));
        assert!(done.metrics.is_none());
        assert!(h.store.leaderboard().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_import_fails_run() {
        let h = harness();
        let parameters = RunParameters::default().with_source(DataSourceSpec::Import { import_id: 42 });
        let run = pending_run(&h, IDLE, parameters);
        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.log_text.unwrap().contains("No data import found"));
    }

    #[tokio::test]
    async fn test_exchange_source_without_provider() {
        let h = harness();
        let parameters = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "BTC".to_string(),
            interval: "1d".to_string(),
            start: None,
            end: None,
        });
        let run = pending_run(&h, IDLE, parameters);
        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.log_text.unwrap().contains("no upstream price provider is configured"));
    }

    #[tokio::test]
    async fn test_zero_trade_run_over_sample_prices() {
        let h = harness();
        let orchestrator = Orchestrator::new(h.store.clone(), &h.config)
            .unwrap()
            .with_normalizer(Some(PriceNormalizer::new(Arc::new(SampleDataProvider::new()))));
        let parameters = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "ETH".to_string(),
            interval: "1d".to_string(),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 20),
        });
        let run = pending_run(&h, IDLE, parameters);

        let done = orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        let metrics = done.metrics.unwrap();
        assert_eq!(metrics.win_rate_pct, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.return_pct, 0.0);
        assert_eq!(done.log_text.as_deref(), Some(NO_TRADES_SUMMARY));
        assert_eq!(done.price_snapshot[0].bars.len(), 20);
    }

    #[tokio::test]
    async fn test_script_error_keeps_traceback() {
        let h = harness();
        let source = "import backtrader as bt\n\nclass Broken(bt.Strategy):\n    def next(self):\n        return self.data.close[0] / 0\n";
        let parameters = RunParameters::default().with_source(imported(&h, &[1.0, 2.0, 3.0]));
        let run = pending_run(&h, source, parameters);

        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        let log = done.log_text.unwrap();
        assert!(log.starts_with("Backtest failed: "));
        assert!(log.contains("ZeroDivisionError"));
        assert!(log.contains("Traceback:"));
        assert!(log.contains("line 5, in next"));
    }

    #[tokio::test]
    async fn test_invalid_snapshot_is_rejected_before_loading() {
        let h = harness();
        let source = "import os\nimport backtrader as bt\n\nclass Sneaky(bt.Strategy):\n    def next(self):\n        pass\n";
        let parameters = RunParameters::default().with_source(imported(&h, &[1.0, 2.0]));
        let run = pending_run(&h, source, parameters);

        let done = h.orchestrator.execute(run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.log_text.unwrap().contains("'os'"));
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_executed_again() {
        let h = harness();
        let run = pending_run(&h, IDLE, RunParameters::default());
        h.orchestrator.execute(run.id).await.unwrap();

        let err = h.orchestrator.execute(run.id).await.unwrap_err();
        assert!(matches!(err, AxError::Backtest(BacktestError::InvalidTransition { .. })));
        assert_eq!(h.store.run_status(run.id).unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_failure_log_includes_chain_and_trace() {
        let err: AxError = BacktestError::Simulation {
            message: "NameError: name 'x' is not defined".to_string(),
            trace: "Traceback (most recent call last):\n  line 7, in next".to_string(),
        }
        .into();
        let log = failure_log(&err);
        assert!(log.starts_with("Backtest failed: Backtest error: Simulation error: NameError"));
        assert!(log.contains("\nCaused by: Simulation error: NameError"));
        assert!(log.ends_with("line 7, in next"));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }
}
