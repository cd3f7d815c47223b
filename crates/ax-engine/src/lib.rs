// Arbitrex simulation engine
// Market-order broker with a percent-of-equity sizer and four observers

pub mod engine;
pub mod execution;
pub mod observers;
pub mod sharpe;

use ax_types::{AxResult, PriceSeries, Strategy};
use rust_decimal::Decimal;

pub use engine::{feed_names, Engine, EngineSettings, SimFeed};
pub use execution::{ExecutionConfig, ExecutionEngine, PercentSizer};
pub use observers::{EventRecord, ObserverResults, TradeAnalysis, ValueSample};

/// Final broker state after a simulation
#[derive(Debug, Clone, PartialEq)]
pub struct EngineHandle {
    pub strategy_name: String,
    pub feeds: Vec<SimFeed>,
    pub steps: usize,
    pub final_value: Decimal,
    pub final_cash: Decimal,
    pub total_commissions: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutput {
    pub handle: EngineHandle,
    pub results: ObserverResults,
    pub initial_cash: Decimal,
}

/// Simulate with default cash and sizing, no slippage and no leverage.
pub fn run<S: Strategy + ?Sized>(
    series: &[PriceSeries],
    strategy: &mut S,
    commission_pct: f64,
) -> AxResult<SimulationOutput> {
    run_with_settings(series, strategy, EngineSettings::new(commission_pct, 0.0, 1.0)?)
}

pub fn run_with_settings<S: Strategy + ?Sized>(
    series: &[PriceSeries],
    strategy: &mut S,
    settings: EngineSettings,
) -> AxResult<SimulationOutput> {
    Engine::new(series, strategy, settings)?.run()
}
