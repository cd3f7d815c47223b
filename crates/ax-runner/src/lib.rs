//! Run orchestration for Arbitrex: configuration, strategy and run services,
//! price imports and the PENDING → RUNNING → COMPLETED/FAILED driver used by
//! the worker binary.

pub mod config;
pub mod imports;
pub mod orchestrator;
pub mod services;

pub use config::{AppConfig, DataConfig, DatabaseConfig, ProviderKind, SandboxConfig, SimulationConfig};
pub use imports::ImportJob;
pub use orchestrator::{failure_log, Orchestrator, NO_DATA_MESSAGE};
pub use services::{RunService, StrategyService, DEFAULT_LOCK_TIMEOUT};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use ax_store::Store;
    use ax_types::{Interval, PriceRow, PriceSeries};
    use chrono::{Duration, NaiveDate};

    use crate::{AppConfig, Orchestrator};

    pub const SMA_CROSS: &str = r#"
import backtrader as bt

class SmaCross(bt.Strategy):
    params = (('fast', 2), ('slow', 4))

    def __init__(self):
        fast = bt.ind.SMA(period=self.p.fast)
        slow = bt.ind.SMA(period=self.p.slow)
        self.crossover = bt.ind.CrossOver(fast, slow)
        self.order = None

    def notify_order(self, order):
        if order.status == order.Completed:
            if order.isbuy():
                self.log('BUY EXECUTED, %.2f' % order.executed.price)
            else:
                self.log('SELL EXECUTED, %.2f' % order.executed.price)
        self.order = None

    def next(self):
        if self.order:
            return
        if not self.position:
            if self.crossover > 0:
                self.order = self.buy()
        elif self.crossover < 0:
            self.order = self.close()
"#;

    pub struct Harness {
        pub _dir: tempfile::TempDir,
        pub store: Arc<Store>,
        pub config: AppConfig,
        pub orchestrator: Orchestrator,
    }

    pub fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_toml(
            r#"
            [data]
            provider = "none"

            [chart]
            width = 320
            height = 200
            "#,
        )
        .unwrap();
        let store = Arc::new(Store::open(dir.path().join("arbitrex.db")).unwrap());
        let orchestrator = Orchestrator::new(store.clone(), &config).unwrap();
        Harness {
            _dir: dir,
            store,
            config,
            orchestrator,
        }
    }

    /// Daily bars from 2024-01-01; each open is the previous close.
    pub fn daily_series(closes: &[f64]) -> PriceSeries {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let rows = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                PriceRow::new(
                    first + Duration::days(i as i64),
                    open,
                    open.max(close) + 1.0,
                    open.min(close) - 1.0,
                    close,
                    10.0,
                )
            })
            .collect();
        PriceSeries::new("BTC", Interval::Day, rows).unwrap()
    }
}
