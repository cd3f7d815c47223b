// Synchronous entry points: strategy CRUD and run dispatch

use std::sync::Arc;
use std::time::Duration;

use ax_report::ChartFeed;
use ax_script::{introspect_parameters, ParameterIntrospection, SandboxLimits, Validator};
use ax_store::Store;
use ax_types::{
    invalid_parameter, AxResult, BacktestError, Run, RunId, RunParameters, RunStatusView, StrategyError,
    StrategyId, StrategySpec,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

fn require_name(name: &str) -> AxResult<()> {
    if name.trim().is_empty() {
        return Err(invalid_parameter!("name", "must not be empty"));
    }
    Ok(())
}

fn owned_by(strategy: &StrategySpec, owner: &str) -> AxResult<()> {
    if strategy.owner != owner {
        return Err(StrategyError::PermissionDenied {
            message: format!("strategy {} does not belong to {}", strategy.id, owner),
        }
        .into());
    }
    Ok(())
}

pub struct StrategyService {
    store: Arc<Store>,
    validator: Validator,
    limits: SandboxLimits,
}

impl StrategyService {
    pub fn new(store: Arc<Store>, limits: SandboxLimits) -> Self {
        Self {
            store,
            validator: Validator::default(),
            limits,
        }
    }

    pub fn create(&self, owner: &str, name: &str, description: &str, source_code: &str) -> AxResult<StrategySpec> {
        require_name(name)?;
        self.validator.validate(source_code)?;
        let strategy = StrategySpec::new(owner, name.trim(), description, source_code);
        self.store.insert_strategy(&strategy)?;
        info!(strategy_id = %strategy.id, owner, name = %strategy.name, "Created strategy");
        Ok(strategy)
    }

    pub fn update(
        &self,
        owner: &str,
        id: StrategyId,
        name: &str,
        description: &str,
        source_code: &str,
    ) -> AxResult<StrategySpec> {
        require_name(name)?;
        self.validator.validate(source_code)?;
        let mut strategy = self.store.get_strategy(id)?;
        owned_by(&strategy, owner)?;

        strategy.name = name.trim().to_string();
        strategy.description = description.to_string();
        strategy.source_code = source_code.to_string();
        strategy.updated_at = Utc::now();
        self.store.update_strategy(&strategy)?;
        info!(strategy_id = %id, "Updated strategy");
        Ok(strategy)
    }

    /// Runs keep their snapshot, so deleting a strategy never touches them.
    pub fn delete(&self, owner: &str, id: StrategyId) -> AxResult<()> {
        let strategy = self.store.get_strategy(id)?;
        owned_by(&strategy, owner)?;
        self.store.delete_strategy(id)?;
        info!(strategy_id = %id, "Deleted strategy");
        Ok(())
    }

    pub fn get(&self, id: StrategyId) -> AxResult<StrategySpec> {
        self.store.get_strategy(id)
    }

    pub fn list(&self, owner: &str) -> AxResult<Vec<StrategySpec>> {
        self.store.list_strategies(owner)
    }

    pub fn parameters(&self, id: StrategyId) -> AxResult<ParameterIntrospection> {
        let strategy = self.store.get_strategy(id)?;
        introspect_parameters(&strategy.source_code, &self.limits)
    }
}

pub struct RunService {
    store: Arc<Store>,
    validator: Validator,
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

impl RunService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            validator: Validator::default(),
            locks: DashMap::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn user_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Snapshot a strategy into a new PENDING run.
    ///
    /// A user's dispatches are serialized; waiting longer than the lock
    /// timeout fails with `LockTimeout`. A user's lock entry is dropped once
    /// no dispatch holds or awaits it.
    pub fn dispatch(&self, owner: &str, strategy_id: StrategyId, parameters: RunParameters) -> AxResult<Run> {
        parameters.validate()?;

        let lock = self.user_lock(owner);
        let result = match lock.try_lock_for(self.lock_timeout) {
            Some(_guard) => self.dispatch_locked(owner, strategy_id, parameters),
            None => Err(BacktestError::LockTimeout {
                owner: owner.to_string(),
                seconds: self.lock_timeout.as_secs(),
            }
            .into()),
        };
        drop(lock);
        self.locks.remove_if(owner, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn dispatch_locked(&self, owner: &str, strategy_id: StrategyId, parameters: RunParameters) -> AxResult<Run> {
        let strategy = self.store.get_strategy(strategy_id)?;
        owned_by(&strategy, owner)?;
        self.validator.validate(&strategy.source_code)?;

        let run = Run::new(owner, &strategy, parameters);
        self.store.insert_run(&run)?;
        info!(run_id = %run.id, strategy_id = %strategy_id, owner, "Dispatched run");
        Ok(run)
    }

    pub fn status(&self, id: RunId) -> AxResult<RunStatusView> {
        self.store.run_status(id)
    }

    pub fn get(&self, id: RunId) -> AxResult<Run> {
        self.store.get_run(id)
    }

    pub fn list(&self, owner: &str) -> AxResult<Vec<Run>> {
        self.store.list_runs(owner)
    }

    pub fn chart_feed(&self, id: RunId) -> AxResult<ChartFeed> {
        let run = self.store.get_run(id)?;
        debug!(run_id = %id, feeds = run.price_snapshot.len(), "Building chart feed");
        ChartFeed::from_run(&run)
    }

    pub fn chart_png(&self, id: RunId) -> AxResult<Option<Vec<u8>>> {
        self.store.chart_png(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, SMA_CROSS};
    use ax_types::{AxError, DataSourceSpec, RunStatus, ValidationError};
    use chrono::NaiveDate;

    fn strategies(h: &crate::testing::Harness) -> StrategyService {
        StrategyService::new(h.store.clone(), SandboxLimits::default())
    }

    #[test]
    fn test_missing_base_class_is_rejected() {
        let h = harness();
        let source = "class Lonely:\n    def next(self):\n        pass\n";
        let err = strategies(&h).create("alice", "Lonely", "", source).unwrap_err();
        assert!(matches!(err, AxError::Validation(ValidationError::MissingStrategyClass)));
        assert!(h.store.list_strategies("alice").unwrap().is_empty());
    }

    #[test]
    fn test_missing_next_mentions_next() {
        let h = harness();
        let source = "import backtrader as bt\n\nclass Idle(bt.Strategy):\n    def start(self):\n        pass\n";
        let err = strategies(&h).create("alice", "Idle", "", source).unwrap_err();
        assert!(err.to_string().contains("next"));
    }

    #[test]
    fn test_strategy_lifecycle() {
        let h = harness();
        let service = strategies(&h);
        let created = service.create("alice", "  Cross ", "sma", SMA_CROSS).unwrap();
        assert_eq!(created.name, "Cross");
        assert!(service.create("alice", " ", "", SMA_CROSS).is_err());

        let updated = service
            .update("alice", created.id, "Cross v2", "faster", &SMA_CROSS.replace("('fast', 2)", "('fast', 3)"))
            .unwrap();
        assert_eq!(service.get(created.id).unwrap().name, "Cross v2");
        assert!(updated.updated_at >= created.updated_at);

        match service.parameters(created.id).unwrap() {
            ParameterIntrospection::Parameters(map) => {
                assert_eq!(map["fast"], serde_json::json!(3));
                assert_eq!(map["slow"], serde_json::json!(4));
            }
            other => panic!("unexpected introspection: {other:?}"),
        }

        assert_eq!(service.list("alice").unwrap().len(), 1);
        service.delete("alice", created.id).unwrap();
        assert!(service.list("alice").unwrap().is_empty());
    }

    #[test]
    fn test_only_owner_can_change_a_strategy() {
        let h = harness();
        let service = strategies(&h);
        let created = service.create("alice", "Cross", "", SMA_CROSS).unwrap();

        let err = service.delete("mallory", created.id).unwrap_err();
        assert!(matches!(err, AxError::Strategy(StrategyError::PermissionDenied { .. })));
        assert!(service
            .update("mallory", created.id, "Mine", "", SMA_CROSS)
            .is_err());
        assert_eq!(service.get(created.id).unwrap().name, "Cross");
    }

    #[test]
    fn test_dispatch_creates_pending_snapshot() {
        let h = harness();
        let strategy = strategies(&h).create("alice", "Cross", "", SMA_CROSS).unwrap();
        let runs = RunService::new(h.store.clone());

        let run = runs.dispatch("alice", strategy.id, RunParameters::default()).unwrap();
        assert_eq!(runs.status(run.id).unwrap().status, RunStatus::Pending);
        assert_eq!(run.snapshot.source_code, SMA_CROSS);

        // Editing the strategy leaves the snapshot alone
        strategies(&h)
            .update("alice", strategy.id, "Renamed", "", SMA_CROSS)
            .unwrap();
        assert_eq!(runs.get(run.id).unwrap().snapshot.name, "Cross");
        assert_eq!(runs.list("alice").unwrap().len(), 1);
        assert!(runs.chart_png(run.id).unwrap().is_none());
    }

    #[test]
    fn test_dispatch_rejects_bad_parameters() {
        let h = harness();
        let strategy = strategies(&h).create("alice", "Cross", "", SMA_CROSS).unwrap();
        let runs = RunService::new(h.store.clone());

        let backwards = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "BTC".to_string(),
            interval: "1d".to_string(),
            start: NaiveDate::from_ymd_opt(2024, 2, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 1),
        });
        let bad_interval = RunParameters::default().with_source(DataSourceSpec::Exchange {
            asset: "BTC".to_string(),
            interval: "7m".to_string(),
            start: None,
            end: None,
        });
        for parameters in [
            backwards,
            bad_interval,
            RunParameters::default().with_commission(-1.0),
            RunParameters::default().with_slippage(-0.5),
            RunParameters { leverage: 0.5, ..RunParameters::default() },
        ] {
            let err = runs.dispatch("alice", strategy.id, parameters).unwrap_err();
            assert!(matches!(err, AxError::InvalidParameter { .. }), "{err}");
        }
        assert!(runs.list("alice").unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_of_foreign_strategy_is_denied() {
        let h = harness();
        let strategy = strategies(&h).create("alice", "Cross", "", SMA_CROSS).unwrap();
        let runs = RunService::new(h.store.clone());
        let err = runs.dispatch("mallory", strategy.id, RunParameters::default()).unwrap_err();
        assert!(matches!(err, AxError::Strategy(StrategyError::PermissionDenied { .. })));
    }

    #[test]
    fn test_dispatch_times_out_while_user_is_locked() {
        let h = harness();
        let strategy = strategies(&h).create("alice", "Cross", "", SMA_CROSS).unwrap();
        let runs = RunService::new(h.store.clone()).with_lock_timeout(Duration::from_millis(20));

        let lock = runs.user_lock("alice");
        let held = lock.lock();
        let err = runs.dispatch("alice", strategy.id, RunParameters::default()).unwrap_err();
        assert!(matches!(err, AxError::Backtest(BacktestError::LockTimeout { .. })));

        // Other users are not blocked
        let bob = strategies(&h).create("bob", "Cross", "", SMA_CROSS).unwrap();
        assert!(runs.dispatch("bob", bob.id, RunParameters::default()).is_ok());

        drop(held);
        assert!(runs.dispatch("alice", strategy.id, RunParameters::default()).is_ok());
    }

    #[test]
    fn test_user_locks_are_released_after_dispatch() {
        let h = harness();
        let strategy = strategies(&h).create("alice", "Cross", "", SMA_CROSS).unwrap();
        let runs = RunService::new(h.store.clone()).with_lock_timeout(Duration::from_millis(20));

        runs.dispatch("alice", strategy.id, RunParameters::default()).unwrap();
        assert!(runs.dispatch("alice", StrategyId::new_v4(), RunParameters::default()).is_err());
        assert!(runs.locks.is_empty());

        // An entry someone still holds survives a failed dispatch
        let lock = runs.user_lock("alice");
        let held = lock.lock();
        assert!(runs.dispatch("alice", strategy.id, RunParameters::default()).is_err());
        assert!(runs.locks.contains_key("alice"));
        drop(held);
        drop(lock);

        runs.dispatch("alice", strategy.id, RunParameters::default()).unwrap();
        assert!(runs.locks.is_empty());
    }
}
