// Loading strategy scripts and driving them through the Strategy trait

use std::rc::Rc;

use ax_types::{
    AxResult, LogLine, LogSink, Order, Strategy, StrategyAction, StrategyContext, StrategyError, StrategyParameters,
    Trade,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::StmtKind;
use crate::error::ScriptError;
use crate::interp::Interpreter;
use crate::parser::parse_module;
use crate::runtime::{Market, Runtime, SandboxLimits};
use crate::value::{Class, Dict, Instance, ModuleKind, Value};

/// Log sink that drops everything, for loads whose output nobody reads
pub struct DiscardLogs;

impl LogSink for DiscardLogs {
    fn emit(&self, _line: LogLine) {}
}

/// Declared parameters as reported to API callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterIntrospection {
    Parameters(serde_json::Map<String, serde_json::Value>),
    NoParameters,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyLoader {
    limits: SandboxLimits,
}

impl StrategyLoader {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Execute the module and pick out its strategy class.
    pub fn load(&self, source: &str, log_sink: Box<dyn LogSink>) -> AxResult<StrategyType> {
        let module = parse_module(source).map_err(|err| StrategyError::LoadFailed {
            message: format!("syntax error at {}", err),
        })?;

        let mut interp = Interpreter::new(Runtime::new(log_sink), self.limits.clone());
        for (name, module) in [
            ("backtrader", ModuleKind::Backtrader),
            ("bt", ModuleKind::Backtrader),
            ("math", ModuleKind::Math),
            ("datetime", ModuleKind::Datetime),
        ] {
            interp.globals.insert(name.to_string(), Value::Module(module));
        }
        interp.start_clock();
        interp.run_module(&module).map_err(load_failure)?;

        // Source order, so the choice among several candidates is deterministic
        let candidates: Vec<Rc<Class>> = module
            .body
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::ClassDef(def) => match interp.global(&def.name) {
                    Some(Value::Class(class)) if class.is_strategy => Some(class.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        let class = candidates
            .iter()
            .rev()
            .find(|class| {
                !candidates
                    .iter()
                    .any(|other| other.bases.iter().any(|base| Rc::ptr_eq(base, class)))
            })
            .cloned()
            .ok_or_else(|| StrategyError::LoadFailed {
                message: "no strategy class".to_string(),
            })?;

        let declared = declared_parameters(&class)?;
        debug!(strategy = %class.name, parameters = declared.len(), "strategy script loaded");
        Ok(StrategyType { interp, class, declared })
    }
}

fn load_failure(err: ScriptError) -> StrategyError {
    let location = err
        .frames
        .first()
        .map(|frame| format!(" (line {})", frame.line))
        .unwrap_or_default();
    StrategyError::LoadFailed {
        message: format!("{}{}", err.message, location),
    }
}

fn declared_parameters(class: &Class) -> Result<Vec<(String, Value)>, StrategyError> {
    let invalid = || StrategyError::LoadFailed {
        message: "params must be a tuple of (name, value) pairs or a dict".to_string(),
    };
    let pairs: Vec<(Value, Value)> = match class.lookup("params") {
        None | Some(Value::None) => Vec::new(),
        Some(Value::Dict(dict)) => dict.borrow().entries.clone(),
        Some(Value::Tuple(items)) => pairs_of(&items).ok_or_else(invalid)?,
        Some(Value::List(items)) => pairs_of(&items.borrow()).ok_or_else(invalid)?,
        Some(_) => return Err(invalid()),
    };
    pairs
        .into_iter()
        .map(|(key, value)| match key {
            Value::Str(name) => Ok((name.to_string(), value)),
            _ => Err(invalid()),
        })
        .collect()
}

fn pairs_of(items: &[Value]) -> Option<Vec<(Value, Value)>> {
    items
        .iter()
        .map(|item| {
            let pair: &[Value] = match item {
                Value::Tuple(pair) => pair,
                _ => return None,
            };
            match pair {
                [key, value] => Some((key.clone(), value.clone())),
                _ => None,
            }
        })
        .collect()
}

fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.to_string()),
        Value::List(items) => Json::Array(items.borrow().iter().map(to_json).collect()),
        Value::Tuple(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Dict(dict) => {
            let market = Market::default();
            Json::Object(
                dict.borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| (k.display(&market), to_json(v)))
                    .collect(),
            )
        }
        other => Json::String(other.repr(&Market::default())),
    }
}

/// Override value from the run request; numeric strings become numbers.
fn from_json(value: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match value {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::Int(i)
            } else if let Ok(f) = trimmed.parse::<f64>() {
                Value::Float(f)
            } else {
                Value::str(s)
            }
        }
        Json::Array(items) => Value::list(items.iter().map(from_json).collect()),
        Json::Object(map) => {
            let mut dict = Dict::default();
            for (k, v) in map {
                dict.insert(Value::str(k), from_json(v));
            }
            Value::Dict(Rc::new(std::cell::RefCell::new(dict)))
        }
    }
}

fn to_parameters(values: &[(String, Value)]) -> StrategyParameters {
    let mut params = StrategyParameters::new();
    for (name, value) in values {
        params.insert(name.clone(), to_json(value));
    }
    params
}

/// A loaded strategy class, ready to be instantiated for one run
pub struct StrategyType {
    interp: Interpreter,
    class: Rc<Class>,
    declared: Vec<(String, Value)>,
}

impl std::fmt::Debug for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyType")
            .field("name", &self.class.name)
            .field("parameters", &self.declared.len())
            .finish()
    }
}

impl StrategyType {
    pub fn name(&self) -> &str {
        &self.class.name
    }

    /// Declared parameters with their default values.
    pub fn parameters(&self) -> StrategyParameters {
        to_parameters(&self.declared)
    }

    /// Apply run-level overrides and produce the strategy the engine drives.
    pub fn instantiate(self, overrides: &serde_json::Map<String, serde_json::Value>) -> AxResult<ScriptStrategy> {
        let mut values = self.declared;
        for (name, value) in overrides {
            let slot = values
                .iter_mut()
                .find(|(declared, _)| declared == name)
                .ok_or_else(|| StrategyError::ParameterError {
                    parameter: name.clone(),
                    message: format!("strategy '{}' declares no such parameter", self.class.name),
                })?;
            slot.1 = from_json(value);
        }
        let parameters = to_parameters(&values);
        let params = Value::Params(Rc::new(std::cell::RefCell::new(values)));

        Ok(ScriptStrategy {
            name: self.class.name.clone(),
            interp: self.interp,
            class: self.class,
            instance: None,
            params,
            parameters,
            min_period: 1,
            next_started: false,
        })
    }
}

/// Parameters a script declares, or the marker for none.
pub fn introspect_parameters(source: &str, limits: &SandboxLimits) -> AxResult<ParameterIntrospection> {
    let strategy = StrategyLoader::new(limits.clone()).load(source, Box::new(DiscardLogs))?;
    let parameters = strategy.parameters();
    Ok(if parameters.is_empty() {
        ParameterIntrospection::NoParameters
    } else {
        ParameterIntrospection::Parameters(parameters.to_map())
    })
}

/// Script-backed strategy instance for one simulation
pub struct ScriptStrategy {
    name: String,
    interp: Interpreter,
    class: Rc<Class>,
    instance: Option<Rc<Instance>>,
    params: Value,
    parameters: StrategyParameters,
    min_period: usize,
    next_started: bool,
}

impl std::fmt::Debug for ScriptStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptStrategy")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("min_period", &self.min_period)
            .finish()
    }
}

impl ScriptStrategy {
    pub fn operations(&self) -> u64 {
        self.interp.operations()
    }

    fn instance(&self) -> Result<Rc<Instance>, StrategyError> {
        self.instance.clone().ok_or_else(|| StrategyError::ExecutionError {
            message: format!("strategy '{}' used before start", self.name),
            trace: String::new(),
        })
    }

    fn hook(
        &mut self,
        context: &StrategyContext<'_>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<StrategyAction>, StrategyError> {
        self.interp.runtime.market.sync(context);
        let instance = self.instance()?;
        self.interp.call_method(&instance, method, args)?;
        Ok(self.interp.runtime.take_actions())
    }
}

impl Strategy for ScriptStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &StrategyParameters {
        &self.parameters
    }

    fn min_period(&self) -> usize {
        self.min_period
    }

    fn on_start(&mut self, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        self.interp.start_clock();
        self.interp.runtime.market.sync(context);

        let instance = Rc::new(Instance::new(self.class.clone()));
        {
            let mut attrs = instance.attrs.borrow_mut();
            attrs.insert("params".to_string(), self.params.clone());
            attrs.insert("p".to_string(), self.params.clone());
        }
        self.instance = Some(instance.clone());

        self.interp.runtime.in_init = true;
        self.interp.runtime.min_period = 1;
        let init = self.interp.call_method(&instance, "__init__", Vec::new());
        self.interp.runtime.in_init = false;
        init?;
        self.min_period = self.interp.runtime.min_period;
        debug!(strategy = %self.name, min_period = self.min_period, "strategy initialised");

        self.interp.call_method(&instance, "start", Vec::new())?;
        Ok(self.interp.runtime.take_actions())
    }

    fn on_prenext(&mut self, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        self.hook(context, "prenext", Vec::new())
    }

    fn on_bar(&mut self, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        if !self.next_started {
            self.next_started = true;
            if self.class.lookup("nextstart").is_some() {
                return self.hook(context, "nextstart", Vec::new());
            }
        }
        self.hook(context, "next", Vec::new())
    }

    fn on_order(&mut self, order: &Order, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        let handle = self.interp.runtime.observe_order(order);
        self.hook(context, "notify_order", vec![Value::Order(handle)])
    }

    fn on_trade(&mut self, trade: &Trade, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        self.hook(context, "notify_trade", vec![Value::Trade(Rc::new(trade.clone()))])
    }

    fn on_stop(&mut self, context: &StrategyContext<'_>) -> Result<(), StrategyError> {
        self.hook(context, "stop", Vec::new())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::{FeedView, OrderStatus, Position, PriceRow, Side};
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;

    const SMA_CROSS: &str = r#"
import backtrader as bt

class SmaCross(bt.Strategy):
    params = (('fast', 2), ('slow', 4))

    def __init__(self):
        fast = bt.indicators.SMA(self.data.close, period=self.p.fast)
        slow = bt.indicators.SMA(self.data.close, period=self.p.slow)
        self.crossover = bt.indicators.CrossOver(fast, slow)
        self.spread = fast - slow
        self.order = None

    def start(self):
        self.log('starting with fast=%d' % self.p.fast)

    def notify_order(self, order):
        if order.status == order.Completed:
            side = 'BUY' if order.isbuy() else 'SELL'
            self.log(f'{side} EXECUTED, {order.executed.price:.2f}')
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

    fn start_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn rows(closes: &[f64]) -> Vec<PriceRow> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceRow::new(start_time() + Duration::days(i as i64), *c, c + 1.0, c - 1.0, *c, 100.0))
            .collect()
    }

    fn context<'a>(feeds: &'a [FeedView<'a>], positions: &'a [Position], bar: usize) -> StrategyContext<'a> {
        StrategyContext {
            current_time: feeds[0].rows[bar].date,
            bar_index: bar,
            feeds,
            positions,
            cash: dec!(10000),
            portfolio_value: dec!(10000),
        }
    }

    fn load(source: &str) -> (ScriptStrategy, crossbeam_channel::Receiver<LogLine>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let strategy = StrategyLoader::default()
            .load(source, Box::new(tx))
            .unwrap()
            .instantiate(&serde_json::Map::new())
            .unwrap();
        (strategy, rx)
    }

    #[test]
    fn test_sma_cross_buys_on_upward_cross() {
        let (mut strategy, logs) = load(SMA_CROSS);
        let data = rows(&[10.0, 9.0, 8.0, 7.0, 6.0, 7.0, 9.0, 12.0, 15.0]);
        let positions = vec![Position::new(0)];

        let feeds = [FeedView { name: "BTC", rows: &data[..1] }];
        strategy.on_start(&context(&feeds, &positions, 0)).unwrap();
        assert_eq!(strategy.min_period(), 5);
        assert_eq!(strategy.name(), "SmaCross");
        assert_eq!(logs.try_recv().unwrap().text, "starting with fast=2");

        let mut submitted = Vec::new();
        for bar in 0..data.len() {
            let feeds = [FeedView { name: "BTC", rows: &data[..=bar] }];
            let ctx = context(&feeds, &positions, bar);
            let actions = if bar + 1 < strategy.min_period() {
                strategy.on_prenext(&ctx).unwrap()
            } else {
                strategy.on_bar(&ctx).unwrap()
            };
            for action in actions {
                submitted.push((bar, action));
            }
        }

        assert_eq!(submitted.len(), 1);
        let (bar, action) = &submitted[0];
        assert_eq!(*bar, 6);
        match action {
            StrategyAction::Submit(request) => {
                assert_eq!(request.side, Side::Buy);
                assert_eq!(request.feed, 0);
                assert!(request.size.is_none());
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_order_notification_updates_script_state() {
        let (mut strategy, logs) = load(SMA_CROSS);
        let data = rows(&[10.0, 9.0, 8.0, 7.0, 6.0, 7.0, 9.0]);
        let positions = vec![Position::new(0)];
        let feeds = [FeedView { name: "BTC", rows: &data[..] }];
        let ctx = context(&feeds, &positions, 6);
        strategy.on_start(&ctx).unwrap();
        let _ = logs.try_recv();
        let actions = strategy.on_bar(&ctx).unwrap();
        let StrategyAction::Submit(request) = &actions[0] else {
            panic!("expected a submitted order");
        };

        let mut order = Order::new(request, dec!(1.5), ctx.current_time);
        order.status = OrderStatus::Completed;
        order.executed = Some(ax_types::Execution {
            price: dec!(9.5),
            size: dec!(1.5),
            commission: dec!(0.01),
            value: dec!(14.25),
            executed_at: ctx.current_time,
        });
        strategy.on_order(&order, &ctx).unwrap();
        assert_eq!(logs.try_recv().unwrap().text, "BUY EXECUTED, 9.50");
    }

    #[test]
    fn test_runtime_error_surfaces_traceback() {
        let source = "import backtrader as bt\n\nclass Broken(bt.Strategy):\n    def helper(self):\n        return 1 / 0\n\n    def next(self):\n        self.helper()\n";
        let (mut strategy, _logs) = load(source);
        let data = rows(&[1.0]);
        let positions = vec![Position::new(0)];
        let feeds = [FeedView { name: "BTC", rows: &data[..] }];
        let ctx = context(&feeds, &positions, 0);
        strategy.on_start(&ctx).unwrap();
        match strategy.on_bar(&ctx).unwrap_err() {
            StrategyError::ExecutionError { message, trace } => {
                assert_eq!(message, "ZeroDivisionError: division by zero");
                assert!(trace.contains("line 8, in next"));
                assert!(trace.contains("line 5, in helper"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_operation_budget_stops_runaway_loop() {
        let source = "import backtrader as bt\n\nclass Spin(bt.Strategy):\n    def next(self):\n        while True:\n            pass\n";
        let limits = SandboxLimits {
            max_operations: 10_000,
            ..SandboxLimits::default()
        };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut strategy = StrategyLoader::new(limits)
            .load(source, Box::new(tx))
            .unwrap()
            .instantiate(&serde_json::Map::new())
            .unwrap();
        let data = rows(&[1.0]);
        let positions = vec![Position::new(0)];
        let feeds = [FeedView { name: "BTC", rows: &data[..] }];
        let ctx = context(&feeds, &positions, 0);
        strategy.on_start(&ctx).unwrap();
        match strategy.on_bar(&ctx).unwrap_err() {
            StrategyError::ExecutionError { message, .. } => assert!(message.contains("operation budget")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parameter_overrides() {
        let loader = StrategyLoader::default();
        let strategy_type = loader.load(SMA_CROSS, Box::new(DiscardLogs)).unwrap();
        assert_eq!(strategy_type.parameters().get("slow"), Some(&serde_json::json!(4)));

        let mut overrides = serde_json::Map::new();
        overrides.insert("fast".to_string(), serde_json::json!("3"));
        overrides.insert("slow".to_string(), serde_json::json!(10.5));
        let strategy = strategy_type.instantiate(&overrides).unwrap();
        assert_eq!(strategy.parameters().get("fast"), Some(&serde_json::json!(3)));
        assert_eq!(strategy.parameters().get("slow"), Some(&serde_json::json!(10.5)));

        let strategy_type = loader.load(SMA_CROSS, Box::new(DiscardLogs)).unwrap();
        let mut overrides = serde_json::Map::new();
        overrides.insert("bogus".to_string(), serde_json::json!(1));
        match strategy_type.instantiate(&overrides) {
            Err(ax_types::AxError::Strategy(StrategyError::ParameterError { parameter, .. })) => {
                assert_eq!(parameter, "bogus")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_load_failures() {
        let loader = StrategyLoader::default();
        let err = loader.load("x = 1\n", Box::new(DiscardLogs)).unwrap_err();
        assert!(err.to_string().contains("no strategy class"));

        let err = loader.load("x = 1 +\n", Box::new(DiscardLogs)).unwrap_err();
        assert!(err.to_string().contains("syntax error"));

        let err = loader.load("x = undefined\n", Box::new(DiscardLogs)).unwrap_err();
        assert!(err.to_string().contains("NameError"));
    }

    #[test]
    fn test_introspect_parameters() {
        let limits = SandboxLimits::default();
        let dict_params = "import backtrader as bt\nclass S(bt.Strategy):\n    params = dict(period=20, name='x')\n    def next(self):\n        pass\n";
        match introspect_parameters(dict_params, &limits).unwrap() {
            ParameterIntrospection::Parameters(map) => {
                assert_eq!(map.get("period"), Some(&serde_json::json!(20)));
                assert_eq!(map.get("name"), Some(&serde_json::json!("x")));
            }
            other => panic!("unexpected introspection: {other:?}"),
        }

        let none = "import backtrader as bt\nclass S(bt.Strategy):\n    def next(self):\n        pass\n";
        assert_eq!(
            introspect_parameters(none, &limits).unwrap(),
            ParameterIntrospection::NoParameters
        );
    }

    #[test]
    fn test_most_derived_strategy_class_is_chosen() {
        let source = "import backtrader as bt\nclass Base(bt.Strategy):\n    def next(self):\n        pass\nclass Child(Base):\n    pass\nclass Helper:\n    pass\n";
        let strategy_type = StrategyLoader::default().load(source, Box::new(DiscardLogs)).unwrap();
        assert_eq!(strategy_type.name(), "Child");
    }
}
