// State a running script shares with the simulation

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use ax_types::{
    Execution, LogLine, LogSink, Order, OrderId, OrderRequest, OrderStatus, Position, PriceRow, Side, StrategyAction,
    StrategyContext,
};
use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ScriptError, ScriptResult};

/// Largest sequence or string a script may materialize at once
pub(crate) const MAX_SEQUENCE: usize = 10_000_000;

/// Length of `len` items repeated `count` times, refused past `MAX_SEQUENCE`.
pub(crate) fn repeated_len(len: usize, count: usize) -> ScriptResult<usize> {
    match len.checked_mul(count) {
        Some(total) if total <= MAX_SEQUENCE => Ok(total),
        _ => Err(ScriptError::new("MemoryError", "sequence too large")),
    }
}

/// Resource limits enforced by the interpreter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Statements, calls and loop iterations allowed per run
    pub max_operations: u64,
    pub max_call_depth: usize,
    /// Wall-clock budget for the whole run; `None` disables the check
    #[serde(with = "optional_secs")]
    pub time_limit: Option<Duration>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_call_depth: 64,
            time_limit: Some(Duration::from_secs(120)),
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Price field of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl LineField {
    pub fn parse(name: &str) -> Option<LineField> {
        Some(match name {
            "open" => LineField::Open,
            "high" => LineField::High,
            "low" => LineField::Low,
            "close" => LineField::Close,
            "volume" => LineField::Volume,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            LineField::Open => "open",
            LineField::High => "high",
            LineField::Low => "low",
            LineField::Close => "close",
            LineField::Volume => "volume",
        }
    }

    pub fn read(&self, row: &PriceRow) -> f64 {
        match self {
            LineField::Open => row.open,
            LineField::High => row.high,
            LineField::Low => row.low,
            LineField::Close => row.close,
            LineField::Volume => row.volume,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorFeed {
    pub name: String,
    pub rows: Vec<PriceRow>,
}

/// Owned copy of everything the script can observe about the simulation
///
/// Rows only ever grow, so syncing appends whatever the engine revealed
/// since the previous callback.
#[derive(Debug, Clone, Default)]
pub struct Market {
    pub feeds: Vec<MirrorFeed>,
    pub current_time: NaiveDateTime,
    pub positions: Vec<Position>,
    pub cash: Decimal,
    pub value: Decimal,
}

impl Market {
    pub fn sync(&mut self, context: &StrategyContext<'_>) {
        if self.feeds.len() != context.feeds.len() {
            self.feeds = context
                .feeds
                .iter()
                .map(|f| MirrorFeed {
                    name: f.name.to_string(),
                    rows: Vec::new(),
                })
                .collect();
        }
        for (mirror, view) in self.feeds.iter_mut().zip(context.feeds) {
            if view.rows.len() > mirror.rows.len() {
                mirror.rows.extend_from_slice(&view.rows[mirror.rows.len()..]);
            }
        }
        self.current_time = context.current_time;
        self.positions = context.positions.to_vec();
        self.cash = context.cash;
        self.value = context.portfolio_value;
    }

    pub fn feed_len(&self, feed: usize) -> usize {
        self.feeds.get(feed).map(|f| f.rows.len()).unwrap_or(0)
    }

    /// Absolute row index for an `ago` offset (0 current, -1 previous).
    pub fn index_for(&self, feed: usize, ago: i64) -> Option<usize> {
        let len = self.feed_len(feed) as i64;
        let idx = len - 1 + ago;
        if ago > 0 || idx < 0 {
            None
        } else {
            Some(idx as usize)
        }
    }

    pub fn row(&self, feed: usize, index: usize) -> Option<&PriceRow> {
        self.feeds.get(feed)?.rows.get(index)
    }

    pub fn feed_index(&self, name: &str) -> Option<usize> {
        self.feeds.iter().position(|f| f.name == name)
    }

    pub fn position_size(&self, feed: usize) -> f64 {
        self.positions.get(feed).and_then(|p| p.size.to_f64()).unwrap_or(0.0)
    }

    pub fn position_price(&self, feed: usize) -> f64 {
        self.positions.get(feed).and_then(|p| p.price.to_f64()).unwrap_or(0.0)
    }

    pub fn position_decimal(&self, feed: usize) -> Decimal {
        self.positions.get(feed).map(|p| p.size).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub size: Option<Decimal>,
    pub status: OrderStatus,
    pub executed: Option<Execution>,
}

/// Script-side handle for an order; updated in place as notifications arrive
#[derive(Debug)]
pub struct OrderHandle {
    pub id: OrderId,
    pub ref_num: i64,
    pub feed: usize,
    pub side: Side,
    pub state: RefCell<OrderState>,
}

impl OrderHandle {
    /// Size with the buy/sell sign applied
    pub fn signed_size(&self) -> Option<f64> {
        let size = self.state.borrow().size?.to_f64()?;
        Some(match self.side {
            Side::Buy => size,
            Side::Sell => -size,
        })
    }
}

/// Per-run bookkeeping the interpreter mutates while hooks execute
pub struct Runtime {
    pub market: Market,
    pub sink: Box<dyn LogSink>,
    pub actions: Vec<StrategyAction>,
    pub orders: HashMap<OrderId, Rc<OrderHandle>>,
    next_ref: i64,
    /// Set while `__init__` runs: line arithmetic builds indicators instead of numbers
    pub in_init: bool,
    pub min_period: usize,
}

impl Runtime {
    pub fn new(sink: Box<dyn LogSink>) -> Self {
        Self {
            market: Market::default(),
            sink,
            actions: Vec::new(),
            orders: HashMap::new(),
            next_ref: 1,
            in_init: false,
            min_period: 1,
        }
    }

    pub fn take_actions(&mut self) -> Vec<StrategyAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn log(&self, timestamp: Option<NaiveDateTime>, text: String) {
        self.sink.emit(LogLine {
            timestamp: timestamp.unwrap_or(self.market.current_time),
            text,
        });
    }

    pub fn submit(&mut self, request: OrderRequest) -> Rc<OrderHandle> {
        let handle = Rc::new(OrderHandle {
            id: request.id,
            ref_num: self.next_ref,
            feed: request.feed,
            side: request.side,
            state: RefCell::new(OrderState {
                size: request.size,
                status: OrderStatus::Submitted,
                executed: None,
            }),
        });
        self.next_ref += 1;
        self.orders.insert(handle.id, handle.clone());
        self.actions.push(StrategyAction::Submit(request));
        handle
    }

    pub fn cancel(&mut self, order_id: OrderId) {
        self.actions.push(StrategyAction::Cancel { order_id });
    }

    /// Update (or adopt) the handle for an order the engine reported on.
    pub fn observe_order(&mut self, order: &Order) -> Rc<OrderHandle> {
        let handle = match self.orders.get(&order.id) {
            Some(handle) => handle.clone(),
            None => {
                let handle = Rc::new(OrderHandle {
                    id: order.id,
                    ref_num: self.next_ref,
                    feed: order.feed,
                    side: order.side,
                    state: RefCell::new(OrderState {
                        size: Some(order.size),
                        status: order.status,
                        executed: None,
                    }),
                });
                self.next_ref += 1;
                self.orders.insert(order.id, handle.clone());
                handle
            }
        };
        {
            let mut state = handle.state.borrow_mut();
            state.size = Some(order.size);
            state.status = order.status;
            state.executed = order.executed.clone();
        }
        if !order.status.is_active() {
            self.orders.remove(&order.id);
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::FeedView;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn row(day: u32, close: f64) -> PriceRow {
        let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(0, 0, 0).unwrap();
        PriceRow::new(date, close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn test_market_sync_appends_new_rows() {
        let rows = vec![row(1, 10.0), row(2, 11.0), row(3, 12.0)];
        let positions = vec![Position::new(0)];
        let mut market = Market::default();

        for visible in 1..=3 {
            let feeds = [FeedView {
                name: "BTC",
                rows: &rows[..visible],
            }];
            let ctx = StrategyContext {
                current_time: rows[visible - 1].date,
                bar_index: visible - 1,
                feeds: &feeds,
                positions: &positions,
                cash: dec!(1000),
                portfolio_value: dec!(1000),
            };
            market.sync(&ctx);
        }

        assert_eq!(market.feed_len(0), 3);
        assert_eq!(market.index_for(0, 0), Some(2));
        assert_eq!(market.index_for(0, -2), Some(0));
        assert_eq!(market.index_for(0, -3), None);
        assert_eq!(market.index_for(0, 1), None);
        assert_eq!(market.feed_index("BTC"), Some(0));
    }

    #[test]
    fn test_order_handles_update_in_place() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut runtime = Runtime::new(Box::new(tx));
        let request = OrderRequest::market(0, Side::Buy);
        let handle = runtime.submit(request.clone());
        assert_eq!(handle.ref_num, 1);
        assert_eq!(runtime.take_actions().len(), 1);

        let mut order = Order::new(&request, dec!(2), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
        order.status = OrderStatus::Completed;
        let observed = runtime.observe_order(&order);
        assert!(Rc::ptr_eq(&handle, &observed));
        assert_eq!(handle.state.borrow().status, OrderStatus::Completed);
        assert_eq!(handle.signed_size(), Some(2.0));
        assert!(runtime.orders.is_empty());
    }
}
