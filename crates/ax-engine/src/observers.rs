// Observers recording what the simulation did, independent of the strategy

use std::collections::HashSet;

use ax_types::{Order, OrderStatus, Side, Trade};
use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sharpe::sharpe_ratio;

/// Portfolio value at the close of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSample {
    pub time: NaiveDateTime,
    pub value: f64,
}

/// A closed trade or a completed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: NaiveDateTime,
    pub feed: usize,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub portfolio_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeAnalysis {
    pub sharpe_ratio: Option<f64>,
    /// Trades opened, closed or not.
    pub total: u64,
    pub won: u64,
    pub lost: u64,
}

impl TradeAnalysis {
    pub fn open(&self) -> u64 {
        self.total - self.won - self.lost
    }
}

/// Hooks the engine calls after it has updated the broker state
pub trait Observer {
    fn on_order(&mut self, _order: &Order, _portfolio_value: f64) {}

    fn on_trade(&mut self, _trade: &Trade, _portfolio_value: f64) {}

    fn on_step(&mut self, _time: NaiveDateTime, _portfolio_value: f64) {}
}

#[derive(Debug, Default)]
pub struct ValueObserver {
    pub samples: Vec<ValueSample>,
}

impl Observer for ValueObserver {
    fn on_step(&mut self, time: NaiveDateTime, portfolio_value: f64) {
        self.samples.push(ValueSample {
            time,
            value: portfolio_value,
        });
    }
}

#[derive(Debug, Default)]
pub struct TradeObserver {
    pub trades: Vec<EventRecord>,
}

impl Observer for TradeObserver {
    fn on_trade(&mut self, trade: &Trade, portfolio_value: f64) {
        let Some(closed_at) = trade.closed_at else {
            return;
        };
        self.trades.push(EventRecord {
            time: closed_at,
            feed: trade.feed,
            side: trade.direction,
            price: to_f64(trade.price),
            size: to_f64(trade.peak_size),
            portfolio_value,
        });
    }
}

#[derive(Debug, Default)]
pub struct OrderObserver {
    pub orders: Vec<EventRecord>,
}

impl Observer for OrderObserver {
    fn on_order(&mut self, order: &Order, portfolio_value: f64) {
        if order.status != OrderStatus::Completed {
            return;
        }
        if let Some(executed) = &order.executed {
            self.orders.push(EventRecord {
                time: executed.executed_at,
                feed: order.feed,
                side: order.side,
                price: to_f64(executed.price),
                size: to_f64(executed.size),
                portfolio_value,
            });
        }
    }
}

/// Trade counts plus the Sharpe ratio of the value series
#[derive(Debug, Default)]
pub struct TradeAnalyzer {
    seen: HashSet<Uuid>,
    values: Vec<(NaiveDateTime, f64)>,
    analysis: TradeAnalysis,
}

impl Observer for TradeAnalyzer {
    fn on_trade(&mut self, trade: &Trade, _portfolio_value: f64) {
        if self.seen.insert(trade.id) {
            self.analysis.total += 1;
        }
        if trade.is_closed() {
            if trade.is_won() {
                self.analysis.won += 1;
            } else {
                self.analysis.lost += 1;
            }
        }
    }

    fn on_step(&mut self, time: NaiveDateTime, portfolio_value: f64) {
        self.values.push((time, portfolio_value));
    }
}

impl TradeAnalyzer {
    pub fn finish(mut self) -> TradeAnalysis {
        self.analysis.sharpe_ratio = sharpe_ratio(&self.values);
        self.analysis
    }
}

/// The four observers attached to every simulation
#[derive(Debug, Default)]
pub struct ObserverSet {
    pub value: ValueObserver,
    pub trades: TradeObserver,
    pub orders: OrderObserver,
    pub analyzer: TradeAnalyzer,
}

impl ObserverSet {
    fn all(&mut self) -> [&mut dyn Observer; 4] {
        [&mut self.value, &mut self.trades, &mut self.orders, &mut self.analyzer]
    }

    pub fn finish(self) -> ObserverResults {
        ObserverResults {
            equity: self.value.samples,
            trades: self.trades.trades,
            orders: self.orders.orders,
            analysis: self.analyzer.finish(),
        }
    }
}

impl Observer for ObserverSet {
    fn on_order(&mut self, order: &Order, portfolio_value: f64) {
        for observer in self.all() {
            observer.on_order(order, portfolio_value);
        }
    }

    fn on_trade(&mut self, trade: &Trade, portfolio_value: f64) {
        for observer in self.all() {
            observer.on_trade(trade, portfolio_value);
        }
    }

    fn on_step(&mut self, time: NaiveDateTime, portfolio_value: f64) {
        for observer in self.all() {
            observer.on_step(time, portfolio_value);
        }
    }
}

/// Chronological observer output of one simulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverResults {
    pub equity: Vec<ValueSample>,
    pub trades: Vec<EventRecord>,
    pub orders: Vec<EventRecord>,
    pub analysis: TradeAnalysis,
}

pub(crate) fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::{Fill, OrderRequest};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_trade_counts() {
        let mut observers = ObserverSet::default();

        let mut winner = Trade::open(0, Side::Buy, dec!(1), dec!(100), at(1));
        observers.on_trade(&winner, 10_000.0);
        winner.add_commission(dec!(1));
        winner.reduce(dec!(1), dec!(10), at(2));
        observers.on_trade(&winner, 10_009.0);

        let mut loser = Trade::open(0, Side::Sell, dec!(1), dec!(100), at(3));
        observers.on_trade(&loser, 10_009.0);
        loser.add_commission(dec!(2));
        loser.reduce(dec!(1), dec!(1), at(4));
        observers.on_trade(&loser, 10_008.0);

        let still_open = Trade::open(0, Side::Buy, dec!(1), dec!(100), at(5));
        observers.on_trade(&still_open, 10_008.0);

        let results = observers.finish();
        assert_eq!(results.analysis.total, 3);
        assert_eq!(results.analysis.won, 1);
        assert_eq!(results.analysis.lost, 1);
        assert_eq!(results.analysis.open(), 1);
        assert_eq!(results.trades.len(), 2);
        assert_eq!(results.trades[1].side, Side::Sell);
        assert_eq!(results.trades[1].time, at(4));
    }

    #[test]
    fn test_only_completed_orders_are_recorded() {
        let mut observers = OrderObserver::default();
        let request = OrderRequest::market(0, Side::Buy);
        let mut order = Order::new(&request, dec!(2), at(1));
        order.status = OrderStatus::Margin;
        observers.on_order(&order, 10_000.0);
        assert!(observers.orders.is_empty());

        order.complete(&Fill {
            order_id: order.id,
            feed: 0,
            side: Side::Buy,
            quantity: dec!(2),
            price: dec!(50.5),
            commission: dec!(0.1),
            executed_at: at(2),
        });
        observers.on_order(&order, 9_999.9);
        assert_eq!(observers.orders.len(), 1);
        assert_eq!(observers.orders[0].price, 50.5);
        assert_eq!(observers.orders[0].time, at(2));
    }
}
