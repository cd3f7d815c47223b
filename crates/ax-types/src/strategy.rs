use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::StrategyError;
use crate::market::{PriceRow, TIME_FORMAT};
use crate::orders::{Order, OrderId, OrderRequest};
use crate::portfolio::{Position, Trade};

/// Bars of one feed visible to the strategy at the current step
#[derive(Debug, Clone, Copy)]
pub struct FeedView<'a> {
    pub name: &'a str,
    /// Rows seen so far; the last one is the current bar.
    pub rows: &'a [PriceRow],
}

impl<'a> FeedView<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn current(&self) -> Option<&'a PriceRow> {
        self.rows.last()
    }

    /// Row `ago` bars back from the current one (`0` is the current bar).
    pub fn ago(&self, ago: usize) -> Option<&'a PriceRow> {
        self.rows.len().checked_sub(ago + 1).map(|i| &self.rows[i])
    }
}

/// Read-only view of the simulation handed to strategy callbacks
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub current_time: NaiveDateTime,
    pub bar_index: usize,
    pub feeds: &'a [FeedView<'a>],
    pub positions: &'a [Position],
    pub cash: Decimal,
    pub portfolio_value: Decimal,
}

impl<'a> StrategyContext<'a> {
    pub fn feed(&self, index: usize) -> Option<&FeedView<'a>> {
        self.feeds.get(index)
    }

    pub fn feed_index(&self, name: &str) -> Option<usize> {
        self.feeds.iter().position(|f| f.name == name)
    }

    pub fn position(&self, feed: usize) -> Option<&Position> {
        self.positions.get(feed)
    }

    pub fn current_price(&self, feed: usize) -> Option<f64> {
        self.feeds.get(feed)?.current().map(|row| row.close)
    }
}

/// Action requested by a strategy callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrategyAction {
    Submit(OrderRequest),
    Cancel { order_id: OrderId },
}

/// Declared strategy parameters, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters(Vec<(String, serde_json::Value)>);

impl StrategyParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0.iter().cloned().collect()
    }
}

/// One line written by a strategy through `log()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: NaiveDateTime,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format(TIME_FORMAT), self.text)
    }
}

/// Destination for strategy-authored log output
pub trait LogSink {
    fn emit(&self, line: LogLine);
}

impl LogSink for crossbeam_channel::Sender<LogLine> {
    fn emit(&self, line: LogLine) {
        // The receiving side may already be gone after a failed run
        let _ = self.send(line);
    }
}

/// Capability set the simulation engine drives, one instance per run
///
/// Callbacks return the orders they want placed or cancelled; the engine
/// applies them after the callback returns.
pub trait Strategy {
    fn name(&self) -> &str;

    fn parameters(&self) -> &StrategyParameters;

    /// Bars needed before `on_bar` is called; known after `on_start`.
    fn min_period(&self) -> usize {
        1
    }

    fn on_start(&mut self, _context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        Ok(Vec::new())
    }

    /// Called for bars before the minimum period is reached.
    fn on_prenext(&mut self, _context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError> {
        Ok(Vec::new())
    }

    fn on_bar(&mut self, context: &StrategyContext<'_>) -> Result<Vec<StrategyAction>, StrategyError>;

    fn on_order(
        &mut self,
        _order: &Order,
        _context: &StrategyContext<'_>,
    ) -> Result<Vec<StrategyAction>, StrategyError> {
        Ok(Vec::new())
    }

    fn on_trade(
        &mut self,
        _trade: &Trade,
        _context: &StrategyContext<'_>,
    ) -> Result<Vec<StrategyAction>, StrategyError> {
        Ok(Vec::new())
    }

    fn on_stop(&mut self, _context: &StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(day: u32, close: f64) -> PriceRow {
        let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(0, 0, 0).unwrap();
        PriceRow::new(date, close, close, close, close, 1.0)
    }

    #[test]
    fn test_feed_view_ago() {
        let rows = vec![row(1, 10.0), row(2, 11.0), row(3, 12.0)];
        let view = FeedView { name: "BTC", rows: &rows };
        assert_eq!(view.current().unwrap().close, 12.0);
        assert_eq!(view.ago(2).unwrap().close, 10.0);
        assert!(view.ago(3).is_none());
    }

    #[test]
    fn test_parameters_keep_declaration_order() {
        let mut params = StrategyParameters::new();
        params.insert("slow", serde_json::json!(30));
        params.insert("fast", serde_json::json!(10));
        params.insert("slow", serde_json::json!(50));
        let names: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["slow", "fast"]);
        assert_eq!(params.get("slow"), Some(&serde_json::json!(50)));
    }

    #[test]
    fn test_log_line_format_and_sink() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let line = LogLine {
            timestamp: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            text: "Something happened".to_string(),
        };
        tx.emit(line);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.to_string(), "2020-01-01 00:00:00 Something happened");
    }
}
