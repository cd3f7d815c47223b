// Interactive chart payload rebuilt from a stored run

use ax_types::{AxResult, Run, Side, StoreError, TIME_FORMAT};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePoint {
    pub time: i64,
    #[serde(rename = "type")]
    pub side: Side,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPoint {
    pub time: i64,
    #[serde(rename = "type")]
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

/// Chart feed with every timestamp in epoch seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartFeed {
    pub price_data: Vec<PricePoint>,
    pub portfolio_values: Vec<ValuePoint>,
    pub trade_data: Vec<TradePoint>,
    pub order_data: Vec<OrderPoint>,
}

impl ChartFeed {
    /// Build the feed from a run's stored snapshot and event streams.
    ///
    /// Prices come from the first stored feed. A run that never completed
    /// yields an empty feed.
    pub fn from_run(run: &Run) -> AxResult<Self> {
        let mut feed = ChartFeed::default();

        if let Some(prices) = run.price_snapshot.first() {
            for bar in &prices.bars {
                feed.price_data.push(PricePoint {
                    time: epoch_seconds(&bar.time)?,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                });
            }
        }

        for point in &run.events.equity_curve {
            feed.portfolio_values.push(ValuePoint {
                time: epoch_seconds(&point.time)?,
                value: point.portfolio_value,
            });
        }
        for trade in &run.events.trades {
            feed.trade_data.push(TradePoint {
                time: epoch_seconds(&trade.time)?,
                side: trade.side,
                price: trade.price,
            });
        }
        for order in &run.events.orders {
            feed.order_data.push(OrderPoint {
                time: epoch_seconds(&order.time)?,
                side: order.side,
                price: order.price,
                size: order.size,
            });
        }

        Ok(feed)
    }
}

/// Stored timestamps carry no zone; they are read as UTC.
pub fn epoch_seconds(time: &str) -> AxResult<i64> {
    NaiveDateTime::parse_from_str(time, TIME_FORMAT)
        .map(|parsed| parsed.and_utc().timestamp())
        .map_err(|err| {
            StoreError::Corrupt {
                message: format!("bad stored timestamp '{}': {}", time, err),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::{EquityPoint, FeedSnapshot, Interval, RunParameters, SnapshotBar, StrategySpec, TradeEvent};

    fn completed_run() -> Run {
        let strategy = StrategySpec::new("alice", "Cross", "", "class Cross(bt.Strategy): pass");
        let mut run = Run::new("alice", &strategy, RunParameters::default());
        run.price_snapshot = vec![FeedSnapshot {
            name: "BTC".to_string(),
            interval: Interval::Day,
            bars: vec![SnapshotBar {
                time: "2024-01-01 00:00:00".to_string(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 9.0,
            }],
        }];
        run.events.equity_curve.push(EquityPoint {
            time: "2024-01-01 00:00:00".to_string(),
            portfolio_value: 10_000.0,
        });
        run.events.orders.push(TradeEvent {
            time: "2024-01-02 12:00:00".to_string(),
            side: Side::Sell,
            price: 1.4,
            size: 2.5,
            portfolio_value: 10_010.0,
        });
        run
    }

    #[test]
    fn test_feed_uses_epoch_seconds() {
        let feed = ChartFeed::from_run(&completed_run()).unwrap();
        assert_eq!(feed.price_data[0].time, 1_704_067_200);
        assert_eq!(feed.portfolio_values[0].value, 10_000.0);
        assert_eq!(feed.order_data[0].time, 1_704_196_800);
        assert!(feed.trade_data.is_empty());
    }

    #[test]
    fn test_feed_json_shape() {
        let feed = ChartFeed::from_run(&completed_run()).unwrap();
        let json = serde_json::to_value(&feed).unwrap();
        assert!(json.get("priceData").is_some());
        assert!(json.get("portfolioValues").is_some());
        assert!(json.get("tradeData").is_some());
        assert_eq!(json["orderData"][0]["type"], "sell");
        assert_eq!(json["orderData"][0]["size"], 2.5);
    }

    #[test]
    fn test_bad_timestamp() {
        assert!(epoch_seconds("2024-01-01").is_err());
    }
}
