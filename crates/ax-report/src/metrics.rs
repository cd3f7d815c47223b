// Headline metrics and serialized event streams of a finished simulation

use ax_engine::{EventRecord, SimulationOutput};
use ax_types::{
    AxResult, EquityPoint, EventStreams, FeedSnapshot, LogLine, RunMetrics, RunOutcome, SnapshotBar, TradeEvent,
    TIME_FORMAT,
};
use rust_decimal::prelude::*;

use crate::summary::summary_text;

/// Everything a completed run stores, apart from the rendered chart
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedResults {
    pub metrics: RunMetrics,
    pub log_text: String,
    pub strategy_logs: Vec<String>,
    pub events: EventStreams,
    pub price_snapshot: Vec<FeedSnapshot>,
}

impl ExtractedResults {
    pub fn into_outcome(self, chart_png: Vec<u8>) -> RunOutcome {
        RunOutcome {
            metrics: self.metrics,
            log_text: self.log_text,
            strategy_logs: self.strategy_logs,
            events: self.events,
            price_snapshot: self.price_snapshot,
            chart_png,
        }
    }
}

/// Derive the run metrics from the simulation.
///
/// With no trades, win rate, Sharpe and return are all exactly zero.
pub fn compute_metrics(output: &SimulationOutput) -> RunMetrics {
    let analysis = &output.results.analysis;
    let total = analysis.total;
    let won = analysis.won;
    let initial = output.initial_cash;
    let final_value = output.handle.final_value;

    let win_rate_pct = if total == 0 {
        0.0
    } else {
        won as f64 / total as f64 * 100.0
    };
    let sharpe_ratio = if total == 0 {
        0.0
    } else {
        analysis.sharpe_ratio.filter(|s| s.is_finite()).unwrap_or(0.0)
    };
    let return_pct = if total == 0 || initial.is_zero() {
        0.0
    } else {
        ((final_value - initial) / initial * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    };

    RunMetrics {
        return_pct,
        win_rate_pct,
        sharpe_ratio,
        total_trades: total,
        won_trades: won,
        initial_value: initial.to_f64().unwrap_or(0.0),
        final_value: final_value.to_f64().unwrap_or(0.0),
    }
}

pub fn extract(output: &SimulationOutput, strategy_logs: &[LogLine]) -> AxResult<ExtractedResults> {
    let metrics = compute_metrics(output);
    let log_text = summary_text(&metrics, strategy_logs);
    let results = &output.results;

    let events = EventStreams {
        trades: results.trades.iter().map(trade_event).collect(),
        orders: results.orders.iter().map(trade_event).collect(),
        equity_curve: results
            .equity
            .iter()
            .map(|sample| EquityPoint {
                time: sample.time.format(TIME_FORMAT).to_string(),
                portfolio_value: sample.value,
            })
            .collect(),
    };

    let price_snapshot = output
        .handle
        .feeds
        .iter()
        .map(|feed| FeedSnapshot {
            name: feed.name.clone(),
            interval: feed.interval,
            bars: feed
                .rows
                .iter()
                .map(|row| SnapshotBar {
                    time: row.date.format(TIME_FORMAT).to_string(),
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                })
                .collect(),
        })
        .collect();

    Ok(ExtractedResults {
        metrics,
        log_text,
        strategy_logs: strategy_logs.iter().map(|line| line.to_string()).collect(),
        events,
        price_snapshot,
    })
}

fn trade_event(record: &EventRecord) -> TradeEvent {
    TradeEvent {
        time: record.time.format(TIME_FORMAT).to_string(),
        side: record.side,
        price: record.price,
        size: record.size,
        portfolio_value: record.portfolio_value,
    }
}
