use std::fmt::Write;

use ax_types::{LogLine, RunMetrics};

pub const NO_TRADES_SUMMARY: &str = "No trades were executed in this backtest.";

/// Human-readable summary stored as the run log.
pub fn summary_text(metrics: &RunMetrics, strategy_logs: &[LogLine]) -> String {
    if metrics.total_trades == 0 {
        return NO_TRADES_SUMMARY.to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "Performance Summary");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out, "Initial Portfolio Value: {}", money(metrics.initial_value));
    let _ = writeln!(out, "Final Portfolio Value:   {}", money(metrics.final_value));
    let _ = writeln!(
        out,
        "Profit/Loss:             {}",
        money(metrics.final_value - metrics.initial_value)
    );
    let _ = writeln!(out, "Return:                  {:.2}%", metrics.return_pct);
    let _ = writeln!(out, "Sharpe Ratio:            {:.2}", metrics.sharpe_ratio);
    let _ = writeln!(out, "Win Rate:                {:.2}%", metrics.win_rate_pct);
    let _ = writeln!(out, "Total Trades:            {}", metrics.total_trades);
    let _ = write!(out, "Won Trades:              {}", metrics.won_trades);

    if !strategy_logs.is_empty() {
        out.push_str("\n\nStrategy Log\n============");
        for line in strategy_logs {
            let _ = write!(out, "\n{}", line);
        }
    }
    out
}

/// `$1,234.57`, sign after the currency symbol.
fn money(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (whole, cents) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if value < 0.0 && formatted != "0.00" { "-" } else { "" };
    format!("${}{}.{}", sign, grouped, cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn metrics(total: u64) -> RunMetrics {
        RunMetrics {
            return_pct: 10.0,
            win_rate_pct: 50.0,
            sharpe_ratio: 1.234,
            total_trades: total,
            won_trades: total / 2,
            initial_value: 10_000.0,
            final_value: 11_000.0,
        }
    }

    #[test]
    fn test_no_trades_text_is_exact() {
        let logs = vec![LogLine {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            text: "ignored".to_string(),
        }];
        assert_eq!(summary_text(&metrics(0), &logs), "No trades were executed in this backtest.");
    }

    #[test]
    fn test_performance_summary() {
        let logs = vec![LogLine {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            text: "BUY EXECUTED, 42.00".to_string(),
        }];
        let text = summary_text(&metrics(4), &logs);
        let expected = "Performance Summary\n\
                        ===================\n\
                        Initial Portfolio Value: $10,000.00\n\
                        Final Portfolio Value:   $11,000.00\n\
                        Profit/Loss:             $1,000.00\n\
                        Return:                  10.00%\n\
                        Sharpe Ratio:            1.23\n\
                        Win Rate:                50.00%\n\
                        Total Trades:            4\n\
                        Won Trades:              2\n\
                        \n\
                        Strategy Log\n\
                        ============\n\
                        2024-01-02 00:00:00 BUY EXECUTED, 42.00";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_money_grouping() {
        assert_eq!(money(0.0), "$0.00");
        assert_eq!(money(999.999), "$1,000.00");
        assert_eq!(money(1234567.891), "$1,234,567.89");
        assert_eq!(money(-250.5), "$-250.50");
        assert_eq!(money(-0.001), "$0.00");
    }
}
