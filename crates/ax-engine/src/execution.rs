// Order execution against the next bar: slippage, commission and sizing

use ax_types::{Order, PriceRow, Side};
use rust_decimal::prelude::*;

/// Broker-side costs applied to every fill
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Percentage of notional charged per fill.
    pub commission_pct: Decimal,
    /// Adverse move applied to the open, in percent.
    pub slippage_pct: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            commission_pct: Decimal::new(1, 1), // 0.1%
            slippage_pct: Decimal::ZERO,
        }
    }
}

/// Price and cost of a market order filled on one bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Execution {
    pub price: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Market orders fill at the bar's open, slipped against the order and
    /// capped to the bar's high/low range.
    pub fn fill_price(&self, side: Side, bar: &PriceRow) -> Option<Decimal> {
        let open = Decimal::from_f64(bar.open)?;
        let high = Decimal::from_f64(bar.high)?;
        let low = Decimal::from_f64(bar.low)?;
        let slip = self.config.slippage_pct / Decimal::ONE_HUNDRED;

        let price = match side {
            Side::Buy => (open * (Decimal::ONE + slip)).min(high.max(open)),
            Side::Sell => (open * (Decimal::ONE - slip)).max(low.min(open)),
        };
        Some(price)
    }

    pub fn commission(&self, size: Decimal, price: Decimal) -> Decimal {
        size.abs() * price * self.config.commission_pct / Decimal::ONE_HUNDRED
    }

    pub fn execute(&self, order: &Order, bar: &PriceRow) -> Option<Execution> {
        let price = self.fill_price(order.side, bar)?;
        Some(Execution {
            price,
            commission: self.commission(order.size, price),
        })
    }
}

/// Percent-of-equity sizer
#[derive(Debug, Clone, PartialEq)]
pub struct PercentSizer {
    pub percent: Decimal,
}

impl Default for PercentSizer {
    fn default() -> Self {
        Self {
            percent: Decimal::from(95),
        }
    }
}

impl PercentSizer {
    pub fn new(percent: Decimal) -> Self {
        Self { percent }
    }

    /// Size for a market order without an explicit size.
    ///
    /// An order against an open position defaults to closing it; otherwise
    /// the size is `equity × percent × leverage / close`, rounded to 8 dp.
    pub fn size(&self, side: Side, position: Decimal, equity: Decimal, close: Decimal, leverage: Decimal) -> Decimal {
        let opposite = match side {
            Side::Buy => position < Decimal::ZERO,
            Side::Sell => position > Decimal::ZERO,
        };
        if opposite {
            return position.abs();
        }
        if close <= Decimal::ZERO || equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (equity * self.percent / Decimal::ONE_HUNDRED * leverage / close).round_dp(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn bar(open: f64, high: f64, low: f64) -> PriceRow {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        PriceRow::new(date, open, high, low, open, 1.0)
    }

    #[test]
    fn test_slippage_is_capped_to_bar_range() {
        let engine = ExecutionEngine::new(ExecutionConfig {
            commission_pct: dec!(0.1),
            slippage_pct: dec!(1),
        });
        assert_eq!(engine.fill_price(Side::Buy, &bar(100.0, 105.0, 95.0)), Some(dec!(101)));
        assert_eq!(engine.fill_price(Side::Sell, &bar(100.0, 105.0, 95.0)), Some(dec!(99)));
        assert_eq!(engine.fill_price(Side::Buy, &bar(100.0, 100.5, 95.0)), Some(dec!(100.5)));
        assert_eq!(engine.fill_price(Side::Sell, &bar(100.0, 105.0, 99.5)), Some(dec!(99.5)));
    }

    #[test]
    fn test_commission_is_percent_of_notional() {
        let engine = ExecutionEngine::default();
        assert_eq!(engine.commission(dec!(-2), dec!(50)), dec!(0.1));
    }

    #[test]
    fn test_percent_sizer() {
        let sizer = PercentSizer::default();
        assert_eq!(sizer.size(Side::Buy, dec!(0), dec!(10000), dec!(100), dec!(1)), dec!(95));
        assert_eq!(sizer.size(Side::Buy, dec!(0), dec!(10000), dec!(3), dec!(2)), dec!(6333.33333333));
        // Opposite side closes the open position
        assert_eq!(sizer.size(Side::Sell, dec!(1.5), dec!(10000), dec!(100), dec!(1)), dec!(1.5));
        assert_eq!(sizer.size(Side::Buy, dec!(-0.25), dec!(10000), dec!(100), dec!(1)), dec!(0.25));
        // Same side sizes from equity
        assert_eq!(sizer.size(Side::Sell, dec!(-1), dec!(10000), dec!(100), dec!(1)), dec!(95));
        assert_eq!(sizer.size(Side::Buy, dec!(0), dec!(-5), dec!(100), dec!(1)), dec!(0));
    }
}
