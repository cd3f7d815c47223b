// Technical indicators exposed as bt.indicators
// Values are computed lazily per bar and cached; rows never change once revealed.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{BinOp, CmpOp};
use crate::runtime::{LineField, Market};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorKind {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Highest(usize),
    Lowest(usize),
    StdDev(usize),
    CrossOver,
    /// Lazy `a op b` built from line arithmetic in `__init__`
    Arith(BinOp),
    Compare(CmpOp),
    Neg,
}

/// Indicator constructor as reachable from scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorClass {
    Sma,
    Ema,
    Rsi,
    Highest,
    Lowest,
    StdDev,
    CrossOver,
}

impl IndicatorClass {
    pub fn lookup(name: &str) -> Option<IndicatorClass> {
        Some(match name {
            "SMA" | "SimpleMovingAverage" | "MovingAverageSimple" => IndicatorClass::Sma,
            "EMA" | "ExponentialMovingAverage" | "MovingAverageExponential" => IndicatorClass::Ema,
            "RSI" | "RelativeStrengthIndex" => IndicatorClass::Rsi,
            "Highest" | "MaxN" => IndicatorClass::Highest,
            "Lowest" | "MinN" => IndicatorClass::Lowest,
            "StdDev" | "StandardDeviation" => IndicatorClass::StdDev,
            "CrossOver" => IndicatorClass::CrossOver,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndicatorClass::Sma => "SMA",
            IndicatorClass::Ema => "EMA",
            IndicatorClass::Rsi => "RSI",
            IndicatorClass::Highest => "Highest",
            IndicatorClass::Lowest => "Lowest",
            IndicatorClass::StdDev => "StdDev",
            IndicatorClass::CrossOver => "CrossOver",
        }
    }

    /// Default period; `None` means the caller must pass one.
    pub fn default_period(&self) -> Option<usize> {
        match self {
            IndicatorClass::Sma | IndicatorClass::Ema => Some(30),
            IndicatorClass::Rsi => Some(14),
            IndicatorClass::StdDev => Some(20),
            IndicatorClass::Highest | IndicatorClass::Lowest | IndicatorClass::CrossOver => None,
        }
    }

    pub fn inputs(&self) -> usize {
        match self {
            IndicatorClass::CrossOver => 2,
            _ => 1,
        }
    }

    pub fn kind(&self, period: usize) -> IndicatorKind {
        match self {
            IndicatorClass::Sma => IndicatorKind::Sma(period),
            IndicatorClass::Ema => IndicatorKind::Ema(period),
            IndicatorClass::Rsi => IndicatorKind::Rsi(period),
            IndicatorClass::Highest => IndicatorKind::Highest(period),
            IndicatorClass::Lowest => IndicatorKind::Lowest(period),
            IndicatorClass::StdDev => IndicatorKind::StdDev(period),
            IndicatorClass::CrossOver => IndicatorKind::CrossOver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineRef {
    pub feed: usize,
    pub field: LineField,
}

#[derive(Debug, Clone)]
pub enum Source {
    Line(LineRef),
    Indicator(Rc<Indicator>),
    Const(f64),
}

impl Source {
    pub fn value_at(&self, index: usize, market: &Market) -> Option<f64> {
        match self {
            Source::Line(line) => market.row(line.feed, index).map(|row| line.field.read(row)),
            Source::Indicator(ind) => ind.value_at(index, market),
            Source::Const(value) => Some(*value),
        }
    }

    pub fn min_period(&self) -> usize {
        match self {
            Source::Line(_) | Source::Const(_) => 1,
            Source::Indicator(ind) => ind.min_period,
        }
    }

    pub fn feed(&self) -> Option<usize> {
        match self {
            Source::Line(line) => Some(line.feed),
            Source::Indicator(ind) => Some(ind.feed),
            Source::Const(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    value: f64,
    // Running averages for smoothed indicators (RSI gain/loss)
    a: f64,
    b: f64,
}

impl Point {
    fn plain(value: f64) -> Self {
        Self { value, a: 0.0, b: 0.0 }
    }
}

#[derive(Debug)]
pub struct Indicator {
    pub kind: IndicatorKind,
    pub name: String,
    pub inputs: Vec<Source>,
    /// Feed whose clock indexes this indicator
    pub feed: usize,
    /// Bars needed before the first value exists
    pub min_period: usize,
    cache: RefCell<Vec<Option<Point>>>,
}

impl Indicator {
    pub fn new(kind: IndicatorKind, name: impl Into<String>, inputs: Vec<Source>) -> Self {
        let input_min = inputs.iter().map(Source::min_period).max().unwrap_or(1);
        let min_period = match kind {
            IndicatorKind::Sma(p)
            | IndicatorKind::Ema(p)
            | IndicatorKind::Highest(p)
            | IndicatorKind::Lowest(p)
            | IndicatorKind::StdDev(p) => input_min + p - 1,
            IndicatorKind::Rsi(p) => input_min + p,
            IndicatorKind::CrossOver => input_min + 1,
            IndicatorKind::Arith(_) | IndicatorKind::Compare(_) | IndicatorKind::Neg => input_min,
        };
        let feed = inputs.iter().find_map(Source::feed).unwrap_or(0);
        Self {
            kind,
            name: name.into(),
            inputs,
            feed,
            min_period,
            cache: RefCell::new(Vec::new()),
        }
    }

    /// Value at an absolute bar index of the indicator's feed.
    pub fn value_at(&self, index: usize, market: &Market) -> Option<f64> {
        if index >= market.feed_len(self.feed) {
            return None;
        }
        let mut cache = self.cache.borrow_mut();
        while cache.len() <= index {
            let i = cache.len();
            let point = self.compute(i, &cache, market);
            cache.push(point);
        }
        cache[index].map(|p| p.value)
    }

    /// Value `ago` bars back from the current one; NaN before the minimum period.
    pub fn current(&self, ago: i64, market: &Market) -> f64 {
        market
            .index_for(self.feed, ago)
            .and_then(|i| self.value_at(i, market))
            .unwrap_or(f64::NAN)
    }

    fn input(&self, n: usize, index: usize, market: &Market) -> Option<f64> {
        self.inputs.get(n)?.value_at(index, market)
    }

    fn window(&self, index: usize, period: usize, market: &Market) -> Option<Vec<f64>> {
        if period == 0 || index + 1 < period {
            return None;
        }
        (index + 1 - period..=index).map(|j| self.input(0, j, market)).collect()
    }

    fn compute(&self, i: usize, cache: &[Option<Point>], market: &Market) -> Option<Point> {
        let prev = if i > 0 { cache[i - 1] } else { None };
        match self.kind {
            IndicatorKind::Sma(p) => {
                let w = self.window(i, p, market)?;
                Some(Point::plain(mean(&w)))
            }
            IndicatorKind::Ema(p) => {
                let alpha = 2.0 / (p as f64 + 1.0);
                match prev {
                    Some(prev) => {
                        let x = self.input(0, i, market)?;
                        Some(Point::plain(alpha * x + (1.0 - alpha) * prev.value))
                    }
                    // Seeded with the simple average of the first full window
                    None => self.window(i, p, market).map(|w| Point::plain(mean(&w))),
                }
            }
            IndicatorKind::Rsi(p) => self.rsi(i, p, prev, market),
            IndicatorKind::Highest(p) => {
                let w = self.window(i, p, market)?;
                Some(Point::plain(w.into_iter().fold(f64::NEG_INFINITY, f64::max)))
            }
            IndicatorKind::Lowest(p) => {
                let w = self.window(i, p, market)?;
                Some(Point::plain(w.into_iter().fold(f64::INFINITY, f64::min)))
            }
            IndicatorKind::StdDev(p) => {
                let w = self.window(i, p, market)?;
                let m = mean(&w);
                let var = w.iter().map(|x| (x - m).powi(2)).sum::<f64>() / w.len() as f64;
                Some(Point::plain(var.sqrt()))
            }
            IndicatorKind::CrossOver => {
                if i == 0 {
                    return None;
                }
                let (a, b) = (self.input(0, i, market)?, self.input(1, i, market)?);
                let (pa, pb) = (self.input(0, i - 1, market)?, self.input(1, i - 1, market)?);
                let value = if pa < pb && a > b {
                    1.0
                } else if pa > pb && a < b {
                    -1.0
                } else {
                    0.0
                };
                Some(Point::plain(value))
            }
            IndicatorKind::Arith(op) => {
                let (a, b) = (self.input(0, i, market)?, self.input(1, i, market)?);
                let value = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div if b != 0.0 => a / b,
                    BinOp::FloorDiv if b != 0.0 => (a / b).floor(),
                    BinOp::Mod if b != 0.0 => a - b * (a / b).floor(),
                    BinOp::Pow => a.powf(b),
                    _ => return None,
                };
                Some(Point::plain(value))
            }
            IndicatorKind::Compare(op) => {
                let (a, b) = (self.input(0, i, market)?, self.input(1, i, market)?);
                let truth = match op {
                    CmpOp::Lt => a < b,
                    CmpOp::LtE => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::GtE => a >= b,
                    CmpOp::Eq => a == b,
                    CmpOp::NotEq => a != b,
                    _ => return None,
                };
                Some(Point::plain(if truth { 1.0 } else { 0.0 }))
            }
            IndicatorKind::Neg => self.input(0, i, market).map(|x| Point::plain(-x)),
        }
    }

    /// Wilder-smoothed relative strength index
    fn rsi(&self, i: usize, period: usize, prev: Option<Point>, market: &Market) -> Option<Point> {
        if i == 0 || period == 0 {
            return None;
        }
        let diff = |j: usize| -> Option<f64> { Some(self.input(0, j, market)? - self.input(0, j - 1, market)?) };

        let (avg_gain, avg_loss) = match prev {
            Some(prev) => {
                let d = diff(i)?;
                let p = period as f64;
                (
                    (prev.a * (p - 1.0) + d.max(0.0)) / p,
                    (prev.b * (p - 1.0) + (-d).max(0.0)) / p,
                )
            }
            None => {
                if i < period {
                    return None;
                }
                let diffs: Vec<f64> = (i + 1 - period..=i).map(diff).collect::<Option<_>>()?;
                let gains = diffs.iter().map(|d| d.max(0.0)).sum::<f64>() / period as f64;
                let losses = diffs.iter().map(|d| (-d).max(0.0)).sum::<f64>() / period as f64;
                (gains, losses)
            }
        };

        let value = if avg_loss == 0.0 {
            if avg_gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
        Some(Point {
            value,
            a: avg_gain,
            b: avg_loss,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MirrorFeed;
    use ax_types::PriceRow;
    use chrono::{Duration, NaiveDate};

    fn market(closes: &[f64]) -> Market {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let rows = closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceRow::new(start + Duration::days(i as i64), *c, *c, *c, *c, 1.0))
            .collect();
        Market {
            feeds: vec![MirrorFeed {
                name: "BTC".to_string(),
                rows,
            }],
            ..Market::default()
        }
    }

    fn close() -> Source {
        Source::Line(LineRef {
            feed: 0,
            field: LineField::Close,
        })
    }

    #[test]
    fn test_sma_and_min_period() {
        let m = market(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let sma = Indicator::new(IndicatorKind::Sma(3), "SMA", vec![close()]);
        assert_eq!(sma.min_period, 3);
        assert_eq!(sma.value_at(1, &m), None);
        assert_eq!(sma.value_at(2, &m), Some(2.0));
        assert_eq!(sma.current(0, &m), 4.0);
        assert_eq!(sma.current(-1, &m), 3.0);
        assert!(sma.current(-3, &m).is_nan());
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let m = market(&[1.0, 2.0, 3.0, 4.0]);
        let ema = Indicator::new(IndicatorKind::Ema(3), "EMA", vec![close()]);
        assert_eq!(ema.value_at(2, &m), Some(2.0));
        // alpha = 0.5
        assert_eq!(ema.value_at(3, &m), Some(3.0));
    }

    #[test]
    fn test_rsi_bounds() {
        let rising = market(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let rsi = Indicator::new(IndicatorKind::Rsi(3), "RSI", vec![close()]);
        assert_eq!(rsi.min_period, 4);
        assert_eq!(rsi.value_at(2, &rising), None);
        assert_eq!(rsi.value_at(3, &rising), Some(100.0));

        let mixed = market(&[10.0, 11.0, 10.0, 11.0, 10.0]);
        let rsi = Indicator::new(IndicatorKind::Rsi(2), "RSI", vec![close()]);
        let value = rsi.value_at(4, &mixed).unwrap();
        assert!(value > 0.0 && value < 100.0);
    }

    #[test]
    fn test_crossover_signals() {
        let m = market(&[1.0, 3.0, 5.0, 3.0, 1.0]);
        let fast = Rc::new(Indicator::new(IndicatorKind::Sma(1), "SMA", vec![close()]));
        let cross = Indicator::new(IndicatorKind::CrossOver, "CrossOver", vec![Source::Indicator(fast), Source::Const(2.0)]);
        assert_eq!(cross.min_period, 2);
        assert_eq!(cross.value_at(0, &m), None);
        assert_eq!(cross.value_at(1, &m), Some(1.0));
        assert_eq!(cross.value_at(2, &m), Some(0.0));
        assert_eq!(cross.value_at(4, &m), Some(-1.0));
    }

    #[test]
    fn test_nested_min_period_and_window_extremes() {
        let m = market(&[4.0, 1.0, 3.0, 2.0, 6.0]);
        let sma = Rc::new(Indicator::new(IndicatorKind::Sma(2), "SMA", vec![close()]));
        let highest = Indicator::new(IndicatorKind::Highest(3), "Highest", vec![Source::Indicator(sma)]);
        assert_eq!(highest.min_period, 4);
        assert_eq!(highest.value_at(4, &m), Some(4.0));

        let lowest = Indicator::new(IndicatorKind::Lowest(3), "Lowest", vec![close()]);
        assert_eq!(lowest.value_at(3, &m), Some(1.0));

        let sd = Indicator::new(IndicatorKind::StdDev(2), "StdDev", vec![close()]);
        assert_eq!(sd.value_at(4, &m), Some(2.0));
    }

    #[test]
    fn test_lazy_arithmetic() {
        let m = market(&[2.0, 4.0]);
        let diff = Indicator::new(IndicatorKind::Arith(BinOp::Sub), "close - 1", vec![close(), Source::Const(1.0)]);
        assert_eq!(diff.current(0, &m), 3.0);
        let above = Indicator::new(IndicatorKind::Compare(CmpOp::Gt), "close > 3", vec![close(), Source::Const(3.0)]);
        assert_eq!(above.current(0, &m), 1.0);
        assert_eq!(above.current(-1, &m), 0.0);
    }
}
