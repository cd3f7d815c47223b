// PNG rendering of a finished simulation: candles with order markers above,
// portfolio value below. Nothing here draws text, so no font backend is needed.

use std::fmt::Display;
use std::ops::Range;

use ax_engine::SimulationOutput;
use ax_types::{AxError, AxResult, BacktestError, Side};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PRICE_PANEL_SHARE: f64 = 0.7;
const MARKER_SIZE: i32 = 6;

/// Largest chart edge, in pixels
pub const MAX_CHART_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
        }
    }
}

/// Render the run chart and return the encoded PNG bytes.
///
/// Candles of the first feed are laid out on a bar-index axis; completed
/// orders on that feed become triangles at their fill price.
pub fn render_png(output: &SimulationOutput, config: &ChartConfig) -> AxResult<Vec<u8>> {
    if config.width == 0 || config.height == 0 {
        return Err(AxError::InvalidParameter {
            parameter: "chart".to_string(),
            message: format!("chart size {}x{} is empty", config.width, config.height),
        });
    }
    if config.width > MAX_CHART_DIMENSION || config.height > MAX_CHART_DIMENSION {
        return Err(AxError::InvalidParameter {
            parameter: "chart".to_string(),
            message: format!(
                "chart size {}x{} exceeds {} pixels per edge",
                config.width, config.height, MAX_CHART_DIMENSION
            ),
        });
    }

    let (width, height) = (config.width, config.height);
    let mut pixels = vec![0u8; width as usize * height as usize * 3];
    draw(output, &mut pixels, width, height)?;

    let encoded = encode(&pixels, width, height)?;
    debug!(width, height, bytes = encoded.len(), "rendered run chart");
    Ok(encoded)
}

fn draw(output: &SimulationOutput, pixels: &mut [u8], width: u32, height: u32) -> AxResult<()> {
    let root = BitMapBackend::with_buffer(pixels, (width, height)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_error)?;

    let split = ((height as f64) * PRICE_PANEL_SHARE) as u32;
    let (upper, lower) = root.split_vertically(split);

    if let Some(feed) = output.handle.feeds.first() {
        let rows = &feed.rows;
        let lows = rows.iter().map(|row| row.low);
        let highs = rows.iter().map(|row| row.high);
        let y_range = padded_range(lows.chain(highs));
        let x_range = -1.0..rows.len() as f64;

        let mut chart = ChartBuilder::on(&upper)
            .margin(10)
            .build_cartesian_2d(x_range, y_range)
            .map_err(chart_error)?;

        let plot_width = width.saturating_sub(20) as usize;
        let candle_width = (plot_width / rows.len().max(1)).clamp(1, 12) as u32;
        chart
            .draw_series(rows.iter().enumerate().map(|(i, row)| {
                CandleStick::new(
                    i as f64,
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    GREEN.filled(),
                    RED.filled(),
                    candle_width,
                )
            }))
            .map_err(chart_error)?;

        let markers = output
            .results
            .orders
            .iter()
            .filter(|order| order.feed == 0)
            .filter_map(|order| {
                let index = rows.partition_point(|row| row.date < order.time);
                let color = match order.side {
                    Side::Buy => BLUE,
                    Side::Sell => MAGENTA,
                };
                (index < rows.len()).then(|| (index as f64, order.price, color))
            });
        chart
            .draw_series(markers.map(|(x, y, color)| TriangleMarker::new((x, y), MARKER_SIZE, color.filled())))
            .map_err(chart_error)?;
    }

    let equity = &output.results.equity;
    if !equity.is_empty() {
        let y_range = padded_range(equity.iter().map(|sample| sample.value));
        let mut chart = ChartBuilder::on(&lower)
            .margin(10)
            .build_cartesian_2d(0.0..(equity.len().max(2) - 1) as f64, y_range)
            .map_err(chart_error)?;
        chart
            .draw_series(LineSeries::new(
                equity.iter().enumerate().map(|(i, sample)| (i as f64, sample.value)),
                &BLACK,
            ))
            .map_err(chart_error)?;
    }

    root.present().map_err(chart_error)?;
    Ok(())
}

fn encode(pixels: &[u8], width: u32, height: u32) -> AxResult<Vec<u8>> {
    let mut encoded = Vec::new();
    let mut encoder = png::Encoder::new(&mut encoded, width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(chart_error)?;
    writer.write_image_data(pixels).map_err(chart_error)?;
    writer.finish().map_err(chart_error)?;
    Ok(encoded)
}

/// Value range with 5% headroom; flat or empty series still get a usable span.
fn padded_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return 0.0..1.0;
    }
    let span = hi - lo;
    let pad = if span > f64::EPSILON { span * 0.05 } else { lo.abs().max(1.0) * 0.05 };
    (lo - pad)..(hi + pad)
}

fn chart_error<E: Display>(err: E) -> AxError {
    BacktestError::ResultsProcessing {
        message: format!("chart rendering failed: {}", err),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_engine::{EngineHandle, EventRecord, ObserverResults, SimFeed, TradeAnalysis, ValueSample};
    use ax_types::{Interval, PriceRow};
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;

    const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn output(days: u32) -> SimulationOutput {
        let rows = (1..=days)
            .map(|d| {
                let base = 100.0 + d as f64;
                PriceRow::new(at(d), base, base + 2.0, base - 2.0, base + 1.0, 50.0)
            })
            .collect::<Vec<_>>();
        let equity = (1..=days)
            .map(|d| ValueSample {
                time: at(d),
                value: 10_000.0 + d as f64 * 10.0,
            })
            .collect();
        SimulationOutput {
            handle: EngineHandle {
                strategy_name: "Cross".to_string(),
                feeds: vec![SimFeed {
                    name: "BTC".to_string(),
                    interval: Interval::Day,
                    rows,
                }],
                steps: days as usize,
                final_value: dec!(10100),
                final_cash: dec!(10100),
                total_commissions: dec!(0),
            },
            results: ObserverResults {
                equity,
                trades: Vec::new(),
                orders: vec![EventRecord {
                    time: at(2),
                    feed: 0,
                    side: Side::Buy,
                    price: 102.0,
                    size: 1.0,
                    portfolio_value: 10_020.0,
                }],
                analysis: TradeAnalysis::default(),
            },
            initial_cash: dec!(10000),
        }
    }

    #[test]
    fn test_renders_png() {
        let config = ChartConfig {
            width: 320,
            height: 200,
        };
        let png = render_png(&output(10), &config).unwrap();
        assert_eq!(png[..8], PNG_SIGNATURE);
        // IHDR carries the dimensions big-endian right after the chunk header.
        assert_eq!(u32::from_be_bytes([png[16], png[17], png[18], png[19]]), 320);
        assert_eq!(u32::from_be_bytes([png[20], png[21], png[22], png[23]]), 200);
    }

    #[test]
    fn test_flat_single_bar_still_renders() {
        let mut flat = output(1);
        flat.results.equity.truncate(1);
        let png = render_png(&flat, &ChartConfig::default()).unwrap();
        assert_eq!(png[..8], PNG_SIGNATURE);
    }

    #[test]
    fn test_empty_size_rejected() {
        let config = ChartConfig { width: 0, height: 10 };
        assert!(matches!(
            render_png(&output(3), &config),
            Err(AxError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_oversized_chart_rejected() {
        for config in [
            ChartConfig { width: 100_000, height: 800 },
            ChartConfig { width: 1200, height: u32::MAX },
        ] {
            assert!(matches!(
                render_png(&output(3), &config),
                Err(AxError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn test_padded_range() {
        let range = padded_range([1.0, 3.0].into_iter());
        assert!((range.start - 0.9).abs() < 1e-9);
        assert!((range.end - 3.1).abs() < 1e-9);
        assert_eq!(padded_range(std::iter::empty()), 0.0..1.0);
        let flat = padded_range([200.0].into_iter());
        assert!(flat.start < 200.0 && flat.end > 200.0);
    }
}
