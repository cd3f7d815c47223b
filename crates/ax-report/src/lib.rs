//! Turns a finished simulation into what a completed run stores: metrics,
//! the summary log, serialized event streams, the chart and its feed.

pub mod chart;
pub mod feed;
pub mod metrics;
pub mod summary;

pub use chart::{render_png, ChartConfig, MAX_CHART_DIMENSION};
pub use feed::{epoch_seconds, ChartFeed};
pub use metrics::{compute_metrics, extract, ExtractedResults};
pub use summary::{summary_text, NO_TRADES_SUMMARY};

use ax_engine::SimulationOutput;
use ax_types::{AxResult, LogLine, RunOutcome};

/// Extract results and render the chart in one pass.
pub fn build_outcome(
    output: &SimulationOutput,
    strategy_logs: &[LogLine],
    chart: &ChartConfig,
) -> AxResult<RunOutcome> {
    let extracted = extract(output, strategy_logs)?;
    let png = render_png(output, chart)?;
    Ok(extracted.into_outcome(png))
}
