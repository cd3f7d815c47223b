// Bar-by-bar simulation over the merged clock of all feeds

use std::collections::{BTreeSet, HashMap};

use ax_types::{
    invalid_parameter, AxError, AxResult, BacktestError, FeedView, Fill, Interval, Order, OrderStatus, Portfolio,
    PositionUpdate, PriceRow, PriceSeries, Strategy, StrategyAction, StrategyContext, StrategyError, Trade,
};
use chrono::NaiveDateTime;
use rust_decimal::prelude::*;
use tracing::{debug, info};

use crate::execution::{ExecutionConfig, ExecutionEngine, PercentSizer};
use crate::observers::{to_f64, Observer, ObserverSet};
use crate::{EngineHandle, SimulationOutput};

/// Broker and sizer settings of one simulation
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub initial_cash: Decimal,
    pub sizer_percent: Decimal,
    pub commission_pct: Decimal,
    pub slippage_pct: Decimal,
    pub leverage: Decimal,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(10_000),
            sizer_percent: Decimal::from(95),
            commission_pct: Decimal::ZERO,
            slippage_pct: Decimal::ZERO,
            leverage: Decimal::ONE,
        }
    }
}

impl EngineSettings {
    pub fn new(commission_pct: f64, slippage_pct: f64, leverage: f64) -> AxResult<Self> {
        let commission_pct = non_negative("commission_pct", commission_pct)?;
        let slippage_pct = non_negative("slippage_pct", slippage_pct)?;
        let leverage = Decimal::from_f64(leverage)
            .filter(|l| *l >= Decimal::ONE)
            .ok_or_else(|| invalid_parameter!("leverage", "must be at least 1, got {}", leverage))?;
        Ok(Self {
            commission_pct,
            slippage_pct,
            leverage,
            ..Self::default()
        })
    }

    pub fn with_initial_cash(mut self, initial_cash: Decimal) -> Self {
        self.initial_cash = initial_cash;
        self
    }

    pub fn with_sizer_percent(mut self, percent: Decimal) -> Self {
        self.sizer_percent = percent;
        self
    }
}

fn non_negative(name: &str, value: f64) -> AxResult<Decimal> {
    Decimal::from_f64(value)
        .filter(|v| !v.is_sign_negative())
        .ok_or_else(|| invalid_parameter!(name, "must be a non-negative percentage, got {}", value))
}

/// Price feed as exposed to the strategy, under its unique name
#[derive(Debug, Clone, PartialEq)]
pub struct SimFeed {
    pub name: String,
    pub interval: Interval,
    pub rows: Vec<PriceRow>,
}

/// Feed names follow the asset symbol; repeats get a `_<n>` suffix.
pub fn feed_names(series: &[PriceSeries]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    series
        .iter()
        .map(|s| {
            let count = seen.entry(s.asset.as_str()).or_insert(0);
            let name = if *count == 0 {
                s.asset.clone()
            } else {
                format!("{}_{}", s.asset, count)
            };
            *count += 1;
            name
        })
        .collect()
}

enum Callback {
    Start,
    Prenext,
    Next,
    Order(Order),
    Trade(Trade),
    Stop,
}

enum Notification {
    Order(Order),
    Trade(Trade),
}

/// Simulated broker driving one strategy over a set of feeds
pub struct Engine<'s, S: Strategy + ?Sized> {
    settings: EngineSettings,
    strategy: &'s mut S,
    feeds: Vec<SimFeed>,
    timeline: Vec<NaiveDateTime>,
    execution: ExecutionEngine,
    sizer: PercentSizer,
    portfolio: Portfolio,
    pending: Vec<Order>,
    open_trades: Vec<Option<Trade>>,
    /// Rows of each feed revealed so far.
    visible: Vec<usize>,
    /// Last close per feed, used to mark the portfolio.
    marks: Vec<Decimal>,
    notifications: Vec<Notification>,
    observers: ObserverSet,
}

impl<'s, S: Strategy + ?Sized> Engine<'s, S> {
    pub fn new(series: &[PriceSeries], strategy: &'s mut S, settings: EngineSettings) -> AxResult<Self> {
        if series.is_empty() {
            return Err(BacktestError::NoFeeds.into());
        }
        if let Some(empty) = series.iter().find(|s| s.is_empty()) {
            return Err(BacktestError::Simulation {
                message: format!("price feed '{}' has no bars", empty.asset),
                trace: String::new(),
            }
            .into());
        }

        let feeds: Vec<SimFeed> = feed_names(series)
            .into_iter()
            .zip(series)
            .map(|(name, s)| SimFeed {
                name,
                interval: s.interval,
                rows: s.rows().to_vec(),
            })
            .collect();
        let timeline: Vec<NaiveDateTime> = feeds
            .iter()
            .flat_map(|f| f.rows.iter().map(|r| r.date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let n = feeds.len();
        Ok(Self {
            execution: ExecutionEngine::new(ExecutionConfig {
                commission_pct: settings.commission_pct,
                slippage_pct: settings.slippage_pct,
            }),
            sizer: PercentSizer::new(settings.sizer_percent),
            portfolio: Portfolio::new(settings.initial_cash, n),
            settings,
            strategy,
            feeds,
            timeline,
            pending: Vec::new(),
            open_trades: vec![None; n],
            visible: vec![0; n],
            marks: vec![Decimal::ZERO; n],
            notifications: Vec::new(),
            observers: ObserverSet::default(),
        })
    }

    pub fn feeds(&self) -> &[SimFeed] {
        &self.feeds
    }

    /// Run the simulation to the end of the merged clock.
    pub fn run(mut self) -> AxResult<SimulationOutput> {
        let timeline = std::mem::take(&mut self.timeline);
        let (Some(&first), Some(&last)) = (timeline.first(), timeline.last()) else {
            return Err(BacktestError::NoFeeds.into());
        };
        info!(
            strategy = %self.strategy.name(),
            feeds = self.feeds.len(),
            steps = timeline.len(),
            "Starting simulation"
        );

        self.dispatch(Callback::Start, first, 0)?;
        let min_period = self.strategy.min_period().max(1);

        for (step, &time) in timeline.iter().enumerate() {
            let fresh = self.advance(time);
            self.execute_pending(time, &fresh)?;
            for ((feed, &seen), mark) in self.feeds.iter().zip(&self.visible).zip(self.marks.iter_mut()) {
                if let Some(close) = seen.checked_sub(1).and_then(|i| Decimal::from_f64(feed.rows[i].close)) {
                    *mark = close;
                }
            }
            self.deliver(time, step)?;

            if self.visible.iter().all(|&n| n >= min_period) {
                self.dispatch(Callback::Next, time, step)?;
            } else {
                self.dispatch(Callback::Prenext, time, step)?;
            }

            let value = to_f64(self.portfolio.value(&self.marks));
            self.observers.on_step(time, value);
        }

        let last_step = timeline.len() - 1;
        self.deliver(last, last_step)?;
        let expired = self.pending.len();
        for order in &mut self.pending {
            order.status = OrderStatus::Expired;
        }
        if expired > 0 {
            debug!(expired, "Pending orders expired at end of data");
        }
        self.dispatch(Callback::Stop, last, last_step)?;

        let final_value = self.portfolio.value(&self.marks);
        info!(
            final_value = %final_value.round_dp(2),
            commissions = %self.portfolio.total_commissions.round_dp(2),
            "Simulation finished"
        );

        Ok(SimulationOutput {
            handle: EngineHandle {
                strategy_name: self.strategy.name().to_string(),
                feeds: self.feeds,
                steps: timeline.len(),
                final_value,
                final_cash: self.portfolio.cash,
                total_commissions: self.portfolio.total_commissions,
            },
            results: self.observers.finish(),
            initial_cash: self.settings.initial_cash,
        })
    }

    /// Reveal the bars stamped `time`; returns which feeds got a new bar.
    fn advance(&mut self, time: NaiveDateTime) -> Vec<bool> {
        self.feeds
            .iter()
            .zip(self.visible.iter_mut())
            .map(|(feed, seen)| match feed.rows.get(*seen) {
                Some(row) if row.date <= time => {
                    *seen += 1;
                    true
                }
                _ => false,
            })
            .collect()
    }

    fn execute_pending(&mut self, time: NaiveDateTime, fresh: &[bool]) -> AxResult<()> {
        for mut order in std::mem::take(&mut self.pending) {
            if !fresh[order.feed] {
                self.pending.push(order);
                continue;
            }
            let bar = self.feeds[order.feed].rows[self.visible[order.feed] - 1];
            let Some(execution) = self.execution.execute(&order, &bar) else {
                order.status = OrderStatus::Rejected;
                self.notifications.push(Notification::Order(order));
                continue;
            };

            if order.is_buy() {
                let equity = self.portfolio.value(&self.marks);
                let cost = order.size * execution.price + execution.commission;
                let floor = -(self.settings.leverage - Decimal::ONE) * equity;
                if self.portfolio.cash - cost < floor {
                    debug!(order = %order.id, cost = %cost.round_dp(2), cash = %self.portfolio.cash.round_dp(2), "Order rejected for margin");
                    order.status = OrderStatus::Margin;
                    self.notifications.push(Notification::Order(order));
                    continue;
                }
            }

            let fill = Fill {
                order_id: order.id,
                feed: order.feed,
                side: order.side,
                quantity: order.size,
                price: execution.price,
                commission: execution.commission,
                executed_at: time,
            };
            let update = self.portfolio.apply_fill(&fill);
            order.complete(&fill);
            debug!(
                side = fill.side.as_str(),
                size = %fill.quantity,
                price = %fill.price,
                commission = %fill.commission,
                "Order filled"
            );
            self.notifications.push(Notification::Order(order));
            self.update_trades(&fill, update, time);
        }
        Ok(())
    }

    fn update_trades(&mut self, fill: &Fill, update: PositionUpdate, time: NaiveDateTime) {
        let share = |quantity: Decimal| {
            if fill.quantity.is_zero() {
                Decimal::ZERO
            } else {
                fill.commission * quantity / fill.quantity
            }
        };
        let slot = &mut self.open_trades[fill.feed];

        if update.closed > Decimal::ZERO {
            if let Some(mut trade) = slot.take() {
                trade.add_commission(share(update.closed));
                trade.reduce(update.closed, update.realized_pnl, time);
                if trade.is_open() {
                    *slot = Some(trade);
                } else {
                    self.notifications.push(Notification::Trade(trade));
                }
            }
        }

        if update.opened > Decimal::ZERO {
            match slot.as_mut() {
                Some(trade) => {
                    trade.increase(update.opened, fill.price);
                    trade.add_commission(share(update.opened));
                }
                None => {
                    let mut trade = Trade::open(fill.feed, fill.side, update.opened, fill.price, time);
                    trade.add_commission(share(update.opened));
                    self.notifications.push(Notification::Trade(trade.clone()));
                    *slot = Some(trade);
                }
            }
        }
    }

    /// Hand queued notifications to the observers and the strategy. Callbacks
    /// may queue more (cancellations), so this drains until empty.
    fn deliver(&mut self, time: NaiveDateTime, step: usize) -> AxResult<()> {
        while !self.notifications.is_empty() {
            let value = to_f64(self.portfolio.value(&self.marks));
            for notification in std::mem::take(&mut self.notifications) {
                match notification {
                    Notification::Order(order) => {
                        self.observers.on_order(&order, value);
                        self.dispatch(Callback::Order(order), time, step)?;
                    }
                    Notification::Trade(trade) => {
                        self.observers.on_trade(&trade, value);
                        self.dispatch(Callback::Trade(trade), time, step)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, callback: Callback, time: NaiveDateTime, step: usize) -> AxResult<()> {
        let actions = {
            let views: Vec<FeedView<'_>> = self
                .feeds
                .iter()
                .zip(&self.visible)
                .map(|(feed, &n)| FeedView {
                    name: &feed.name,
                    rows: &feed.rows[..n],
                })
                .collect();
            let context = StrategyContext {
                current_time: time,
                bar_index: step,
                feeds: &views,
                positions: &self.portfolio.positions,
                cash: self.portfolio.cash,
                portfolio_value: self.portfolio.value(&self.marks),
            };
            let result = match callback {
                Callback::Start => self.strategy.on_start(&context),
                Callback::Prenext => self.strategy.on_prenext(&context),
                Callback::Next => self.strategy.on_bar(&context),
                Callback::Order(order) => self.strategy.on_order(&order, &context),
                Callback::Trade(trade) => self.strategy.on_trade(&trade, &context),
                Callback::Stop => self.strategy.on_stop(&context).map(|_| Vec::new()),
            };
            result.map_err(simulation_error)?
        };
        self.apply(actions, time)
    }

    fn apply(&mut self, actions: Vec<StrategyAction>, time: NaiveDateTime) -> AxResult<()> {
        for action in actions {
            match action {
                StrategyAction::Submit(request) => {
                    let Some(&close) = self.marks.get(request.feed) else {
                        return Err(BacktestError::Simulation {
                            message: format!("order for unknown feed index {}", request.feed),
                            trace: String::new(),
                        }
                        .into());
                    };
                    let size = match request.size {
                        Some(size) => size.abs(),
                        None => {
                            let position = self.portfolio.positions[request.feed].size;
                            let equity = self.portfolio.value(&self.marks);
                            self.sizer
                                .size(request.side, position, equity, close, self.settings.leverage)
                        }
                    };
                    let mut order = Order::new(&request, size, time);
                    if size.is_zero() {
                        order.status = OrderStatus::Rejected;
                        self.notifications.push(Notification::Order(order));
                    } else {
                        order.status = OrderStatus::Accepted;
                        self.pending.push(order);
                    }
                }
                StrategyAction::Cancel { order_id } => {
                    if let Some(index) = self.pending.iter().position(|o| o.id == order_id) {
                        let mut order = self.pending.remove(index);
                        order.cancel();
                        self.notifications.push(Notification::Order(order));
                    }
                }
            }
        }
        Ok(())
    }
}

fn simulation_error(err: StrategyError) -> AxError {
    match err {
        StrategyError::ExecutionError { message, trace } => BacktestError::Simulation { message, trace }.into(),
        other => BacktestError::Simulation {
            message: other.to_string(),
            trace: String::new(),
        }
        .into(),
    }
}
