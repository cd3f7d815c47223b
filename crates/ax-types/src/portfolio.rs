use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orders::{Fill, Side};

/// Net position held on one feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub feed: usize,
    /// Signed size: positive long, negative short.
    pub size: Decimal,
    /// Average entry price of the open size.
    pub price: Decimal,
    pub realized_pnl: Decimal,
}

/// Effect of one fill on a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionUpdate {
    pub closed: Decimal,
    pub opened: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn new(feed: usize) -> Self {
        Self {
            feed,
            size: Decimal::ZERO,
            price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn is_long(&self) -> bool {
        self.size > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.size < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.size == Decimal::ZERO
    }

    pub fn apply_fill(&mut self, fill: &Fill) -> PositionUpdate {
        let signed = fill.signed_quantity();
        let quantity = fill.quantity;
        let mut update = PositionUpdate::default();

        if self.size == Decimal::ZERO {
            // Opening new position
            self.size = signed;
            self.price = fill.price;
            update.opened = quantity;
        } else if (self.size > Decimal::ZERO) == (signed > Decimal::ZERO) {
            // Adding to existing position
            let total_cost = self.size.abs() * self.price + quantity * fill.price;
            let total_quantity = self.size.abs() + quantity;
            self.price = total_cost / total_quantity;
            self.size += signed;
            update.opened = quantity;
        } else {
            // Reducing, closing or reversing
            let closed = quantity.min(self.size.abs());
            let direction = if self.size > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
            let realized = (fill.price - self.price) * closed * direction;
            self.realized_pnl += realized;
            update.closed = closed;
            update.realized_pnl = realized;

            let remaining = quantity - closed;
            self.size += signed;
            if self.size == Decimal::ZERO {
                self.price = Decimal::ZERO;
            } else if remaining > Decimal::ZERO {
                self.price = fill.price;
                update.opened = remaining;
            }
        }

        update
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.size * price
    }
}

/// Cash plus per-feed positions of the simulated account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: Vec<Position>,
    pub total_commissions: Decimal,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal, feeds: usize) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: (0..feeds).map(Position::new).collect(),
            total_commissions: Decimal::ZERO,
        }
    }

    pub fn apply_fill(&mut self, fill: &Fill) -> PositionUpdate {
        self.cash += fill.net_amount();
        self.total_commissions += fill.commission;
        match self.positions.get_mut(fill.feed) {
            Some(position) => position.apply_fill(fill),
            None => PositionUpdate::default(),
        }
    }

    pub fn position(&self, feed: usize) -> Option<&Position> {
        self.positions.get(feed)
    }

    /// Account value marked at the given per-feed prices.
    pub fn value(&self, prices: &[Decimal]) -> Decimal {
        let market_value: Decimal = self
            .positions
            .iter()
            .map(|p| p.market_value(prices.get(p.feed).copied().unwrap_or(p.price)))
            .sum();
        self.cash + market_value
    }
}

/// Round trip on one feed, from flat back to flat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub feed: usize,
    pub direction: Side,
    /// Current open size (unsigned).
    pub size: Decimal,
    /// Largest size reached while open.
    pub peak_size: Decimal,
    pub price: Decimal,
    pub opened_at: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
    pub pnl: Decimal,
    pub pnl_comm: Decimal,
    pub commission: Decimal,
}

impl Trade {
    pub fn open(feed: usize, direction: Side, size: Decimal, price: Decimal, at: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed,
            direction,
            size,
            peak_size: size,
            price,
            opened_at: at,
            closed_at: None,
            pnl: Decimal::ZERO,
            pnl_comm: Decimal::ZERO,
            commission: Decimal::ZERO,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_long(&self) -> bool {
        matches!(self.direction, Side::Buy)
    }

    pub fn add_commission(&mut self, commission: Decimal) {
        self.commission += commission;
        self.pnl_comm = self.pnl - self.commission;
    }

    pub fn increase(&mut self, quantity: Decimal, price: Decimal) {
        let total = self.size + quantity;
        self.price = (self.size * self.price + quantity * price) / total;
        self.size = total;
        self.peak_size = self.peak_size.max(total);
    }

    pub fn reduce(&mut self, quantity: Decimal, realized_pnl: Decimal, at: NaiveDateTime) {
        self.size -= quantity;
        self.pnl += realized_pnl;
        self.pnl_comm = self.pnl - self.commission;
        if self.size <= Decimal::ZERO {
            self.size = Decimal::ZERO;
            self.closed_at = Some(at);
        }
    }

    /// A closed trade counts as won when its P&L net of commission is positive.
    pub fn is_won(&self) -> bool {
        self.is_closed() && self.pnl_comm > Decimal::ZERO
    }
}
