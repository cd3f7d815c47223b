use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique order identifier
pub type OrderId = Uuid;

/// Direction of an order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Order status during lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Accepted,
    Completed,
    Canceled,
    Expired,
    Margin,
    Rejected,
}

impl OrderStatus {
    /// Numeric code exposed to strategy scripts (`order.Completed` etc).
    pub fn code(&self) -> i64 {
        match self {
            OrderStatus::Submitted => 1,
            OrderStatus::Accepted => 2,
            OrderStatus::Completed => 4,
            OrderStatus::Canceled => 5,
            OrderStatus::Expired => 6,
            OrderStatus::Margin => 7,
            OrderStatus::Rejected => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "Submitted",
            OrderStatus::Accepted => "Accepted",
            OrderStatus::Completed => "Completed",
            OrderStatus::Canceled => "Canceled",
            OrderStatus::Expired => "Expired",
            OrderStatus::Margin => "Margin",
            OrderStatus::Rejected => "Rejected",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::Accepted)
    }
}

/// Market order request emitted by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: OrderId,
    pub feed: usize,
    pub side: Side,
    /// Explicit size; `None` lets the broker's sizer decide.
    pub size: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(feed: usize, side: Side) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed,
            side,
            size: None,
        }
    }

    pub fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }
}

/// Execution details of a completed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub price: Decimal,
    pub size: Decimal,
    pub commission: Decimal,
    pub value: Decimal,
    pub executed_at: NaiveDateTime,
}

/// Order tracked by the simulated broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub feed: usize,
    pub side: Side,
    pub size: Decimal,
    pub status: OrderStatus,
    pub created_at: NaiveDateTime,
    pub executed: Option<Execution>,
}

impl Order {
    pub fn new(request: &OrderRequest, size: Decimal, created_at: NaiveDateTime) -> Self {
        Self {
            id: request.id,
            feed: request.feed,
            side: request.side,
            size,
            status: OrderStatus::Submitted,
            created_at,
            executed: None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self.side, Side::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self.side, Side::Sell)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn complete(&mut self, fill: &Fill) {
        self.status = OrderStatus::Completed;
        self.executed = Some(Execution {
            price: fill.price,
            size: fill.quantity,
            commission: fill.commission,
            value: fill.gross_amount(),
            executed_at: fill.executed_at,
        });
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            self.status = OrderStatus::Canceled;
        }
    }
}

/// Order execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub feed: usize,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub executed_at: NaiveDateTime,
}

impl Fill {
    pub fn gross_amount(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Cash movement caused by this fill, commission included.
    pub fn net_amount(&self) -> Decimal {
        match self.side {
            Side::Buy => -(self.gross_amount() + self.commission),
            Side::Sell => self.gross_amount() - self.commission,
        }
    }

    /// Signed quantity: positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn fill(side: Side) -> Fill {
        Fill {
            order_id: Uuid::new_v4(),
            feed: 0,
            side,
            quantity: dec!(2),
            price: dec!(100),
            commission: dec!(0.2),
            executed_at: ts(),
        }
    }

    #[test]
    fn test_fill_net_amount() {
        assert_eq!(fill(Side::Buy).net_amount(), dec!(-200.2));
        assert_eq!(fill(Side::Sell).net_amount(), dec!(199.8));
        assert_eq!(fill(Side::Sell).signed_quantity(), dec!(-2));
    }

    #[test]
    fn test_order_lifecycle() {
        let request = OrderRequest::market(0, Side::Buy);
        let mut order = Order::new(&request, dec!(2), ts());
        assert!(order.is_active());

        order.complete(&fill(Side::Buy));
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.executed.as_ref().unwrap().value, dec!(200));

        // Terminal orders ignore cancellation
        order.cancel();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let statuses = [
            OrderStatus::Submitted,
            OrderStatus::Accepted,
            OrderStatus::Completed,
            OrderStatus::Canceled,
            OrderStatus::Expired,
            OrderStatus::Margin,
            OrderStatus::Rejected,
        ];
        let mut codes: Vec<i64> = statuses.iter().map(|s| s.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), statuses.len());
    }
}
