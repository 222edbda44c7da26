use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orders::{Order, OrderId, Price, Quantity, Side};

/// A trade represents a matched transaction between two orders.
///
/// # Terminology
/// - **Maker**: The order that was already resting in the order book (providing liquidity).
///   - Can be either a Buy (bid) or Sell (ask) order.
/// - **Taker**: The incoming order that triggered the trade (taking liquidity).
///   - Its side is recorded in `aggressor`.
///
/// # Behavior
/// - The trade always executes at the **maker's price** (book price).
/// - Partial fills may occur: multiple trades can be generated from one order.
///
/// Example:
/// - A market buy order (taker) matches a limit sell at 102 (maker).
/// - A trade is created at price 102.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buy_key: String,
    pub sell_key: String,
    pub aggressor: Side,
    pub price: Price,
    pub quantity: Quantity,
    pub timestamp: SystemTime,
}

impl Trade {
    /// Records a match between the incoming `taker` and the resting `maker` at the maker's price.
    pub(crate) fn execute(taker: &Order, maker: &Order, price: Price, quantity: Quantity) -> Self {
        let (buy, sell) = match taker.side {
            Side::Buy => (taker, maker),
            Side::Sell => (maker, taker),
        };
        Self {
            id: Uuid::new_v4(),
            symbol: taker.symbol.clone(),
            buy_order_id: buy.id,
            sell_order_id: sell.id,
            buy_key: buy.idempotency_key.clone(),
            sell_key: sell.idempotency_key.clone(),
            aggressor: taker.side,
            price,
            quantity,
            timestamp: SystemTime::now(),
        }
    }

    pub fn maker_id(&self) -> OrderId {
        match self.aggressor {
            Side::Buy => self.sell_order_id,
            Side::Sell => self.buy_order_id,
        }
    }

    pub fn taker_id(&self) -> OrderId {
        match self.aggressor {
            Side::Buy => self.buy_order_id,
            Side::Sell => self.sell_order_id,
        }
    }

    /// Notional value, exact.
    pub fn notional(&self) -> Price {
        self.price * Price::from(self.quantity)
    }
}
