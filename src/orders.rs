use std::time::SystemTime;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Exact decimal price. Never a float.
pub type Price = Decimal;
/// Whole units of an instrument.
pub type Quantity = u64;
/// Engine-assigned order id, also used as the stable handle for book removal.
pub type OrderId = u64;

/// Represents which side of the market the order is on.
///
/// # Intuition
/// - `Buy` (Bid): The player wants to purchase the instrument. Bids are sorted from **highest to lowest price**
///   because a higher price means more willingness to buy i.e. more aggressive.
/// - `Sell` (Ask): The player wants to sell the instrument. Asks are sorted from **lowest to highest price**
///   because a lower price means more willingness to sell i.e. more aggressive.
///
/// This sorting ensures the matching engine always finds the **best price first**:
/// - Buyers match with the **lowest ask**
/// - Sellers match with the **highest bid**
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,  // Bid
    Sell, // Ask
}

impl Side {
    /// The side an incoming order on `self` matches against.
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Specifies whether an order is a Limit or Market order.
///
/// - `Limit`: Executes at a specific price or better, rests otherwise
/// - `Market`: Executes immediately against whatever liquidity exists, never rests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Lifecycle state of an [`Order`].
///
/// `New -> Partial -> Filled` is the happy path. `Cancelled` and `Rejected`
/// are terminal, as is `Filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// A normalized, already risk-checked request to trade.
///
/// Duplicate keys, restricted symbols and size limits are screened before an
/// intent reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub player_id: String,
    pub idempotency_key: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    #[serde(default)]
    pub price: Option<Price>,
}

impl OrderIntent {
    pub fn limit(
        player_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            idempotency_key: idempotency_key.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    pub fn market(
        player_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Quantity,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            idempotency_key: idempotency_key.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }
}

/// An order admitted by the engine.
///
/// - `price` is `None` for market orders
/// - `sequence` and `created_at` record arrival; FIFO within a level follows queue position
/// - `remaining == quantity - filled` at all times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub idempotency_key: String,
    pub player_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub quantity: Quantity,
    pub filled: Quantity,
    pub remaining: Quantity,
    pub status: OrderStatus,
    pub sequence: u64,
    pub created_at: SystemTime,
}

impl Order {
    /// Builds the engine-side order for an intent. Market orders drop any price
    /// the caller attached.
    pub(crate) fn admit(intent: OrderIntent, id: OrderId) -> Self {
        let price = match intent.order_type {
            OrderType::Limit => intent.price,
            OrderType::Market => None,
        };
        Self {
            id,
            idempotency_key: intent.idempotency_key,
            player_id: intent.player_id,
            symbol: intent.symbol,
            side: intent.side,
            order_type: intent.order_type,
            price,
            quantity: intent.quantity,
            filled: 0,
            remaining: intent.quantity,
            status: OrderStatus::New,
            sequence: id,
            created_at: SystemTime::now(),
        }
    }

    /// Admission checks that do not need a book.
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.quantity == 0 {
            return Err(EngineError::InvalidQuantity);
        }
        if self.order_type == OrderType::Limit {
            match self.price {
                None => {
                    return Err(EngineError::MissingLimitPrice {
                        key: self.idempotency_key.clone(),
                    });
                }
                Some(price) if price <= Decimal::ZERO => {
                    return Err(EngineError::InvalidPrice { price });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Moves `qty` from remaining to filled. Status is left to the caller:
    /// resting orders settle per fill, the aggressor once per admission.
    pub(crate) fn fill(&mut self, qty: Quantity) -> Result<(), EngineError> {
        let overflow = EngineError::QuantityOverflow { order_id: self.id };
        let remaining = self.remaining.checked_sub(qty).ok_or(overflow.clone())?;
        let filled = self.filled.checked_add(qty).ok_or(overflow)?;
        self.remaining = remaining;
        self.filled = filled;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_fills(&self) -> bool {
        self.filled > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn market_intent_drops_price_on_admission() {
        let mut intent = OrderIntent::market("p1", "k1", "AAPL", Side::Buy, 10);
        intent.price = Some(dec!(101.25));

        let order = Order::admit(intent, 7);

        assert_eq!(order.price, None);
        assert_eq!(order.remaining, 10);
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.sequence, 7);
    }

    #[test]
    fn validate_rejects_bad_intents() {
        let zero = Order::admit(
            OrderIntent::limit("p", "k", "AAPL", Side::Sell, 0, dec!(1)),
            1,
        );
        assert_eq!(zero.validate(), Err(EngineError::InvalidQuantity));

        let mut no_price = OrderIntent::limit("p", "k2", "AAPL", Side::Sell, 5, dec!(1));
        no_price.price = None;
        assert!(matches!(
            Order::admit(no_price, 2).validate(),
            Err(EngineError::MissingLimitPrice { .. })
        ));

        let negative = Order::admit(
            OrderIntent::limit("p", "k3", "AAPL", Side::Buy, 5, dec!(-0.01)),
            3,
        );
        assert!(matches!(
            negative.validate(),
            Err(EngineError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn fill_keeps_remaining_plus_filled_equal_to_quantity() {
        let mut order = Order::admit(
            OrderIntent::limit("p", "k", "AAPL", Side::Buy, 100, dec!(100.00)),
            1,
        );
        order.fill(30).unwrap();
        order.fill(70).unwrap();

        assert_eq!(order.filled, 100);
        assert_eq!(order.remaining, 0);
        assert!(order.fill(1).is_err());
        assert_eq!(order.filled + order.remaining, order.quantity);
    }

    #[test]
    fn enums_serialize_upper_case() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&OrderType::Market).unwrap(), "\"MARKET\"");
        assert_eq!(
            serde_json::to_string(&OrderStatus::Partial).unwrap(),
            "\"PARTIAL\""
        );
    }
}
