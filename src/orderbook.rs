use crate::{
    config::DEFAULT_PRICE_SCALE,
    errors::EngineError,
    orders::{Order, OrderId, OrderStatus, Price, Quantity, Side},
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::SystemTime,
};
use tracing::{debug, warn};

/// FIFO queue of resting orders sharing one price.
///
/// Partial fills mutate the front order in place, so an order's queue position
/// only changes when something ahead of it is removed.
#[derive(Debug, Clone, Default)]
pub struct PriceLevel {
    orders: VecDeque<Order>,
    total_quantity: Quantity,
}

impl PriceLevel {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_back(&mut self, order: Order) -> Result<(), EngineError> {
        self.total_quantity = self
            .total_quantity
            .checked_add(order.remaining)
            .ok_or(EngineError::QuantityOverflow { order_id: order.id })?;
        self.orders.push_back(order);
        Ok(())
    }

    pub fn front(&self) -> Option<&Order> {
        self.orders.front()
    }

    fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let position = self.orders.iter().position(|o| o.id == order_id)?;
        let order = self.orders.remove(position)?;
        self.total_quantity = self.total_quantity.saturating_sub(order.remaining);
        Some(order)
    }

    /// Fills the front order by `qty` and settles its status. Returns a copy of
    /// the order as it now stands. Removal of a filled order is left to the caller.
    fn fill_front(&mut self, side: Side, qty: Quantity) -> Result<Order, EngineError> {
        let order = self
            .orders
            .front_mut()
            .ok_or(EngineError::EmptySide { side })?;
        order.fill(qty)?;
        order.status = if order.remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.total_quantity = self
            .total_quantity
            .checked_sub(qty)
            .ok_or(EngineError::QuantityOverflow { order_id: order.id })?;
        Ok(order.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Aggregated remaining quantity at this level.
    pub fn total_quantity(&self) -> Quantity {
        self.total_quantity
    }
}

/// One aggregated price level as published to market data. Order identities
/// are not exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub quantity: Quantity,
    pub orders: usize,
}

/// Top-of-book view of one instrument at `captured_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    /// Highest price first.
    pub bids: Vec<BookLevel>,
    /// Lowest price first.
    pub asks: Vec<BookLevel>,
    pub captured_at: SystemTime,
}

impl BookSnapshot {
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            captured_at: SystemTime::now(),
        }
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

/// The two sides of a book plus an id index. This is the state guarded by
/// [`OrderBook`]'s lock; every method here assumes the caller holds it.
///
/// - `bids`: keyed by price ascending, so the best bid is the **last** key
/// - `asks`: keyed by price ascending, so the best ask is the **first** key
#[derive(Debug, Default)]
pub struct BookSides {
    bids: BTreeMap<Price, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    /// order id -> (side, price), the handle used for removal
    index: HashMap<OrderId, (Side, Price)>,
}

impl BookSides {
    fn side(&self, side: Side) -> &BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn best_level(&self, side: Side) -> Option<(&Price, &PriceLevel)> {
        match side {
            Side::Buy => self.bids.iter().next_back(),
            Side::Sell => self.asks.iter().next(),
        }
    }

    /// Appends a **limit** order to the tail of its price level.
    ///
    /// Market orders (`price == None`) never rest; they are logged and ignored.
    ///
    /// Fails with [`EngineError::QuantityOverflow`] if the level total would
    /// overflow. The book is left untouched in that case.
    pub fn add_order(&mut self, order: Order) -> Result<(), EngineError> {
        let Some(price) = order.price else {
            warn!(order_id = order.id, "attempted to rest an order without a price, ignoring");
            return Ok(());
        };
        let (order_id, side) = (order.id, order.side);
        let level_total = self
            .side(side)
            .get(&price)
            .map_or(0, PriceLevel::total_quantity);
        if level_total.checked_add(order.remaining).is_none() {
            return Err(EngineError::QuantityOverflow { order_id });
        }
        self.side_mut(side)
            .entry(price)
            .or_default()
            .push_back(order)?;
        self.index.insert(order_id, (side, price));
        Ok(())
    }

    /// Removes the order with `order.id`. Returns `false` if it is not resting.
    pub fn remove_order(&mut self, order: &Order) -> bool {
        self.remove_by_id(order.id).is_some()
    }

    /// Removes a resting order by handle, pruning its level if it empties.
    pub fn remove_by_id(&mut self, order_id: OrderId) -> Option<Order> {
        let (side, price) = self.index.remove(&order_id)?;
        let book_side = self.side_mut(side);
        let level = book_side.get_mut(&price)?;
        let removed = level.remove(order_id);
        if level.is_empty() {
            book_side.remove(&price);
        }
        removed
    }

    /// Fills the front order of the best level on `side`. See [`PriceLevel`].
    pub(crate) fn fill_best(&mut self, side: Side, qty: Quantity) -> Result<Order, EngineError> {
        let level = match side {
            Side::Buy => self.bids.values_mut().next_back(),
            Side::Sell => self.asks.values_mut().next(),
        }
        .ok_or(EngineError::EmptySide { side })?;
        level.fill_front(side, qty)
    }

    pub fn best(&self, side: Side) -> Option<&Order> {
        self.best_level(side).and_then(|(_, level)| level.front())
    }

    pub fn best_bid(&self) -> Option<&Order> {
        self.best(Side::Buy)
    }

    pub fn best_ask(&self) -> Option<&Order> {
        self.best(Side::Sell)
    }

    pub fn best_price(&self, side: Side) -> Option<Price> {
        self.best_level(side).map(|(price, _)| *price)
    }

    pub fn spread(&self) -> Option<Price> {
        Some(self.best_price(Side::Sell)? - self.best_price(Side::Buy)?)
    }

    /// Average of best bid and ask, rounded half-up to `scale` decimal places.
    pub fn mid_price(&self, scale: u32) -> Option<Price> {
        let bid = self.best_price(Side::Buy)?;
        let ask = self.best_price(Side::Sell)?;
        Some(
            ((bid + ask) / Decimal::TWO)
                .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<&Order> {
        let (side, price) = self.index.get(&order_id)?;
        self.side(*side)
            .get(price)?
            .iter()
            .find(|o| o.id == order_id)
    }

    pub fn orders_at_price(&self, side: Side, price: Price) -> Vec<Order> {
        self.side(side)
            .get(&price)
            .map(|level| level.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn quantity_at_price(&self, side: Side, price: Price) -> Quantity {
        self.side(side)
            .get(&price)
            .map(PriceLevel::total_quantity)
            .unwrap_or(0)
    }

    /// Top `depth` levels of `side`, best first.
    pub fn levels(&self, side: Side, depth: usize) -> Vec<BookLevel> {
        let to_level = |(price, level): (&Price, &PriceLevel)| BookLevel {
            price: *price,
            quantity: level.total_quantity(),
            orders: level.len(),
        };
        match side {
            Side::Buy => self.bids.iter().rev().take(depth).map(to_level).collect(),
            Side::Sell => self.asks.iter().take(depth).map(to_level).collect(),
        }
    }

    pub fn level_count(&self, side: Side) -> usize {
        self.side(side).len()
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
    }
}

/// An [`OrderBook`] stores **resting** buy and sell orders for one instrument.
///
/// Each price level holds a FIFO queue to maintain **price-time** priority.
/// All access goes through one fair reader/writer lock: mutations are
/// exclusive, reads may overlap and always see a whole mutation or none of it.
/// The matching engine holds the write guard across an entire admission so the
/// match-then-rest sequence is atomic.
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    price_scale: u32,
    sides: RwLock<BookSides>,
}

impl OrderBook {
    /// Creates a new, empty [`OrderBook`], with no resting bids or asks.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_price_scale(symbol, DEFAULT_PRICE_SCALE)
    }

    pub fn with_price_scale(symbol: impl Into<String>, price_scale: u32) -> Self {
        Self {
            symbol: symbol.into(),
            price_scale,
            sides: RwLock::new(BookSides::default()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn price_scale(&self) -> u32 {
        self.price_scale
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, BookSides> {
        self.sides.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, BookSides> {
        self.sides.write()
    }

    pub(crate) fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, BookSides> {
        self.sides.upgradable_read()
    }

    pub fn add_order(&self, order: Order) -> Result<(), EngineError> {
        debug!(symbol = %self.symbol, order_id = order.id, "resting order");
        self.write().add_order(order)
    }

    pub fn remove_order(&self, order: &Order) -> bool {
        self.write().remove_order(order)
    }

    pub fn best_bid(&self) -> Option<Order> {
        self.read().best_bid().cloned()
    }

    pub fn best_ask(&self) -> Option<Order> {
        self.read().best_ask().cloned()
    }

    pub fn best_price(&self, side: Side) -> Option<Price> {
        self.read().best_price(side)
    }

    pub fn spread(&self) -> Option<Price> {
        self.read().spread()
    }

    pub fn mid_price(&self) -> Option<Price> {
        self.read().mid_price(self.price_scale)
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.read().get_order(order_id).cloned()
    }

    pub fn orders_at_price(&self, side: Side, price: Price) -> Vec<Order> {
        self.read().orders_at_price(side, price)
    }

    pub fn quantity_at_price(&self, side: Side, price: Price) -> Quantity {
        self.read().quantity_at_price(side, price)
    }

    pub fn level_count(&self, side: Side) -> usize {
        self.read().level_count(side)
    }

    pub fn order_count(&self) -> usize {
        self.read().order_count()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Top `depth` levels per side, captured under a single read lock.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let sides = self.read();
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids: sides.levels(Side::Buy, depth),
            asks: sides.levels(Side::Sell, depth),
            captured_at: SystemTime::now(),
        }
    }
}
