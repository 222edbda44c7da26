//! Matching engine: a registry of per-symbol [`OrderBook`]s plus the
//! admission, matching and cancellation algorithm that runs over them.
//!
//! Every admission holds the target book's write lock from the first
//! best-price lookup until the remainder is rested, so one symbol's
//! operations are strictly serialized while different symbols run in parallel.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::RwLockUpgradableReadGuard;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    errors::{EngineError, ProcessingFailure},
    orderbook::{BookSides, BookSnapshot, OrderBook},
    orders::{Order, OrderId, OrderIntent, OrderStatus, OrderType, Price, Quantity, Side},
    trade::Trade,
};

/// Why some or all of an order's quantity was refused without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    /// A market order ran out of counter-orders; `unfilled` never rests.
    NoLiquidity { unfilled: Quantity },
}

/// Outcome of one [`MatchingEngine::process_order`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// In execution order.
    pub trades: Vec<Trade>,
    /// The incoming order in its final state.
    pub order: Order,
    /// Resting orders touched by this call, post-match, in the order they were hit.
    pub passive_updates: Vec<Order>,
    pub rejection: Option<Rejection>,
}

impl MatchResult {
    pub fn has_trades(&self) -> bool {
        !self.trades.is_empty()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    pub fn filled_quantity(&self) -> Quantity {
        self.trades.iter().map(|t| t.quantity).sum()
    }
}

/// Point-in-time statistics for one book, read under a single lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookStats {
    pub symbol: String,
    pub order_count: usize,
    pub is_empty: bool,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub spread: Option<Price>,
    pub mid_price: Option<Price>,
}

#[derive(Debug, Clone)]
struct OrderLocator {
    symbol: String,
    order_id: OrderId,
}

/// Whether an incoming order may trade against a resting order at `resting_price`.
///
/// Market orders take any price. A limit buy crosses when its limit is at or
/// above the ask; a limit sell when its limit is at or below the bid.
pub fn incoming_can_match(incoming: &Order, resting_price: Price) -> bool {
    match (incoming.order_type, incoming.price) {
        (OrderType::Market, _) => true,
        (OrderType::Limit, Some(limit)) => match incoming.side {
            Side::Buy => limit >= resting_price,
            Side::Sell => limit <= resting_price,
        },
        (OrderType::Limit, None) => false,
    }
}

/// Owns every [`OrderBook`] and is the only thing that mutates them.
///
/// Share it as `Arc<MatchingEngine>`; all methods take `&self`.
#[derive(Debug)]
pub struct MatchingEngine {
    config: EngineConfig,
    books: DashMap<String, Arc<OrderBook>>,
    /// idempotency key -> where the order rests; only non-terminal resting orders
    resting: DashMap<String, OrderLocator>,
    next_id: AtomicU64,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            books: DashMap::new(),
            resting: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn book(&self, symbol: &str) -> Option<Arc<OrderBook>> {
        self.books.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// The registry guard is released before the caller locks the book.
    fn book_or_create(&self, symbol: &str) -> Arc<OrderBook> {
        if let Some(book) = self.book(symbol) {
            return book;
        }
        let entry = self.books.entry(symbol.to_string()).or_insert_with(|| {
            debug!(symbol, "creating order book");
            Arc::new(OrderBook::with_price_scale(symbol, self.config.price_scale))
        });
        Arc::clone(entry.value())
    }

    /// Admits an order, matches it under price-time priority and rests any
    /// limit remainder.
    ///
    /// # Returns
    /// - `Ok` with the trades in execution order and the order's final state.
    ///   A market order that ran out of liquidity is `Ok` too, with status
    ///   `Rejected` and `rejection` set.
    /// - `Err` if admission checks fail or an invariant breaks mid-loop. The
    ///   order is `Rejected`; trades completed before the fault are kept in
    ///   [`ProcessingFailure::outcome`].
    pub fn process_order(&self, intent: OrderIntent) -> Result<MatchResult, ProcessingFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut order = Order::admit(intent, id);
        info!(
            order_id = order.id,
            key = %order.idempotency_key,
            symbol = %order.symbol,
            side = ?order.side,
            order_type = ?order.order_type,
            quantity = order.quantity,
            price = ?order.price,
            "admitting order"
        );

        if let Err(source) = order.validate() {
            return Err(Self::fail(order, Vec::new(), Vec::new(), source));
        }
        if self.resting.contains_key(&order.idempotency_key) {
            let source = EngineError::DuplicateKey {
                key: order.idempotency_key.clone(),
            };
            return Err(Self::fail(order, Vec::new(), Vec::new(), source));
        }

        let book = self.book_or_create(&order.symbol);
        let mut sides = book.write();
        let mut trades = Vec::new();
        let mut passive_updates = Vec::new();

        if let Err(source) =
            self.match_against(&mut sides, &mut order, &mut trades, &mut passive_updates)
        {
            drop(sides);
            return Err(Self::fail(order, trades, passive_updates, source));
        }

        let rejection = match self.settle(&mut sides, &mut order) {
            Ok(rejection) => rejection,
            Err(source) => {
                drop(sides);
                return Err(Self::fail(order, trades, passive_updates, source));
            }
        };
        drop(sides);

        info!(
            order_id = order.id,
            status = ?order.status,
            trades = trades.len(),
            remaining = order.remaining,
            "order processed"
        );
        Ok(MatchResult {
            trades,
            order,
            passive_updates,
            rejection,
        })
    }

    /// The matching loop. Runs with the book's write guard held.
    fn match_against(
        &self,
        sides: &mut BookSides,
        order: &mut Order,
        trades: &mut Vec<Trade>,
        passive_updates: &mut Vec<Order>,
    ) -> Result<(), EngineError> {
        let counter_side = order.side.opposite();

        while order.remaining > 0 {
            let Some(counter) = sides.best(counter_side) else {
                debug!(order_id = order.id, "no counter-order available");
                break;
            };
            let (counter_id, counter_remaining) = (counter.id, counter.remaining);

            let Some(counter_price) = counter.price else {
                self.evict(sides, counter_id);
                return Err(EngineError::CorruptRestingOrder {
                    order_id: counter_id,
                    reason: "resting order has no price",
                });
            };
            if counter_remaining == 0 {
                self.evict(sides, counter_id);
                return Err(EngineError::CorruptRestingOrder {
                    order_id: counter_id,
                    reason: "resting order has nothing left to fill",
                });
            }

            if !incoming_can_match(order, counter_price) {
                debug!(order_id = order.id, %counter_price, "best counter-order does not cross");
                break;
            }

            let qty = order.remaining.min(counter_remaining);
            let counter = sides.fill_best(counter_side, qty)?;
            order.fill(qty)?;

            let trade = Trade::execute(order, &counter, counter_price, qty);
            info!(
                trade_id = %trade.id,
                symbol = %trade.symbol,
                quantity = qty,
                price = %counter_price,
                buy_order_id = trade.buy_order_id,
                sell_order_id = trade.sell_order_id,
                "trade executed"
            );
            trades.push(trade);

            if counter.remaining == 0 {
                sides.remove_order(&counter);
                self.forget(&counter.idempotency_key, counter.id);
            }
            passive_updates.push(counter);
        }
        Ok(())
    }

    /// Final disposition, decided once per admission. Nothing is indexed
    /// unless the remainder actually rests.
    fn settle(
        &self,
        sides: &mut BookSides,
        order: &mut Order,
    ) -> Result<Option<Rejection>, EngineError> {
        if order.remaining == 0 {
            order.status = OrderStatus::Filled;
            return Ok(None);
        }
        match order.order_type {
            OrderType::Limit => {
                order.status = if order.has_fills() {
                    OrderStatus::Partial
                } else {
                    OrderStatus::New
                };
                // a concurrent admission may have claimed the key since the entry check
                let Entry::Vacant(slot) = self.resting.entry(order.idempotency_key.clone()) else {
                    return Err(EngineError::DuplicateKey {
                        key: order.idempotency_key.clone(),
                    });
                };
                sides.add_order(order.clone())?;
                slot.insert(OrderLocator {
                    symbol: order.symbol.clone(),
                    order_id: order.id,
                });
                debug!(order_id = order.id, remaining = order.remaining, "rested limit remainder");
                Ok(None)
            }
            OrderType::Market => {
                order.status = OrderStatus::Rejected;
                warn!(
                    order_id = order.id,
                    key = %order.idempotency_key,
                    filled = order.filled,
                    unfilled = order.remaining,
                    "no liquidity for market order residual"
                );
                Ok(Some(Rejection::NoLiquidity {
                    unfilled: order.remaining,
                }))
            }
        }
    }

    fn fail(
        mut order: Order,
        trades: Vec<Trade>,
        passive_updates: Vec<Order>,
        source: EngineError,
    ) -> ProcessingFailure {
        order.status = OrderStatus::Rejected;
        error!(
            order_id = order.id,
            key = %order.idempotency_key,
            completed_trades = trades.len(),
            error = %source,
            "order processing failed"
        );
        ProcessingFailure {
            idempotency_key: order.idempotency_key.clone(),
            source,
            outcome: MatchResult {
                trades,
                order,
                passive_updates,
                rejection: None,
            },
        }
    }

    fn evict(&self, sides: &mut BookSides, order_id: OrderId) {
        if let Some(stale) = sides.remove_by_id(order_id) {
            warn!(order_id, key = %stale.idempotency_key, "evicted corrupt resting order");
            self.forget(&stale.idempotency_key, order_id);
        }
    }

    fn forget(&self, key: &str, order_id: OrderId) {
        self.resting.remove_if(key, |_, loc| loc.order_id == order_id);
    }

    /// Cancels a resting order by idempotency key.
    ///
    /// Returns `false`, without touching any book, if the key is unknown or the
    /// order is no longer resting (filled, cancelled, or lost a race with a fill).
    pub fn cancel_order(&self, idempotency_key: &str) -> bool {
        self.cancel_order_detailed(idempotency_key).is_some()
    }

    /// Like [`cancel_order`](Self::cancel_order), but hands back the removed
    /// order in its terminal `Cancelled` state for the caller to persist.
    pub fn cancel_order_detailed(&self, idempotency_key: &str) -> Option<Order> {
        let Some(locator) = self
            .resting
            .get(idempotency_key)
            .map(|entry| entry.value().clone())
        else {
            warn!(key = idempotency_key, "cancel: order not found");
            return None;
        };
        let Some(book) = self.book(&locator.symbol) else {
            warn!(key = idempotency_key, symbol = %locator.symbol, "cancel: book not found");
            return None;
        };

        // Only one upgradable reader at a time, so the check and the removal
        // cannot be split by another writer.
        let guard = book.upgradable_read();
        if guard.get_order(locator.order_id).is_none() {
            warn!(key = idempotency_key, "cancel: order no longer cancellable");
            return None;
        }
        let mut sides = RwLockUpgradableReadGuard::upgrade(guard);
        let Some(mut cancelled) = sides.remove_by_id(locator.order_id) else {
            return None;
        };
        drop(sides);

        cancelled.status = OrderStatus::Cancelled;
        self.forget(idempotency_key, cancelled.id);
        info!(
            order_id = cancelled.id,
            key = idempotency_key,
            symbol = %cancelled.symbol,
            unfilled = cancelled.remaining,
            "order cancelled"
        );
        Some(cancelled)
    }

    /// A copy of a resting order, looked up by idempotency key.
    pub fn resting_order(&self, idempotency_key: &str) -> Option<Order> {
        let locator = self
            .resting
            .get(idempotency_key)
            .map(|entry| entry.value().clone())?;
        self.book(&locator.symbol)?.get_order(locator.order_id)
    }

    /// Top `depth` levels per side; empty for a symbol that has never traded.
    pub fn book_snapshot(&self, symbol: &str, depth: usize) -> BookSnapshot {
        match self.book(symbol) {
            Some(book) => book.snapshot(depth),
            None => BookSnapshot::empty(symbol),
        }
    }

    pub fn default_snapshot(&self, symbol: &str) -> BookSnapshot {
        self.book_snapshot(symbol, self.config.snapshot_depth)
    }

    pub fn best_price(&self, symbol: &str, side: Side) -> Option<Price> {
        self.book(symbol)?.best_price(side)
    }

    pub fn spread(&self, symbol: &str) -> Option<Price> {
        self.book(symbol)?.spread()
    }

    pub fn mid_price(&self, symbol: &str) -> Option<Price> {
        self.book(symbol)?.mid_price()
    }

    pub fn order_count(&self, symbol: &str) -> usize {
        self.book(symbol).map_or(0, |book| book.order_count())
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.book(symbol).is_none_or(|book| book.is_empty())
    }

    pub fn book_stats(&self, symbol: &str) -> Option<BookStats> {
        let book = self.book(symbol)?;
        let sides = book.read();
        Some(BookStats {
            symbol: symbol.to_string(),
            order_count: sides.order_count(),
            is_empty: sides.is_empty(),
            best_bid: sides.best_price(Side::Buy),
            best_ask: sides.best_price(Side::Sell),
            spread: sides.spread(),
            mid_price: sides.mid_price(book.price_scale()),
        })
    }

    /// Symbols with a book, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Drops every book and the resting-order index. Meant for test isolation.
    pub fn clear_all_books(&self) {
        warn!(books = self.books.len(), "clearing all order books");
        for entry in self.books.iter() {
            entry.value().clear();
        }
        self.books.clear();
        self.resting.clear();
    }
}
