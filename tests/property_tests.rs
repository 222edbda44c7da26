//! Randomized order streams checked against a simple reference model of the
//! resting book (a Vec in arrival order).

use market_mayhem::{MatchingEngine, OrderIntent, OrderStatus, OrderType, Price, Side};
use proptest::prelude::*;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
enum Op {
    Limit { side: Side, qty: u64, tick: i64 },
    Market { side: Side, qty: u64 },
    Cancel(usize),
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (side_strategy(), 1u64..50, 0i64..10)
            .prop_map(|(side, qty, tick)| Op::Limit { side, qty, tick }),
        2 => (side_strategy(), 1u64..80).prop_map(|(side, qty)| Op::Market { side, qty }),
        1 => any::<usize>().prop_map(Op::Cancel),
    ]
}

fn tick_price(tick: i64) -> Price {
    dec!(100.00) + Price::new(tick * 25, 2)
}

#[derive(Debug)]
struct Resting {
    key: String,
    side: Side,
    price: Price,
    remaining: u64,
}

fn best(model: &[Resting], side: Side) -> Option<Price> {
    let prices = model.iter().filter(|r| r.side == side).map(|r| r.price);
    match side {
        Side::Buy => prices.max(),
        Side::Sell => prices.min(),
    }
}

fn check_book(engine: &MatchingEngine, model: &[Resting]) -> Result<(), TestCaseError> {
    if let Some(stats) = engine.book_stats("AAPL") {
        if let (Some(bid), Some(ask)) = (stats.best_bid, stats.best_ask) {
            prop_assert!(bid < ask, "crossed book: {} >= {}", bid, ask);
        }
        prop_assert_eq!(stats.best_bid, best(model, Side::Buy));
        prop_assert_eq!(stats.best_ask, best(model, Side::Sell));
    }
    prop_assert_eq!(engine.order_count("AAPL"), model.len());

    let snap = engine.book_snapshot("AAPL", usize::MAX);
    let book_qty: u64 = snap.bids.iter().chain(&snap.asks).map(|l| l.quantity).sum();
    let model_qty: u64 = model.iter().map(|r| r.remaining).sum();
    prop_assert_eq!(book_qty, model_qty);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn engine_agrees_with_reference_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let engine = MatchingEngine::new();
        let mut model: Vec<Resting> = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            let key = format!("K{n}");
            let intent = match op {
                Op::Limit { side, qty, tick } => {
                    OrderIntent::limit("p", &key, "AAPL", side, qty, tick_price(tick))
                }
                Op::Market { side, qty } => OrderIntent::market("p", &key, "AAPL", side, qty),
                Op::Cancel(pick) => {
                    if model.is_empty() {
                        prop_assert!(!engine.cancel_order("missing"));
                    } else {
                        let victim = model.remove(pick % model.len());
                        prop_assert!(engine.cancel_order(&victim.key));
                        // second cancel is a no-op
                        prop_assert!(!engine.cancel_order(&victim.key));
                    }
                    check_book(&engine, &model)?;
                    continue;
                }
            };

            let result = engine.process_order(intent).unwrap();
            let order = &result.order;
            let maker_side = order.side.opposite();
            let mut taker_left = order.quantity;

            for trade in &result.trades {
                // best price first
                prop_assert_eq!(Some(trade.price), best(&model, maker_side));
                // earliest arrival at that price
                let pos = model
                    .iter()
                    .position(|r| r.side == maker_side && r.price == trade.price)
                    .unwrap();
                let maker_key = match trade.aggressor {
                    Side::Buy => &trade.sell_key,
                    Side::Sell => &trade.buy_key,
                };
                prop_assert_eq!(&model[pos].key, maker_key);
                prop_assert_eq!(trade.quantity, taker_left.min(model[pos].remaining));
                if let Some(limit) = order.price {
                    match order.side {
                        Side::Buy => prop_assert!(trade.price <= limit),
                        Side::Sell => prop_assert!(trade.price >= limit),
                    }
                }

                taker_left -= trade.quantity;
                model[pos].remaining -= trade.quantity;
                if model[pos].remaining == 0 {
                    model.remove(pos);
                }
            }

            prop_assert_eq!(taker_left, order.remaining);
            prop_assert_eq!(order.filled + order.remaining, order.quantity);
            prop_assert_eq!(result.passive_updates.len(), result.trades.len());

            match order.status {
                OrderStatus::Filled => prop_assert_eq!(order.remaining, 0),
                OrderStatus::New | OrderStatus::Partial => {
                    prop_assert_eq!(order.order_type, OrderType::Limit);
                    prop_assert_eq!(order.status == OrderStatus::Partial, order.filled > 0);
                    model.push(Resting {
                        key: key.clone(),
                        side: order.side,
                        price: order.price.unwrap(),
                        remaining: order.remaining,
                    });
                }
                OrderStatus::Rejected => {
                    prop_assert_eq!(order.order_type, OrderType::Market);
                    prop_assert!(result.rejection.is_some());
                    // only liquidity exhaustion rejects a market order
                    prop_assert!(best(&model, maker_side).is_none());
                }
                OrderStatus::Cancelled => prop_assert!(false, "fresh order reported cancelled"),
            }

            check_book(&engine, &model)?;
        }
    }

    #[test]
    fn trades_always_print_at_resting_price(
        resting_tick in 0i64..10,
        aggressive_tick in 0i64..10,
        qty in 1u64..100,
    ) {
        let engine = MatchingEngine::new();
        let resting = tick_price(resting_tick);
        let limit = tick_price(aggressive_tick);
        engine
            .process_order(OrderIntent::limit("m", "REST", "AAPL", Side::Sell, 100, resting))
            .unwrap();

        let result = engine
            .process_order(OrderIntent::limit("t", "AGG", "AAPL", Side::Buy, qty, limit))
            .unwrap();

        if limit >= resting {
            prop_assert_eq!(result.trades.len(), 1);
            prop_assert_eq!(result.trades[0].price, resting);
            prop_assert_eq!(result.trades[0].quantity, qty);
        } else {
            prop_assert!(result.trades.is_empty());
        }
    }
}
