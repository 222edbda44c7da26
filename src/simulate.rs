//! Load simulation that drives a [`MatchingEngine`] in-process with noisy,
//! randomized order flow from many concurrent players.
//!
//! ## Model
//!
//! Each player is one tokio task with its own seeded RNG and its own view of
//! every symbol's mid-price:
//! - inter-arrival delays are drawn from `Exp(λ = rate_hz)`, a Poisson stream
//! - each arrival applies Gaussian drift `N(0, noise_sigma)` to the chosen mid
//! - sizes are `Exp1 * mean_qty`, rounded up to at least one unit
//! - the flow mixes limit orders priced within one unit of the mid, market
//!   orders, and cancels of the player's own earlier orders
//!
//! The run stops after `run_secs` (if set) or once the `CancellationToken`
//! fires. At the end every book is checked for a crossed top of book.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Exp, Exp1, Normal};
use rust_decimal::{RoundingStrategy, prelude::FromPrimitive};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    engine::MatchingEngine,
    orders::{OrderIntent, Price, Side},
};

/// Share of arrivals that try to cancel one of the player's open orders.
const CANCEL_SHARE: f64 = 0.10;
/// Share of arrivals sent as market orders.
const MARKET_SHARE: f64 = 0.20;
/// Mids never drift below this.
const MIN_MID: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub symbols: Vec<String>,
    pub players: usize,
    /// Per-player arrival rate.
    pub rate_hz: f64,
    pub noise_sigma: f64,
    pub mean_qty: f64,
    /// `None` runs until cancelled.
    pub run_secs: Option<u64>,
    /// Base seed; player `i` uses `seed + i`. Random when `None`.
    pub seed: Option<u64>,
    pub start_mid: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
            players: 4,
            rate_hz: 50.0,
            noise_sigma: 0.05,
            mean_qty: 10.0,
            run_secs: Some(10),
            seed: None,
            start_mid: 100.0,
        }
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimReport {
    pub orders: u64,
    pub trades: u64,
    pub volume: u64,
    /// Market orders whose residual found no liquidity.
    pub rejected: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub cancel_misses: u64,
    /// Symbols whose best bid was at or above the best ask when the run ended.
    pub crossed_books: Vec<String>,
}

impl SimReport {
    fn absorb(&mut self, other: SimReport) {
        self.orders += other.orders;
        self.trades += other.trades;
        self.volume += other.volume;
        self.rejected += other.rejected;
        self.failures += other.failures;
        self.cancelled += other.cancelled;
        self.cancel_misses += other.cancel_misses;
    }
}

/// One simulated trader.
struct Player {
    id: String,
    cfg: Arc<SimConfig>,
    rng: StdRng,
    arrivals: Exp<f64>,
    drift: Normal<f64>,
    mids: HashMap<String, f64>,
    open: Vec<String>,
    next_seq: u64,
    tally: SimReport,
}

impl Player {
    fn new(id: String, cfg: Arc<SimConfig>, rng: StdRng, arrivals: Exp<f64>, drift: Normal<f64>) -> Self {
        let mids = cfg
            .symbols
            .iter()
            .map(|s| (s.clone(), cfg.start_mid))
            .collect();
        Self {
            id,
            cfg,
            rng,
            arrivals,
            drift,
            mids,
            open: Vec::new(),
            next_seq: 0,
            tally: SimReport::default(),
        }
    }

    async fn run(&mut self, engine: &MatchingEngine, cancel_token: CancellationToken) {
        let start = Instant::now();
        loop {
            if let Some(max_secs) = self.cfg.run_secs {
                if start.elapsed().as_secs() >= max_secs {
                    break;
                }
            }
            let wait_secs = self.arrivals.sample(&mut self.rng);
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(player = %self.id, "received shutdown, stopping");
                    break;
                }
                _ = sleep(Duration::from_secs_f64(wait_secs)) => {
                    self.step(engine);
                }
            }
        }
    }

    /// One arrival: a cancel, a market order or a limit order.
    fn step(&mut self, engine: &MatchingEngine) {
        let symbol = self.cfg.symbols[self.rng.random_range(0..self.cfg.symbols.len())].clone();
        let shift = self.drift.sample(&mut self.rng);
        let mid = self.mids.entry(symbol.clone()).or_insert(self.cfg.start_mid);
        *mid = (*mid + shift).max(MIN_MID);
        let mid = *mid;

        let roll: f64 = self.rng.random();
        if roll < CANCEL_SHARE && !self.open.is_empty() {
            let idx = self.rng.random_range(0..self.open.len());
            let key = self.open.swap_remove(idx);
            if engine.cancel_order(&key) {
                self.tally.cancelled += 1;
            } else {
                self.tally.cancel_misses += 1;
            }
            return;
        }

        let raw: f64 = <Exp1 as Distribution<f64>>::sample(&Exp1, &mut self.rng);
        let qty = (raw * self.cfg.mean_qty).ceil().max(1.0) as u64;
        let side = if self.rng.random_bool(0.5) {
            Side::Buy
        } else {
            Side::Sell
        };
        self.next_seq += 1;
        let key = format!("{}-{}", self.id, self.next_seq);

        let intent = if roll < CANCEL_SHARE + MARKET_SHARE {
            OrderIntent::market(&self.id, &key, &symbol, side, qty)
        } else {
            let offset = self.rng.random_range(-1.0..=1.0);
            let Some(price) = to_price(mid + offset, engine.config().price_scale) else {
                return;
            };
            OrderIntent::limit(&self.id, &key, &symbol, side, qty, price)
        };

        match engine.process_order(intent) {
            Ok(result) => {
                self.tally.orders += 1;
                self.tally.trades += result.trade_count() as u64;
                self.tally.volume += result.filled_quantity();
                if result.rejection.is_some() {
                    self.tally.rejected += 1;
                }
                if !result.order.is_terminal() {
                    self.open.push(key);
                }
            }
            Err(failure) => {
                self.tally.orders += 1;
                self.tally.failures += 1;
                warn!(player = %self.id, error = %failure, "order failed");
            }
        }
    }
}

fn to_price(raw: f64, scale: u32) -> Option<Price> {
    let price = Price::from_f64(raw)?
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    (price > Price::ZERO).then_some(price)
}

/// Symbols whose top of book is crossed, each read under one lock.
pub fn crossed_books(engine: &MatchingEngine) -> Vec<String> {
    engine
        .symbols()
        .into_iter()
        .filter(|symbol| {
            engine.book_stats(symbol).is_some_and(|stats| {
                matches!((stats.best_bid, stats.best_ask), (Some(bid), Some(ask)) if bid >= ask)
            })
        })
        .collect()
}

/// Runs the simulation against `engine` until `cfg.run_secs` elapse or
/// `cancel_token` fires.
///
/// # Errors
/// Returns an error for an empty symbol list, zero players, a non-positive
/// rate or an invalid noise sigma, or if a player task panics.
pub async fn run_simulation(
    engine: Arc<MatchingEngine>,
    cfg: SimConfig,
    cancel_token: CancellationToken,
) -> anyhow::Result<SimReport> {
    if cfg.symbols.is_empty() {
        bail!("at least one symbol is required");
    }
    if cfg.players == 0 {
        bail!("at least one player is required");
    }
    // Exp accepts a zero rate, which would sleep forever
    if !(cfg.rate_hz > 0.0 && cfg.rate_hz.is_finite()) {
        bail!("rate_hz must be > 0, got {}", cfg.rate_hz);
    }
    let arrivals = Exp::new(cfg.rate_hz).map_err(|e| anyhow!("invalid rate_hz: {e}"))?;
    let drift =
        Normal::new(0.0, cfg.noise_sigma).map_err(|e| anyhow!("invalid noise_sigma: {e}"))?;
    let base_seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
    let cfg = Arc::new(cfg);

    info!(
        players = cfg.players,
        symbols = ?cfg.symbols,
        rate_hz = cfg.rate_hz,
        seed = base_seed,
        "starting simulation"
    );

    let mut handles = Vec::with_capacity(cfg.players);
    for i in 0..cfg.players {
        let rng = StdRng::seed_from_u64(base_seed.wrapping_add(i as u64));
        let mut player = Player::new(format!("player-{i}"), Arc::clone(&cfg), rng, arrivals, drift);
        let engine = Arc::clone(&engine);
        let token = cancel_token.clone();
        handles.push(tokio::spawn(async move {
            player.run(&engine, token).await;
            player.tally
        }));
    }

    let mut report = SimReport::default();
    for handle in handles {
        report.absorb(handle.await?);
    }
    report.crossed_books = crossed_books(&engine);

    info!(
        orders = report.orders,
        trades = report.trades,
        volume = report.volume,
        crossed = report.crossed_books.len(),
        "simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(seed: u64, cfg: SimConfig) -> Player {
        let arrivals = Exp::new(cfg.rate_hz).unwrap();
        let drift = Normal::new(0.0, cfg.noise_sigma).unwrap();
        Player::new(
            "p0".to_string(),
            Arc::new(cfg),
            StdRng::seed_from_u64(seed),
            arrivals,
            drift,
        )
    }

    #[test]
    fn steps_leave_no_book_crossed() {
        let engine = MatchingEngine::new();
        let mut p = player(7, SimConfig::default());

        for _ in 0..2_000 {
            p.step(&engine);
        }

        assert!(p.tally.orders > 0);
        assert!(p.tally.trades > 0);
        assert!(crossed_books(&engine).is_empty());
    }

    #[test]
    fn same_seed_same_flow() {
        let a = MatchingEngine::new();
        let b = MatchingEngine::new();
        let mut pa = player(42, SimConfig::default());
        let mut pb = player(42, SimConfig::default());

        for _ in 0..500 {
            pa.step(&a);
            pb.step(&b);
        }

        assert_eq!(pa.tally, pb.tally);
        assert_eq!(a.default_snapshot("AAPL").bids, b.default_snapshot("AAPL").bids);
    }

    #[test]
    fn to_price_rounds_and_rejects_non_positive() {
        assert_eq!(to_price(100.12345, 2), Some(Price::new(10012, 2)));
        assert_eq!(to_price(0.001, 2), None);
        assert_eq!(to_price(-3.0, 2), None);
    }

    #[tokio::test]
    async fn cancelled_token_stops_every_player() {
        let engine = Arc::new(MatchingEngine::new());
        let token = CancellationToken::new();
        token.cancel();
        let cfg = SimConfig {
            run_secs: None,
            seed: Some(1),
            rate_hz: 0.01,
            ..SimConfig::default()
        };

        let report = run_simulation(engine, cfg, token).await.unwrap();

        assert_eq!(report.orders, 0);
        assert!(report.crossed_books.is_empty());
    }

    #[tokio::test]
    async fn invalid_parameters_are_errors() {
        let engine = Arc::new(MatchingEngine::new());
        let bad_rate = SimConfig {
            rate_hz: 0.0,
            ..SimConfig::default()
        };
        assert!(
            run_simulation(Arc::clone(&engine), bad_rate, CancellationToken::new())
                .await
                .is_err()
        );

        let no_symbols = SimConfig {
            symbols: Vec::new(),
            ..SimConfig::default()
        };
        assert!(
            run_simulation(engine, no_symbols, CancellationToken::new())
                .await
                .is_err()
        );
    }
}
