use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    engine::MatchingEngine,
    errors::LoadError,
    orderbook::BookSnapshot,
    orders::{OrderIntent, Price},
    simulate::{SimConfig, run_simulation},
    utils::shutdown_token,
};

/// Developer harness for the matching engine
#[derive(Parser)]
#[command(name = "market-mayhem")]
#[command(version, about = "Replay scripts and simulate order flow against the matching engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines script and print every result
    Replay {
        /// One `{"op":"place",...}` or `{"op":"cancel",...}` object per line
        file: PathBuf,

        /// Levels per side in the final snapshots
        #[arg(long)]
        depth: Option<usize>,

        /// Decimal places for derived prices
        #[arg(long)]
        price_scale: Option<u32>,

        /// JSON engine config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run concurrent random players against one engine
    Simulate {
        #[arg(long, value_delimiter = ',', default_value = "AAPL,MSFT")]
        symbols: Vec<String>,

        #[arg(long, default_value_t = 4)]
        players: usize,

        /// Per-player arrival rate
        #[arg(long, default_value_t = 50.0)]
        rate_hz: f64,

        #[arg(long, default_value_t = 10.0)]
        mean_qty: f64,

        #[arg(long, default_value_t = 0.05)]
        noise_sigma: f64,

        /// 0 runs until Ctrl-C
        #[arg(long, default_value_t = 10)]
        run_secs: u64,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        price_scale: Option<u32>,
    },

    /// Replay a script silently and print one book
    Book {
        file: PathBuf,
        symbol: String,
        #[arg(long)]
        depth: Option<usize>,
    },
}

/// One line of a replay script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ScriptOp {
    Place(OrderIntent),
    Cancel { idempotency_key: String },
}

/// Counters from one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub placed: usize,
    pub trades: usize,
    pub failures: usize,
    pub cancelled: usize,
    pub cancel_misses: usize,
}

/// Parses a script. Blank lines and lines starting with `#` are skipped.
pub fn parse_script(raw: &str) -> Result<Vec<ScriptOp>, LoadError> {
    let mut ops = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let op = serde_json::from_str(line).map_err(|source| LoadError::Parse {
            line: idx + 1,
            source,
        })?;
        ops.push(op);
    }
    Ok(ops)
}

pub fn load_script(path: impl AsRef<Path>) -> Result<Vec<ScriptOp>, LoadError> {
    let raw = fs::read_to_string(path)?;
    parse_script(&raw)
}

/// Applies `ops` in order. With `verbose`, every outcome is printed.
pub fn replay(engine: &MatchingEngine, ops: Vec<ScriptOp>, verbose: bool) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for op in ops {
        match op {
            ScriptOp::Place(intent) => {
                summary.placed += 1;
                match engine.process_order(intent) {
                    Ok(result) => {
                        summary.trades += result.trade_count();
                        if verbose {
                            let o = &result.order;
                            println!(
                                "order {} ({:?} {:?} {} @ {}): {:?} filled={} remaining={}",
                                o.idempotency_key,
                                o.side,
                                o.order_type,
                                o.quantity,
                                o.price.map_or("MKT".to_string(), |p| p.to_string()),
                                o.status,
                                o.filled,
                                o.remaining
                            );
                            for t in &result.trades {
                                println!(
                                    "  trade {} @ {} buy={} sell={}",
                                    t.quantity, t.price, t.buy_key, t.sell_key
                                );
                            }
                            if let Some(rejection) = result.rejection {
                                println!("  rejected: {rejection:?}");
                            }
                        }
                    }
                    Err(failure) => {
                        summary.failures += 1;
                        summary.trades += failure.outcome.trade_count();
                        if verbose {
                            println!("{failure}");
                        }
                    }
                }
            }
            ScriptOp::Cancel { idempotency_key } => {
                let ok = engine.cancel_order(&idempotency_key);
                if ok {
                    summary.cancelled += 1;
                } else {
                    summary.cancel_misses += 1;
                }
                if verbose {
                    println!("cancel {idempotency_key}: {}", if ok { "ok" } else { "not found" });
                }
            }
        }
    }
    summary
}

fn print_order_book(engine: &MatchingEngine, snapshot: &BookSnapshot) {
    println!("------ {} ------", snapshot.symbol);
    println!("Bids (highest first):");
    for level in &snapshot.bids {
        println!(
            "Price: {}, Total Qty: {}, Orders: {}",
            level.price, level.quantity, level.orders
        );
    }
    println!("Asks (lowest first):");
    for level in &snapshot.asks {
        println!(
            "Price: {}, Total Qty: {}, Orders: {}",
            level.price, level.quantity, level.orders
        );
    }
    if let Some(stats) = engine.book_stats(&snapshot.symbol) {
        let show = |p: Option<Price>| p.map_or("-".to_string(), |p| p.to_string());
        println!(
            "spread: {}, mid: {}, orders: {}",
            show(stats.spread),
            show(stats.mid_price),
            stats.order_count
        );
    }
    println!("--------------------------");
}

fn engine_config(path: Option<PathBuf>, price_scale: Option<u32>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(scale) = price_scale {
        config.price_scale = scale;
    }
    Ok(config)
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Replay {
            file,
            depth,
            price_scale,
            config,
        } => {
            let engine = MatchingEngine::with_config(engine_config(config, price_scale)?);
            let ops = load_script(&file)?;
            let summary = replay(&engine, ops, true);
            println!(
                "placed={} trades={} failures={} cancelled={} cancel_misses={}",
                summary.placed,
                summary.trades,
                summary.failures,
                summary.cancelled,
                summary.cancel_misses
            );
            let depth = depth.unwrap_or(engine.config().snapshot_depth);
            for symbol in engine.symbols() {
                print_order_book(&engine, &engine.book_snapshot(&symbol, depth));
            }
        }
        Commands::Simulate {
            symbols,
            players,
            rate_hz,
            mean_qty,
            noise_sigma,
            run_secs,
            seed,
            price_scale,
        } => {
            let engine = Arc::new(MatchingEngine::with_config(engine_config(None, price_scale)?));
            let cfg = SimConfig {
                symbols,
                players,
                rate_hz,
                noise_sigma,
                mean_qty,
                run_secs: (run_secs > 0).then_some(run_secs),
                seed,
                ..SimConfig::default()
            };
            let report = run_simulation(Arc::clone(&engine), cfg, shutdown_token()).await?;
            println!(
                "--- done --- orders={} trades={} volume={} rejected={} failures={} cancelled={} cancel_misses={}",
                report.orders,
                report.trades,
                report.volume,
                report.rejected,
                report.failures,
                report.cancelled,
                report.cancel_misses
            );
            for symbol in engine.symbols() {
                print_order_book(&engine, &engine.default_snapshot(&symbol));
            }
            if !report.crossed_books.is_empty() {
                bail!("crossed books after simulation: {:?}", report.crossed_books);
            }
        }
        Commands::Book {
            file,
            symbol,
            depth,
        } => {
            let engine = MatchingEngine::new();
            replay(&engine, load_script(&file)?, false);
            let depth = depth.unwrap_or(engine.config().snapshot_depth);
            print_order_book(&engine, &engine.book_snapshot(&symbol, depth));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{OrderStatus, Side};
    use clap::CommandFactory;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCRIPT: &str = r#"
# resting liquidity
{"op":"place","player_id":"alice","idempotency_key":"S1","symbol":"AAPL","side":"SELL","order_type":"LIMIT","quantity":100,"price":"100.00"}

{"op":"place","player_id":"bob","idempotency_key":"B1","symbol":"AAPL","side":"BUY","order_type":"MARKET","quantity":30}
{"op":"cancel","idempotency_key":"S1"}
{"op":"cancel","idempotency_key":"S1"}
"#;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let ops = parse_script(SCRIPT).unwrap();
        assert_eq!(ops.len(), 4);
        match &ops[0] {
            ScriptOp::Place(intent) => {
                assert_eq!(intent.side, Side::Sell);
                assert_eq!(intent.price, Some(dec!(100.00)));
            }
            other => panic!("expected place, got {other:?}"),
        }
        assert_eq!(
            ops[2],
            ScriptOp::Cancel {
                idempotency_key: "S1".to_string()
            }
        );
    }

    #[test]
    fn parse_error_reports_line_number() {
        let raw = "{\"op\":\"cancel\",\"idempotency_key\":\"A\"}\n{\"op\":\"nope\"}\n";
        match parse_script(raw) {
            Err(LoadError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn replay_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SCRIPT.as_bytes()).unwrap();

        let engine = MatchingEngine::new();
        let summary = replay(&engine, load_script(file.path()).unwrap(), false);

        assert_eq!(
            summary,
            ReplaySummary {
                placed: 2,
                trades: 1,
                failures: 0,
                cancelled: 1,
                cancel_misses: 1,
            }
        );
        assert!(engine.is_empty("AAPL"));
        assert!(engine.resting_order("S1").is_none());
    }

    #[test]
    fn replay_counts_failures() {
        let ops = vec![ScriptOp::Place(OrderIntent::limit(
            "p",
            "Z",
            "AAPL",
            Side::Buy,
            0,
            dec!(1),
        ))];
        let engine = MatchingEngine::new();
        let summary = replay(&engine, ops, false);
        assert_eq!(summary.failures, 1);
        assert_eq!(engine.order_count("AAPL"), 0);
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_script("/definitely/not/here.jsonl"),
            Err(LoadError::Io(_))
        ));
    }

    #[test]
    fn replayed_partial_keeps_resting_status() {
        let ops = parse_script(SCRIPT).unwrap().into_iter().take(2).collect();
        let engine = MatchingEngine::new();
        replay(&engine, ops, false);
        let resting = engine.resting_order("S1").unwrap();
        assert_eq!(resting.status, OrderStatus::Partial);
        assert_eq!(resting.remaining, 70);
    }
}
