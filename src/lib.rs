pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod orderbook;
pub mod orders;
pub mod simulate;
pub mod trade;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{BookStats, MatchResult, MatchingEngine, Rejection};
pub use errors::{EngineError, LoadError, ProcessingFailure};
pub use orderbook::{BookLevel, BookSnapshot, OrderBook};
pub use orders::{Order, OrderId, OrderIntent, OrderStatus, OrderType, Price, Quantity, Side};
pub use trade::Trade;
