use thiserror::Error;

use crate::{
    engine::MatchResult,
    orders::{OrderId, Price, Side},
};

/// Faults raised while admitting or matching a single order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("limit order `{key}` has no price")]
    MissingLimitPrice { key: String },

    #[error("limit price must be positive, got {price}")]
    InvalidPrice { price: Price },

    #[error("resting order {order_id} is corrupt: {reason}")]
    CorruptRestingOrder {
        order_id: OrderId,
        reason: &'static str,
    },

    #[error("quantity overflow on order {order_id}")]
    QuantityOverflow { order_id: OrderId },

    #[error("no resting {side:?} order to fill")]
    EmptySide { side: Side },

    #[error("idempotency key `{key}` already belongs to a resting order")]
    DuplicateKey { key: String },
}

/// The order was force-rejected. `outcome` still carries every trade that
/// completed before the fault; those are not rolled back.
#[derive(Error, Debug)]
#[error("order `{idempotency_key}` rejected: {source}")]
pub struct ProcessingFailure {
    pub idempotency_key: String,
    #[source]
    pub source: EngineError,
    pub outcome: MatchResult,
}

/// Errors from reading replay scripts and config files.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
