//! Error types for exchange calls and position opening.

use rust_decimal::Decimal;
use thiserror::Error;

/// Failure of a remote exchange call.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport failure (connect, timeout, TLS, body read)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchange answered with an error code
    #[error("exchange rejected request ({code}): {message}")]
    Api { code: i64, message: String },

    /// The response did not have the expected shape
    #[error("unexpected response: {0}")]
    Parse(String),

    /// Could not build the request signature
    #[error("request signing failed: {0}")]
    Signing(String),

    /// Instrument metadata is unavailable, so orders cannot be sized
    #[error("instrument rules unavailable for {symbol}: {reason}")]
    RuleLookup { symbol: String, reason: String },
}

impl ExchangeError {
    /// Exchange-specific error code, if the exchange sent one.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn rule_lookup(symbol: &str, reason: impl ToString) -> Self {
        ExchangeError::RuleLookup {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Why a position could not be opened.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("current price unavailable")]
    UnusablePrice,

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("quantity {quantity} below exchange minimum {minimum}")]
    BelowMinimumQuantity { quantity: Decimal, minimum: Decimal },

    #[error("order rejected: {0}")]
    Order(#[from] ExchangeError),
}
