//! Webhook payload parsing.

use serde_json::Value;
use thiserror::Error;

use crate::models::{Direction, Signal};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' must be a non-empty string")]
    InvalidField(&'static str),

    #[error("{0}")]
    UnknownSignal(String),
}

/// Build a [`Signal`] from `{"symbol": .., "signal": .., "timeframe": ..}`.
pub fn parse(payload: &Value) -> Result<Signal, ParseError> {
    let object = payload.as_object().ok_or(ParseError::NotAnObject)?;

    let symbol = required_str(object, "symbol")?.to_uppercase();
    let direction: Direction = required_str(object, "signal")?
        .to_lowercase()
        .parse()
        .map_err(ParseError::UnknownSignal)?;

    let signal = Signal::new(symbol, direction);
    Ok(match object.get("timeframe").and_then(Value::as_str) {
        Some(tf) if !tf.trim().is_empty() => signal.with_timeframe(tf.trim()),
        _ => signal,
    })
}

fn required_str<'a>(
    object: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ParseError> {
    let value = object.get(field).ok_or(ParseError::MissingField(field))?;
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::InvalidField(field))
}
