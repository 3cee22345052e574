//! Trading logic: signal filter, position strategy, exchange selection.

mod config;
mod filter;
mod manager;
mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use config::flag;
pub use config::{ConfigError, ExchangeConfig, ExchangeKind};
pub use manager::ExchangeManager;
pub use strategy::{PositionStrategy, ReconcileOutcome};
