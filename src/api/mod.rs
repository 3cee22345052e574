//! Exchange clients and the engine contract they implement.

mod binance;
mod bybit;
mod engine;
mod error;
mod signing;
mod types;

pub use binance::BinanceEngine;
pub use bybit::BybitEngine;
pub use engine::ExchangeEngine;
pub use error::ExchangeError;
