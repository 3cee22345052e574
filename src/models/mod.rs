//! Data models for signals, positions, orders and instrument rules.

mod instrument;
mod order;
mod position;
mod signal;

pub use instrument::InstrumentRules;
pub use order::{new_client_order_id, OrderAck, OrderSide};
pub use position::Position;
pub use signal::{Direction, Signal};
