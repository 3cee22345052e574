//! Snapshot of the open position on the exchange.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;
use super::signal::Direction;

/// Open directional exposure. Always fetched fresh from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Long or short
    pub side: Direction,

    /// Position size in base asset, always > 0
    pub size: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    /// Unrealized P&L in quote currency
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Build a position snapshot. Returns `None` for a zero (or negative)
    /// size, which exchanges use to report a flat book.
    pub fn open(
        side: Direction,
        size: Decimal,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Option<Self> {
        if size <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            side,
            size,
            entry_price,
            unrealized_pnl,
        })
    }

    /// Build from a signed amount (Binance one-way mode: >0 long, <0 short).
    pub fn from_signed_amount(
        amount: Decimal,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Option<Self> {
        let side = if amount.is_sign_negative() {
            Direction::Short
        } else {
            Direction::Long
        };
        Self::open(side, amount.abs(), entry_price, unrealized_pnl)
    }

    /// Order side that reduces this position to zero.
    pub fn closing_side(&self) -> OrderSide {
        self.side.entry_side().opposite()
    }

    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.size * self.entry_price
    }
}
