//! Exchange-facing order side and order acknowledgement.

use serde::{Deserialize, Serialize};

/// Side of a market order as the exchange sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Bybit spelling ("Buy" / "Sell").
    pub fn as_bybit(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    /// Binance spelling ("BUY" / "SELL").
    pub fn as_binance(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Confirmation that the exchange accepted a market order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// Exchange-assigned order id
    pub order_id: String,

    /// Our client order id (UUID v4)
    pub client_order_id: String,
}

/// Fresh client order id for a new order.
pub fn new_client_order_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_spellings() {
        assert_eq!(OrderSide::Buy.as_bybit(), "Buy");
        assert_eq!(OrderSide::Sell.as_binance(), "SELL");
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_client_order_ids_are_unique() {
        let a = new_client_order_id();
        let b = new_client_order_id();
        assert_ne!(a, b);
        // Binance caps newClientOrderId at 36 chars
        assert!(a.len() <= 36);
    }
}
