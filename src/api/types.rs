//! Wire types for the Bybit v5 and Binance USDⓈ-M futures APIs.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

use super::error::ExchangeError;

/// Decode a raw response body.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, ExchangeError> {
    serde_json::from_str(body).map_err(|e| ExchangeError::Parse(format!("{}: {}", e, body)))
}

/// Decode an already-parsed JSON value.
pub(crate) fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| ExchangeError::Parse(e.to_string()))
}

/// Decimal that may arrive as a JSON string, an empty string or a number.
pub(crate) fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Decimal::ZERO),
        Value::String(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
        Value::String(s) => parse_decimal(s.trim()).map_err(serde::de::Error::custom),
        Value::Number(n) => parse_decimal(&n.to_string()).map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected decimal, got {}",
            other
        ))),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| format!("invalid decimal '{}': {}", raw, e))
}

// ---------------------------------------------------------------------------
// Bybit v5
// ---------------------------------------------------------------------------

/// Common envelope of every Bybit v5 response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitEnvelope {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Deserialize)]
pub struct BybitList<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitInstrument {
    pub symbol: String,
    pub lot_size_filter: BybitLotSizeFilter,
    pub price_filter: BybitPriceFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitLotSizeFilter {
    #[serde(deserialize_with = "lenient_decimal")]
    pub qty_step: Decimal,
    #[serde(deserialize_with = "lenient_decimal")]
    pub min_order_qty: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub max_order_qty: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPriceFilter {
    #[serde(deserialize_with = "lenient_decimal")]
    pub tick_size: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitWalletAccount {
    #[serde(default)]
    pub coin: Vec<BybitCoinBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitCoinBalance {
    pub coin: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy", "Sell", or "" when flat
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub avg_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub unrealised_pnl: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitTicker {
    pub symbol: String,
    #[serde(deserialize_with = "lenient_decimal")]
    pub last_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrderResult {
    pub order_id: String,
}

// ---------------------------------------------------------------------------
// Binance USDⓈ-M futures
// ---------------------------------------------------------------------------

/// Error body Binance sends with a non-2xx status.
#[derive(Debug, Deserialize)]
pub struct BinanceErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct BinanceExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct BinanceSymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<BinanceFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum BinanceFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(deserialize_with = "lenient_decimal")]
        step_size: Decimal,
        #[serde(deserialize_with = "lenient_decimal")]
        min_qty: Decimal,
        #[serde(deserialize_with = "lenient_decimal")]
        max_qty: Decimal,
    },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter {
        #[serde(deserialize_with = "lenient_decimal")]
        tick_size: Decimal,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct BinanceAccount {
    #[serde(default)]
    pub assets: Vec<BinanceAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceAsset {
    pub asset: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinancePositionRisk {
    pub symbol: String,
    /// Signed: >0 long, <0 short
    #[serde(deserialize_with = "lenient_decimal")]
    pub position_amt: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub entry_price: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub un_realized_profit: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BinanceTickerPrice {
    pub symbol: String,
    #[serde(deserialize_with = "lenient_decimal")]
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrderResponse {
    pub order_id: i64,
}
