//! Bybit v5 engine for USDT linear perpetuals.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{
    new_client_order_id, Direction, InstrumentRules, OrderAck, OrderSide, Position,
};
use crate::trading::{ExchangeConfig, ExchangeKind};

use super::engine::{apply_leverage, ExchangeEngine};
use super::error::ExchangeError;
use super::signing::{hmac_sha256_hex, timestamp_ms, RECV_WINDOW_MS};
use super::types::*;

const BYBIT_MAINNET: &str = "https://api.bybit.com";
const BYBIT_TESTNET: &str = "https://api-testnet.bybit.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";

/// "leverage not modified"
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Signed REST transport for the Bybit v5 API.
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    pub fn with_base_url(
        base_url: String,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        })
    }

    /// `timestamp + api_key + recv_window + payload`
    fn sign(&self, timestamp: &str, payload: &str) -> Result<String, ExchangeError> {
        let prehash = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW_MS, payload);
        hmac_sha256_hex(&self.api_secret, &prehash)
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ExchangeError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ExchangeError::Parse(format!("invalid url: {}", e)))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ExchangeError> {
        let url = self.url(path, params)?;
        let query = url.query().unwrap_or_default().to_string();
        let timestamp = timestamp_ms().to_string();
        let signature = self.sign(&timestamp, &query)?;

        debug!(path = %path, query = %query, "Bybit GET");

        let response = self
            .client
            .get(url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?;

        Self::unwrap_envelope(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let url = self.url(path, &[])?;
        let payload = body.to_string();
        let timestamp = timestamp_ms().to_string();
        let signature = self.sign(&timestamp, &payload)?;

        debug!(path = %path, body = %payload, "Bybit POST");

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS)
            .header("X-BAPI-SIGN", signature)
            .body(payload)
            .send()
            .await?;

        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::Api {
                code: i64::from(status.as_u16()),
                message: body,
            });
        }

        let envelope: BybitEnvelope = parse_body(&body)?;
        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        Ok(envelope.result)
    }

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, ExchangeError> {
        let result = self
            .get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await
            .map_err(|e| ExchangeError::rule_lookup(symbol, e))?;

        let instruments: BybitList<BybitInstrument> =
            from_value(result).map_err(|e| ExchangeError::rule_lookup(symbol, e))?;
        let instrument = instruments
            .list
            .into_iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| ExchangeError::rule_lookup(symbol, "symbol not listed"))?;

        let lot = instrument.lot_size_filter;
        Ok(InstrumentRules {
            quantity_step: lot.qty_step,
            min_quantity: lot.min_order_qty,
            max_quantity: Some(lot.max_order_qty).filter(|max| *max > Decimal::ZERO),
            price_tick: instrument.price_filter.tick_size,
        })
    }
}

/// Bybit engine bound to one symbol.
pub struct BybitEngine {
    client: BybitClient,
    config: ExchangeConfig,
    symbol: String,
    rules: InstrumentRules,
}

impl BybitEngine {
    /// Connect to `config.base_url` if set, otherwise mainnet or testnet
    /// depending on `config.testnet`.
    pub async fn connect(config: ExchangeConfig, symbol: &str) -> Result<Self, ExchangeError> {
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None if config.testnet => BYBIT_TESTNET.to_string(),
            None => BYBIT_MAINNET.to_string(),
        };
        Self::connect_with_base_url(config, symbol, &base_url).await
    }

    /// Fetch instrument rules, then apply the configured leverage.
    pub async fn connect_with_base_url(
        config: ExchangeConfig,
        symbol: &str,
        base_url: &str,
    ) -> Result<Self, ExchangeError> {
        let client = BybitClient::with_base_url(
            base_url.to_string(),
            config.api_key.clone(),
            config.api_secret.clone(),
        )?;

        let mut engine = Self {
            client,
            config,
            symbol: symbol.to_string(),
            rules: InstrumentRules::default(),
        };
        engine.rules = engine.fetch_instrument_rules(symbol).await?;

        let rules = &engine.rules;
        info!(
            exchange = "bybit",
            symbol = %symbol,
            testnet = engine.config.testnet,
            qty_step = %rules.quantity_step,
            min_qty = %rules.min_quantity,
            tick = %rules.price_tick,
            "Connected"
        );

        apply_leverage(&engine).await;
        Ok(engine)
    }
}

#[async_trait]
impl ExchangeEngine for BybitEngine {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bybit
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn rules(&self) -> &InstrumentRules {
        &self.rules
    }

    fn settings(&self) -> &ExchangeConfig {
        &self.config
    }

    async fn fetch_instrument_rules(
        &self,
        symbol: &str,
    ) -> Result<InstrumentRules, ExchangeError> {
        self.client.instrument_rules(symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let leverage = leverage.to_string();
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });

        match self.client.post("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(e) if e.api_code() == Some(LEVERAGE_NOT_MODIFIED) => {
                debug!(symbol = %symbol, "Leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExchangeError> {
        let result = self
            .client
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED"), ("coin", SETTLE_COIN)],
            )
            .await?;

        let accounts: BybitList<BybitWalletAccount> = from_value(result)?;
        let balance = accounts
            .list
            .into_iter()
            .flat_map(|account| account.coin)
            .find(|c| c.coin == SETTLE_COIN)
            .map(|c| c.wallet_balance)
            .unwrap_or(Decimal::ZERO);
        Ok(balance)
    }

    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let result = self
            .client
            .get(
                "/v5/position/list",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;

        let positions: BybitList<BybitPosition> = from_value(result)?;
        let position = positions
            .list
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .find_map(|p| {
                let side = match p.side.as_str() {
                    "Buy" => Direction::Long,
                    "Sell" => Direction::Short,
                    _ => return None,
                };
                Position::open(side, p.size, p.avg_price, p.unrealised_pnl)
            });
        Ok(position)
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let result = self
            .client
            .get(
                "/v5/market/tickers",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;

        let tickers: BybitList<BybitTicker> = from_value(result)?;
        tickers
            .list
            .into_iter()
            .find(|t| t.symbol == symbol)
            .map(|t| t.last_price)
            .ok_or_else(|| ExchangeError::Parse(format!("no ticker for {}", symbol)))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let client_order_id = new_client_order_id();
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": side.as_bybit(),
            "orderType": "Market",
            "qty": quantity.to_string(),
            "reduceOnly": reduce_only,
            "orderLinkId": client_order_id.as_str(),
        });

        let result = self.client.post("/v5/order/create", &body).await?;
        let order: BybitOrderResult = from_value(result)?;

        Ok(OrderAck {
            order_id: order.order_id,
            client_order_id,
        })
    }
}
