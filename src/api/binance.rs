//! Binance USDⓈ-M futures engine.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{new_client_order_id, InstrumentRules, OrderAck, OrderSide, Position};
use crate::trading::{ExchangeConfig, ExchangeKind};

use super::engine::{apply_leverage, ExchangeEngine};
use super::error::ExchangeError;
use super::signing::{hmac_sha256_hex, timestamp_ms, RECV_WINDOW_MS};
use super::types::*;

const BINANCE_MAINNET: &str = "https://fapi.binance.com";
const BINANCE_TESTNET: &str = "https://testnet.binancefuture.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const SETTLE_ASSET: &str = "USDT";

/// "No need to change leverage"
const LEVERAGE_NOT_MODIFIED: i64 = -4028;

/// REST transport for Binance futures. Private endpoints are signed over the
/// query string.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceClient {
    /// Create with custom base URL (for testing).
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

    fn url(&self, path: &str) -> Result<Url, ExchangeError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ExchangeError::Parse(format!("invalid url: {}", e)))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let mut url = self.url(path)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        debug!(url = %url, "Binance GET");

        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    /// Append `recvWindow`, `timestamp` and `signature` to `params` and send.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let timestamp = timestamp_ms().to_string();
        let mut url = self.url(path)?;
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("recvWindow", RECV_WINDOW_MS)
            .append_pair("timestamp", &timestamp);

        let query = url.query().unwrap_or_default().to_string();
        let signature = hmac_sha256_hex(&self.api_secret, &query)?;
        url.query_pairs_mut().append_pair("signature", &signature);

        debug!(method = %method, path = %path, query = %query, "Binance signed request");

        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<BinanceErrorBody>(&body) {
                Ok(err) => ExchangeError::Api {
                    code: err.code,
                    message: err.msg,
                },
                Err(_) => ExchangeError::Api {
                    code: i64::from(status.as_u16()),
                    message: body,
                },
            });
        }
        parse_body(&body)
    }

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, ExchangeError> {
        let info: BinanceExchangeInfo = self
            .public_get("/fapi/v1/exchangeInfo", &[])
            .await
            .map_err(|e| ExchangeError::rule_lookup(symbol, e))?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::rule_lookup(symbol, "symbol not listed"))?;

        let mut lot = None;
        let mut tick = None;
        for filter in symbol_info.filters {
            match filter {
                BinanceFilter::LotSize {
                    step_size,
                    min_qty,
                    max_qty,
                } => lot = Some((step_size, min_qty, max_qty)),
                BinanceFilter::PriceFilter { tick_size } => tick = Some(tick_size),
                BinanceFilter::Other => {}
            }
        }

        let (step_size, min_qty, max_qty) =
            lot.ok_or_else(|| ExchangeError::rule_lookup(symbol, "missing LOT_SIZE filter"))?;
        let tick_size =
            tick.ok_or_else(|| ExchangeError::rule_lookup(symbol, "missing PRICE_FILTER filter"))?;

        Ok(InstrumentRules {
            quantity_step: step_size,
            min_quantity: min_qty,
            max_quantity: Some(max_qty).filter(|max| *max > Decimal::ZERO),
            price_tick: tick_size,
        })
    }
}

/// Binance futures engine bound to one symbol.
pub struct BinanceEngine {
    client: BinanceClient,
    config: ExchangeConfig,
    symbol: String,
    rules: InstrumentRules,
}

impl BinanceEngine {
    pub async fn connect(config: ExchangeConfig, symbol: &str) -> Result<Self, ExchangeError> {
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None if config.testnet => BINANCE_TESTNET.to_string(),
            None => BINANCE_MAINNET.to_string(),
        };
        Self::connect_with_base_url(config, symbol, &base_url).await
    }

    pub async fn connect_with_base_url(
        config: ExchangeConfig,
        symbol: &str,
        base_url: &str,
    ) -> Result<Self, ExchangeError> {
        let client = BinanceClient::with_base_url(
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
            exchange = "binance",
            symbol = %symbol,
            testnet = engine.config.testnet,
            step_size = %rules.quantity_step,
            min_qty = %rules.min_quantity,
            tick = %rules.price_tick,
            "Connected"
        );

        apply_leverage(&engine).await;
        Ok(engine)
    }
}

#[async_trait]
impl ExchangeEngine for BinanceEngine {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
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
        let result: Result<serde_json::Value, _> = self
            .client
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[("symbol", symbol), ("leverage", leverage.as_str())],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.api_code() == Some(LEVERAGE_NOT_MODIFIED) => {
                debug!(symbol = %symbol, "Leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExchangeError> {
        let account: BinanceAccount = self
            .client
            .signed(Method::GET, "/fapi/v2/account", &[])
            .await?;

        Ok(account
            .assets
            .into_iter()
            .find(|a| a.asset == SETTLE_ASSET)
            .map(|a| a.wallet_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let positions: Vec<BinancePositionRisk> = self
            .client
            .signed(Method::GET, "/fapi/v2/positionRisk", &[("symbol", symbol)])
            .await?;

        Ok(positions
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .find_map(|p| {
                Position::from_signed_amount(p.position_amt, p.entry_price, p.un_realized_profit)
            }))
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: BinanceTickerPrice = self
            .client
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol)])
            .await?;
        if ticker.symbol != symbol {
            return Err(ExchangeError::Parse(format!(
                "ticker for {} returned {}",
                symbol, ticker.symbol
            )));
        }
        Ok(ticker.price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let client_order_id = new_client_order_id();
        let quantity = quantity.to_string();

        let mut params = vec![
            ("symbol", symbol),
            ("side", side.as_binance()),
            ("type", "MARKET"),
            ("quantity", quantity.as_str()),
            ("newClientOrderId", client_order_id.as_str()),
            ("newOrderRespType", "ACK"),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true"));
        }

        let order: BinanceOrderResponse = self
            .client
            .signed(Method::POST, "/fapi/v1/order", &params)
            .await?;

        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            client_order_id,
        })
    }
}
