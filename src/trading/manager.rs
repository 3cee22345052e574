//! Picks the active exchange and builds its engine and strategy.

use std::sync::Arc;
use tracing::info;

use crate::api::{BinanceEngine, BybitEngine, ExchangeEngine, ExchangeError};

use super::config::{flag, ConfigError, ExchangeConfig, ExchangeKind};
use super::strategy::{PositionStrategy, StrategyConfig};

/// Resolve the single enabled exchange from `BYBIT_ENABLED` / `BINANCE_ENABLED`.
pub fn select_exchange<F>(lookup: &F) -> Result<ExchangeKind, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let bybit = flag(lookup, "BYBIT_ENABLED");
    let binance = flag(lookup, "BINANCE_ENABLED");

    match (bybit, binance) {
        (true, true) => Err(ConfigError::BothExchangesEnabled),
        (false, false) => Err(ConfigError::NoExchangeEnabled),
        (true, false) => Ok(ExchangeKind::Bybit),
        (false, true) => Ok(ExchangeKind::Binance),
    }
}

/// Holds the validated configuration of the one active exchange.
#[derive(Debug, Clone)]
pub struct ExchangeManager {
    kind: ExchangeKind,
    exchange: ExchangeConfig,
    strategy_config: StrategyConfig,
    default_symbol: String,
    symbol_configured: bool,
}

impl ExchangeManager {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = select_exchange(lookup)?;
        let exchange = ExchangeConfig::from_lookup(kind, lookup)?;
        let strategy_config = StrategyConfig::from_lookup(lookup)?;

        let configured = lookup(&format!("{}_SYMBOL", kind.env_prefix()))
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());
        let symbol_configured = configured.is_some();
        let default_symbol = configured.unwrap_or_else(|| kind.default_symbol().to_string());

        Ok(Self {
            kind,
            exchange,
            strategy_config,
            default_symbol,
            symbol_configured,
        })
    }

    pub fn active_exchange(&self) -> ExchangeKind {
        self.kind
    }

    pub fn default_symbol(&self) -> &str {
        &self.default_symbol
    }

    /// Set when the symbol falls back to a USDC-margined default. Alerts
    /// naming the USDT pair are then rejected as a symbol mismatch.
    pub fn symbol_warning(&self) -> Option<String> {
        if self.symbol_configured || !self.default_symbol.ends_with("USDC") {
            return None;
        }
        Some(format!(
            "{} trades {} by default; alerts must send this symbol or set {}_SYMBOL",
            self.kind,
            self.default_symbol,
            self.kind.env_prefix()
        ))
    }

    pub fn exchange_config(&self) -> &ExchangeConfig {
        &self.exchange
    }

    pub fn strategy_config(&self) -> &StrategyConfig {
        &self.strategy_config
    }

    /// Connect the active exchange's engine for `symbol` (or the default symbol).
    pub async fn connect_engine(
        &self,
        symbol: Option<&str>,
    ) -> Result<Arc<dyn ExchangeEngine>, ExchangeError> {
        let symbol = symbol
            .map(str::to_uppercase)
            .unwrap_or_else(|| self.default_symbol.clone());

        info!(
            exchange = %self.kind,
            symbol = %symbol,
            testnet = self.exchange.testnet,
            api_key = %self.exchange.masked_key(),
            "Connecting exchange engine"
        );

        let engine: Arc<dyn ExchangeEngine> = match self.kind {
            ExchangeKind::Bybit => {
                Arc::new(BybitEngine::connect(self.exchange.clone(), &symbol).await?)
            }
            ExchangeKind::Binance => {
                Arc::new(BinanceEngine::connect(self.exchange.clone(), &symbol).await?)
            }
        };
        Ok(engine)
    }

    /// Connect the engine and wrap it in a fresh strategy.
    pub async fn build_strategy(
        &self,
        symbol: Option<&str>,
    ) -> Result<PositionStrategy, ExchangeError> {
        let engine = self.connect_engine(symbol).await?;
        Ok(PositionStrategy::new(engine, self.strategy_config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_both_enabled_rejected() {
        let lookup = env(&[("BYBIT_ENABLED", "true"), ("BINANCE_ENABLED", "TRUE")]);
        assert_eq!(select_exchange(&lookup), Err(ConfigError::BothExchangesEnabled));
    }

    #[test]
    fn test_neither_enabled_rejected() {
        let lookup = env(&[("BYBIT_ENABLED", "false"), ("BINANCE_ENABLED", "yes")]);
        assert_eq!(select_exchange(&lookup), Err(ConfigError::NoExchangeEnabled));
        assert_eq!(select_exchange(&env(&[])), Err(ConfigError::NoExchangeEnabled));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let lookup = env(&[("BINANCE_ENABLED", "true"), ("BINANCE_API_KEY", "key")]);
        let err = ExchangeManager::from_lookup(&lookup).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("BINANCE_SECRET".to_string()));
    }

    #[test]
    fn test_default_symbols() {
        let bybit = ExchangeManager::from_lookup(&env(&[
            ("BYBIT_ENABLED", "True"),
            ("BYBIT_API_KEY", "key"),
            ("BYBIT_SECRET", "secret"),
        ]))
        .unwrap();
        assert_eq!(bybit.active_exchange(), ExchangeKind::Bybit);
        assert_eq!(bybit.default_symbol(), "ETHUSDT");

        let binance = ExchangeManager::from_lookup(&env(&[
            ("BINANCE_ENABLED", "true"),
            ("BINANCE_API_KEY", "key"),
            ("BINANCE_SECRET", "secret"),
        ]))
        .unwrap();
        assert_eq!(binance.active_exchange(), ExchangeKind::Binance);
        assert_eq!(binance.default_symbol(), "ETHUSDC");
    }

    #[test]
    fn test_usdc_default_symbol_is_flagged() {
        let binance = ExchangeManager::from_lookup(&env(&[
            ("BINANCE_ENABLED", "true"),
            ("BINANCE_API_KEY", "key"),
            ("BINANCE_SECRET", "secret"),
        ]))
        .unwrap();
        let warning = binance.symbol_warning().unwrap();
        assert!(warning.contains("ETHUSDC"));
        assert!(warning.contains("BINANCE_SYMBOL"));

        let explicit = ExchangeManager::from_lookup(&env(&[
            ("BINANCE_ENABLED", "true"),
            ("BINANCE_API_KEY", "key"),
            ("BINANCE_SECRET", "secret"),
            ("BINANCE_SYMBOL", "ethusdc"),
        ]))
        .unwrap();
        assert_eq!(explicit.symbol_warning(), None);

        let bybit = ExchangeManager::from_lookup(&env(&[
            ("BYBIT_ENABLED", "true"),
            ("BYBIT_API_KEY", "key"),
            ("BYBIT_SECRET", "secret"),
        ]))
        .unwrap();
        assert_eq!(bybit.symbol_warning(), None);
    }

    #[tokio::test]
    async fn test_connects_bybit_engine_at_base_url() {
        let mut server = Server::new_async().await;
        let _instruments = server
            .mock("GET", "/v5/market/instruments-info")
            .match_query(Matcher::UrlEncoded("symbol".into(), "SOLUSDT".into()))
            .with_status(200)
            .with_body(
                r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"SOLUSDT",
                "lotSizeFilter":{"qtyStep":"0.1","minOrderQty":"0.1","maxOrderQty":"5000"},
                "priceFilter":{"tickSize":"0.001"}}]}}"#,
            )
            .create_async()
            .await;
        let _leverage = server
            .mock("POST", "/v5/position/set-leverage")
            .with_status(200)
            .with_body(r#"{"retCode":0,"retMsg":"OK","result":{}}"#)
            .create_async()
            .await;

        let url = server.url();
        let manager = ExchangeManager::from_lookup(&env(&[
            ("BYBIT_ENABLED", "true"),
            ("BYBIT_API_KEY", "key"),
            ("BYBIT_SECRET", "secret"),
            ("BYBIT_BASE_URL", url.as_str()),
        ]))
        .unwrap();

        let strategy = manager.build_strategy(Some("solusdt")).await.unwrap();
        let engine = strategy.engine();
        assert_eq!(engine.kind(), ExchangeKind::Bybit);
        assert_eq!(engine.symbol(), "SOLUSDT");
        assert_eq!(engine.rules().quantity_step, dec!(0.1));
    }

    #[tokio::test]
    async fn test_connects_binance_engine_at_base_url() {
        let mut server = Server::new_async().await;
        let _info = server
            .mock("GET", "/fapi/v1/exchangeInfo")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"symbols":[{"symbol":"ETHUSDC","filters":[
                {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"10000"},
                {"filterType":"PRICE_FILTER","tickSize":"0.01"}]}]}"#,
            )
            .create_async()
            .await;
        let _leverage = server
            .mock("POST", "/fapi/v1/leverage")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"leverage":10,"symbol":"ETHUSDC"}"#)
            .create_async()
            .await;

        let url = server.url();
        let manager = ExchangeManager::from_lookup(&env(&[
            ("BINANCE_ENABLED", "true"),
            ("BINANCE_API_KEY", "key"),
            ("BINANCE_SECRET", "secret"),
            ("BINANCE_BASE_URL", url.as_str()),
        ]))
        .unwrap();

        let engine = manager.connect_engine(None).await.unwrap();
        assert_eq!(engine.kind(), ExchangeKind::Binance);
        assert_eq!(engine.symbol(), "ETHUSDC");
        assert_eq!(engine.rules().price_tick, dec!(0.01));
    }

    #[test]
    fn test_symbol_and_sizing_overrides() {
        let manager = ExchangeManager::from_lookup(&env(&[
            ("BYBIT_ENABLED", "true"),
            ("BYBIT_API_KEY", "key"),
            ("BYBIT_SECRET", "secret"),
            ("BYBIT_SYMBOL", "solusdt"),
            ("POSITION_SIZE", "50"),
            ("SETTLE_TIMEOUT_MS", "3000"),
        ]))
        .unwrap();

        assert_eq!(manager.default_symbol(), "SOLUSDT");
        assert_eq!(manager.exchange_config().position_size, dec!(50));
        assert_eq!(
            manager.strategy_config().settle_timeout,
            std::time::Duration::from_secs(3)
        );
    }
}
