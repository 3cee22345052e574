//! Exchange selection and credentials, read from the environment.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Invalid or missing startup configuration. Always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("BYBIT_ENABLED and BINANCE_ENABLED cannot both be true")]
    BothExchangesEnabled,

    #[error("one exchange must be enabled (BYBIT_ENABLED=true or BINANCE_ENABLED=true)")]
    NoExchangeEnabled,

    #[error("{0} must be set")]
    MissingVar(String),

    #[error("invalid {name}: {reason}")]
    InvalidVar { name: String, reason: String },
}

/// Supported exchanges. Exactly one is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Bybit,
    Binance,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Bybit => "bybit",
            ExchangeKind::Binance => "binance",
        }
    }

    /// Prefix of this exchange's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ExchangeKind::Bybit => "BYBIT",
            ExchangeKind::Binance => "BINANCE",
        }
    }

    /// Symbol traded when `<EXCHANGE>_SYMBOL` is not set.
    pub fn default_symbol(&self) -> &'static str {
        match self {
            ExchangeKind::Bybit => "ETHUSDT",
            ExchangeKind::Binance => "ETHUSDC",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials and sizing for the active exchange. Loaded once at startup.
#[derive(Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,

    /// Route requests to the exchange sandbox
    pub testnet: bool,

    /// Quote-currency margin committed per position (USDT)
    pub position_size: Decimal,

    /// Leverage applied to every position
    pub leverage: u32,

    /// REST endpoint override (`<EXCHANGE>_BASE_URL`), takes precedence
    /// over `testnet`
    pub base_url: Option<String>,
}

impl ExchangeConfig {
    /// Read `<EXCHANGE>_API_KEY`, `<EXCHANGE>_SECRET`, `<EXCHANGE>_TESTNET`,
    /// `<EXCHANGE>_BASE_URL`, `POSITION_SIZE` and `LEVERAGE`.
    pub fn from_lookup<F>(kind: ExchangeKind, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = kind.env_prefix();
        let api_key = required(lookup, &format!("{}_API_KEY", prefix))?;
        let api_secret = required(lookup, &format!("{}_SECRET", prefix))?;
        let testnet = flag(lookup, &format!("{}_TESTNET", prefix));
        let base_url = lookup(&format!("{}_BASE_URL", prefix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let position_size: Decimal = parse_or(lookup, "POSITION_SIZE", dec!(100))?;
        if position_size <= Decimal::ZERO {
            return Err(ConfigError::InvalidVar {
                name: "POSITION_SIZE".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let leverage: u32 = parse_or(lookup, "LEVERAGE", 10)?;
        if leverage == 0 {
            return Err(ConfigError::InvalidVar {
                name: "LEVERAGE".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            api_key,
            api_secret,
            testnet,
            position_size,
            leverage,
            base_url,
        })
    }

    /// API key with everything but the last four characters hidden.
    pub fn masked_key(&self) -> String {
        mask(&self.api_key)
    }
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("api_key", &self.masked_key())
            .field("api_secret", &"***")
            .field("testnet", &self.testnet)
            .field("position_size", &self.position_size)
            .field("leverage", &self.leverage)
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn mask(value: &str) -> String {
    let visible: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if value.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("***{}", visible)
    }
}

/// Non-empty variable or `MissingVar`.
pub(crate) fn required<F>(lookup: &F, name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

/// `true` only for a case-insensitive "true"; anything else is `false`.
pub(crate) fn flag<F>(lookup: &F, name: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse an optional variable, falling back to `default` when unset or blank.
pub(crate) fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name).map(|v| v.trim().to_string()) {
        Some(raw) if !raw.is_empty() => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}
