//! Exchange engine contract shared by every supported exchange.
//!
//! Each exchange implements the fallible primitives (`fetch_*`,
//! `set_leverage`, `place_market_order`). The provided methods layer the
//! trading rules on top of them:
//! - remote failures are logged and turned into safe defaults
//!   (zero balance, zero price, no position, `false`)
//! - quantities are rounded to the instrument's lot step before any order
//! - opening checks price, balance and minimum size before sending an order

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::models::{Direction, InstrumentRules, OrderAck, OrderSide, Position};
use crate::trading::{ExchangeConfig, ExchangeKind};

use super::error::{ExchangeError, OpenError};

#[async_trait]
pub trait ExchangeEngine: Send + Sync {
    /// Which exchange this engine talks to.
    fn kind(&self) -> ExchangeKind;

    /// Symbol this engine is bound to.
    fn symbol(&self) -> &str;

    /// Quantization rules fetched when the engine connected.
    fn rules(&self) -> &InstrumentRules;

    /// Sizing and leverage settings.
    fn settings(&self) -> &ExchangeConfig;

    /// Fetch lot/tick rules. Fails with `ExchangeError::RuleLookup` for an
    /// unknown symbol.
    async fn fetch_instrument_rules(
        &self,
        symbol: &str,
    ) -> Result<InstrumentRules, ExchangeError>;

    /// Set leverage. "Leverage already set" is reported as success.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// USDT wallet balance.
    async fn fetch_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Open position, `Ok(None)` when flat.
    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    /// Last traded price.
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Send a market order and wait for the exchange's acknowledgement.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;

    /// Wallet balance, or zero if it could not be fetched.
    async fn get_account_balance(&self) -> Decimal {
        match self.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                error!(exchange = %self.kind(), error = %e, "Failed to fetch account balance");
                Decimal::ZERO
            }
        }
    }

    /// Current position, or `None` when flat *or* when the query failed.
    async fn get_current_position(&self, symbol: &str) -> Option<Position> {
        match self.fetch_position(symbol).await {
            Ok(position) => position,
            Err(e) => {
                error!(
                    exchange = %self.kind(),
                    symbol = %symbol,
                    error = %e,
                    "Failed to fetch position"
                );
                None
            }
        }
    }

    /// Last price, or zero if it could not be fetched.
    async fn get_current_price(&self, symbol: &str) -> Decimal {
        match self.fetch_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!(
                    exchange = %self.kind(),
                    symbol = %symbol,
                    error = %e,
                    "Failed to fetch price"
                );
                Decimal::ZERO
            }
        }
    }

    fn round_quantity(&self, raw: Decimal) -> Decimal {
        self.rules().round_quantity(raw)
    }

    fn round_price(&self, raw: Decimal) -> Decimal {
        self.rules().round_price(raw)
    }

    /// Order quantity for one position: `position_size * leverage / price`,
    /// rounded to the lot step.
    fn calculate_quantity(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let settings = self.settings();
        let notional = settings.position_size * Decimal::from(settings.leverage);
        let quantity = self.round_quantity(notional / price);

        debug!(
            notional = %notional,
            price = %price,
            quantity = %quantity,
            symbol = %self.symbol(),
            "Calculated order quantity"
        );
        quantity
    }

    /// Open a position, reporting why it could not be opened.
    async fn try_open_position(&self, direction: Direction) -> Result<OrderAck, OpenError> {
        let symbol = self.symbol();

        let price = self.get_current_price(symbol).await;
        if price <= Decimal::ZERO {
            return Err(OpenError::UnusablePrice);
        }

        let quantity = self.calculate_quantity(price);
        let required = self.settings().position_size;
        let balance = self.get_account_balance().await;
        if balance < required {
            return Err(OpenError::InsufficientBalance {
                required,
                available: balance,
            });
        }

        let minimum = self.rules().min_quantity;
        if quantity < minimum {
            return Err(OpenError::BelowMinimumQuantity { quantity, minimum });
        }

        let ack = self
            .place_market_order(symbol, direction.entry_side(), quantity, false)
            .await?;

        info!(
            exchange = %self.kind(),
            symbol = %symbol,
            direction = %direction,
            quantity = %quantity,
            price = %price,
            margin = %required,
            order_id = %ack.order_id,
            "Position opened"
        );
        Ok(ack)
    }

    /// Open a position; `true` only when the exchange accepted the order.
    async fn open_position(&self, direction: Direction) -> bool {
        match self.try_open_position(direction).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    exchange = %self.kind(),
                    symbol = %self.symbol(),
                    direction = %direction,
                    reason = %e,
                    "Failed to open position"
                );
                false
            }
        }
    }

    /// Close the current position with a reduce-only market order.
    /// Succeeds without an order when the exchange reports flat; a failed
    /// position query counts as "not closed".
    async fn close_position(&self) -> bool {
        let symbol = self.symbol();

        let position = match self.fetch_position(symbol).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                debug!(symbol = %symbol, "No open position to close");
                return true;
            }
            Err(e) => {
                error!(
                    exchange = %self.kind(),
                    symbol = %symbol,
                    error = %e,
                    "Failed to fetch position before close"
                );
                return false;
            }
        };

        let quantity = self.round_quantity(position.size);
        match self
            .place_market_order(symbol, position.closing_side(), quantity, true)
            .await
        {
            Ok(ack) => {
                info!(
                    exchange = %self.kind(),
                    symbol = %symbol,
                    side = %position.side,
                    size = %quantity,
                    pnl = %position.unrealized_pnl,
                    order_id = %ack.order_id,
                    "Position closed"
                );
                true
            }
            Err(e) => {
                error!(
                    exchange = %self.kind(),
                    symbol = %symbol,
                    error = %e,
                    "Failed to close position"
                );
                false
            }
        }
    }
}

/// Apply the configured leverage right after connecting. Failures are
/// logged only; the engine stays usable with the exchange's current leverage.
pub(crate) async fn apply_leverage<E>(engine: &E)
where
    E: ExchangeEngine + ?Sized,
{
    let leverage = engine.settings().leverage;
    match engine.set_leverage(engine.symbol(), leverage).await {
        Ok(()) => info!(
            exchange = %engine.kind(),
            symbol = %engine.symbol(),
            leverage = leverage,
            "Leverage set"
        ),
        Err(e) => warn!(
            exchange = %engine.kind(),
            symbol = %engine.symbol(),
            error = %e,
            "Failed to set leverage"
        ),
    }
}
