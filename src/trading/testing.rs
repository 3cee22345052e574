//! Scripted in-memory engine for strategy tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::api::{ExchangeEngine, ExchangeError};
use crate::models::{Direction, InstrumentRules, OrderAck, OrderSide, Position};

use super::config::{ExchangeConfig, ExchangeKind};

/// Engine call observed by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    FetchPosition,
    Open(Direction),
    Close,
}

pub(crate) struct MockEngine {
    symbol: String,
    config: ExchangeConfig,
    rules: InstrumentRules,
    /// Answers to successive position queries; the last one repeats.
    positions: Mutex<VecDeque<Option<Position>>>,
    unreachable: bool,
    open_ok: bool,
    close_ok: bool,
    calls: Mutex<Vec<Call>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self {
            symbol: "ETHUSDT".to_string(),
            config: ExchangeConfig {
                api_key: "mock".to_string(),
                api_secret: "mock".to_string(),
                testnet: true,
                position_size: dec!(100),
                leverage: 10,
                base_url: None,
            },
            rules: InstrumentRules {
                quantity_step: dec!(0.01),
                min_quantity: dec!(0.01),
                max_quantity: None,
                price_tick: dec!(0.01),
            },
            positions: Mutex::new(VecDeque::new()),
            unreachable: false,
            open_ok: true,
            close_ok: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_positions(self, positions: Vec<Option<Position>>) -> Self {
        Self {
            positions: Mutex::new(positions.into()),
            ..self
        }
    }

    pub(crate) fn unreachable(self) -> Self {
        Self {
            unreachable: true,
            ..self
        }
    }

    pub(crate) fn failing_open(self) -> Self {
        Self {
            open_ok: false,
            ..self
        }
    }

    pub(crate) fn failing_close(self) -> Self {
        Self {
            close_ok: false,
            ..self
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_position(&self) -> Option<Position> {
        let mut positions = self.positions.lock().unwrap();
        if positions.len() > 1 {
            positions.pop_front().flatten()
        } else {
            positions.front().cloned().flatten()
        }
    }
}

/// Open position fixture.
pub(crate) fn position(side: Direction) -> Option<Position> {
    Position::open(side, dec!(0.4), dec!(2500), Decimal::ZERO)
}

#[async_trait]
impl ExchangeEngine for MockEngine {
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
        _symbol: &str,
    ) -> Result<InstrumentRules, ExchangeError> {
        Ok(self.rules.clone())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(dec!(1000))
    }

    async fn fetch_position(&self, _symbol: &str) -> Result<Option<Position>, ExchangeError> {
        self.record(Call::FetchPosition);
        if self.unreachable {
            return Err(ExchangeError::Parse("connection refused".to_string()));
        }
        Ok(self.next_position())
    }

    async fn fetch_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(dec!(2500))
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _quantity: Decimal,
        _reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        Ok(OrderAck {
            order_id: "mock-order".to_string(),
            client_order_id: crate::models::new_client_order_id(),
        })
    }

    async fn open_position(&self, direction: Direction) -> bool {
        self.record(Call::Open(direction));
        self.open_ok
    }

    async fn close_position(&self) -> bool {
        self.record(Call::Close);
        self.close_ok
    }
}
