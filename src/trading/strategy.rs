//! Signal-to-position reconciliation.
//!
//! For every accepted signal the strategy reads the live position and picks
//! one of three actions:
//! - flat: open in the signal's direction
//! - already in the signal's direction: hold
//! - opposite direction: close, wait until the exchange reports flat, open
//!
//! Processing is serialized: the filter lock is held for the whole
//! decide-and-act sequence.

use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::ExchangeEngine;
use crate::models::{Direction, Position, Signal};

use super::config::{flag, parse_or, ConfigError};
use super::filter::SignalFilter;

/// Strategy tuning.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Wait before the first "is it flat yet" poll after a close
    pub settle_delay: Duration,

    /// Give up waiting for the close to settle after this long
    pub settle_timeout: Duration,

    /// Abort instead of assuming flat when the position query fails
    pub strict_position_check: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(10),
            strict_position_check: false,
        }
    }
}

impl StrategyConfig {
    /// Read `SETTLE_DELAY_MS`, `SETTLE_TIMEOUT_MS` and `STRICT_POSITION_CHECK`.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settle_delay_ms: u64 =
            parse_or(lookup, "SETTLE_DELAY_MS", defaults.settle_delay.as_millis() as u64)?;
        let settle_timeout_ms: u64 = parse_or(
            lookup,
            "SETTLE_TIMEOUT_MS",
            defaults.settle_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            settle_delay: Duration::from_millis(settle_delay_ms),
            settle_timeout: Duration::from_millis(settle_timeout_ms),
            strict_position_check: flag(lookup, "STRICT_POSITION_CHECK"),
        })
    }
}

/// Why a signal could not be reconciled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileFailure {
    #[error("signal symbol {signal} does not match engine symbol {engine}")]
    SymbolMismatch { signal: String, engine: String },

    #[error("position query failed: {0}")]
    PositionUnavailable(String),

    #[error("failed to open {0} position")]
    OpenFailed(Direction),

    #[error("failed to close {0} position")]
    CloseFailed(Direction),

    #[error("position still open {0:?} after close")]
    SettlementTimeout(Duration),

    #[error("closed {from} position but failed to open {to}, position is flat")]
    PartialReversal { from: Direction, to: Direction },
}

/// What happened to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Same direction as the last accepted signal; nothing was done
    Filtered,
    /// Position already matched the signal
    AlreadyAligned(Direction),
    /// Opened from flat
    Opened(Direction),
    /// Closed the opposite position and opened the requested one
    Reversed { from: Direction, to: Direction },
    Failed(ReconcileFailure),
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ReconcileOutcome::Failed(_))
    }
}

/// Drives the bound engine toward the direction of each accepted signal.
pub struct PositionStrategy {
    engine: Arc<dyn ExchangeEngine>,
    filter: Mutex<SignalFilter>,
    config: StrategyConfig,
}

impl PositionStrategy {
    pub fn new(engine: Arc<dyn ExchangeEngine>, config: StrategyConfig) -> Self {
        Self {
            engine,
            filter: Mutex::new(SignalFilter::new()),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ExchangeEngine> {
        &self.engine
    }

    /// Direction of the last accepted signal.
    pub async fn last_accepted(&self) -> Option<Direction> {
        self.filter.lock().await.last_accepted()
    }

    /// `true` unless the signal was accepted and the exchange could not be
    /// brought into line with it.
    pub async fn process(&self, signal: &Signal) -> bool {
        self.reconcile(signal).await.is_success()
    }

    pub async fn reconcile(&self, signal: &Signal) -> ReconcileOutcome {
        if signal.symbol != self.engine.symbol() {
            let failure = ReconcileFailure::SymbolMismatch {
                signal: signal.symbol.clone(),
                engine: self.engine.symbol().to_string(),
            };
            warn!(signal = %signal, reason = %failure, "Signal rejected");
            return ReconcileOutcome::Failed(failure);
        }

        let mut filter = self.filter.lock().await;
        if !filter.should_process(signal) {
            return ReconcileOutcome::Filtered;
        }

        let outcome = self.decide(signal).await;
        match &outcome {
            ReconcileOutcome::Failed(reason) => {
                error!(signal = %signal, reason = %reason, "Signal processing failed")
            }
            other => info!(signal = %signal, outcome = ?other, "Signal processed"),
        }
        outcome
    }

    async fn decide(&self, signal: &Signal) -> ReconcileOutcome {
        let target = signal.direction;

        let position = match self.current_position().await {
            Ok(position) => position,
            Err(failure) => return ReconcileOutcome::Failed(failure),
        };

        match position {
            None => self.open_new(target).await,
            Some(position) if position.side == target => {
                info!(
                    side = %position.side,
                    size = %position.size,
                    "Position already in signal direction, holding"
                );
                ReconcileOutcome::AlreadyAligned(target)
            }
            Some(position) => self.reverse(position, target).await,
        }
    }

    async fn current_position(&self) -> Result<Option<Position>, ReconcileFailure> {
        let symbol = self.engine.symbol();
        if self.config.strict_position_check {
            self.engine
                .fetch_position(symbol)
                .await
                .map_err(|e| ReconcileFailure::PositionUnavailable(e.to_string()))
        } else {
            Ok(self.engine.get_current_position(symbol).await)
        }
    }

    async fn open_new(&self, direction: Direction) -> ReconcileOutcome {
        info!(direction = %direction, "No open position, opening");
        if self.engine.open_position(direction).await {
            ReconcileOutcome::Opened(direction)
        } else {
            ReconcileOutcome::Failed(ReconcileFailure::OpenFailed(direction))
        }
    }

    async fn reverse(&self, current: Position, target: Direction) -> ReconcileOutcome {
        info!(
            from = %current.side,
            to = %target,
            size = %current.size,
            "Reversing position"
        );

        if !self.engine.close_position().await {
            return ReconcileOutcome::Failed(ReconcileFailure::CloseFailed(current.side));
        }

        if let Err(failure) = self.wait_until_flat().await {
            return ReconcileOutcome::Failed(failure);
        }

        if self.engine.open_position(target).await {
            ReconcileOutcome::Reversed {
                from: current.side,
                to: target,
            }
        } else {
            error!(from = %current.side, to = %target, "Partial reversal: closed but not reopened");
            ReconcileOutcome::Failed(ReconcileFailure::PartialReversal {
                from: current.side,
                to: target,
            })
        }
    }

    /// Poll the position with exponential backoff until the exchange reports
    /// flat, bounded by `settle_timeout`.
    async fn wait_until_flat(&self) -> Result<(), ReconcileFailure> {
        let timeout = self.config.settle_timeout;
        tokio::time::sleep(self.config.settle_delay).await;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.settle_delay.max(Duration::from_millis(1)))
            .with_max_interval(timeout)
            .with_max_elapsed_time(Some(timeout))
            .build();

        let engine: &dyn ExchangeEngine = self.engine.as_ref();
        let symbol = engine.symbol();
        let poll = move || async move {
            match engine.fetch_position(symbol).await {
                Ok(None) => Ok(()),
                Ok(Some(position)) => {
                    debug!(
                        side = %position.side,
                        size = %position.size,
                        "Waiting for close to settle"
                    );
                    Err(backoff::Error::transient(ReconcileFailure::SettlementTimeout(timeout)))
                }
                Err(e) => {
                    debug!(error = %e, "Position poll failed while settling");
                    Err(backoff::Error::transient(ReconcileFailure::SettlementTimeout(timeout)))
                }
            }
        };

        match tokio::time::timeout(timeout, backoff::future::retry(policy, poll)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileFailure::SettlementTimeout(timeout)),
        }
    }
}
