//! Close executor: turns "close this position" into an exchange fill.
//!
//! # Cascade
//!
//! ```text
//! market (reduce-only) ──fail×N──▶ limit_aggressive (IOC) ──fail×N──▶ limit_maker (post-only)
//!        │                                 │                                  │
//!        └──── permanent error anywhere: abort ◀──────────────────────────────┘
//! ```
//!
//! Each order type gets `max_attempts` tries. The wait between tries depends
//! on the failure class (see [`RetryPolicy`]). A validation failure (empty
//! book, bad ticker) skips straight to the next order type.
//!
//! A close succeeds only once the whole amount has filled. An accepted order
//! that fills nothing or part of the amount (an expired IOC, a resting maker
//! order) is a transient failure; the next attempt is sized to what is left.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_domain::{EngineEvent, ExchangeId, OrderSide, Quantity, Side, Symbol};

use crate::error::{ErrorClass, ExecError, ExecResult};
use crate::ports::{ExchangePort, Gateways, OrderRequest, PlacedOrder};
use crate::retry::RetryPolicy;
use crate::rounding::round_price;
use crate::sink::{EventSink, NoopEventSink};

// =============================================================================
// Order types and results
// =============================================================================

/// Order type used by one stage of the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOrderType {
    /// Reduce-only market order
    Market,
    /// IOC limit priced through the last trade
    LimitAggressive,
    /// Post-only limit at the best same-side level
    LimitMaker,
}

impl CloseOrderType {
    /// Cascade order
    pub const CASCADE: [CloseOrderType; 3] =
        [CloseOrderType::Market, CloseOrderType::LimitAggressive, CloseOrderType::LimitMaker];

    /// Snake-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseOrderType::Market => "market",
            CloseOrderType::LimitAggressive => "limit_aggressive",
            CloseOrderType::LimitMaker => "limit_maker",
        }
    }
}

impl fmt::Display for CloseOrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `execute_close` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    /// Whether the full amount was executed
    pub success: bool,
    /// Exchange order id on success
    pub order_id: Option<String>,
    /// Order type that succeeded (or was last tried)
    pub order_type: Option<CloseOrderType>,
    /// Fill price if known
    pub fill_price: Option<Decimal>,
    /// Executed amount
    pub executed_amount: Decimal,
    /// Last error message on failure
    pub error_message: Option<String>,
    /// Last error code on failure
    pub error_code: Option<String>,
    /// Class of the last error on failure
    pub error_class: Option<ErrorClass>,
    /// Orders attempted across the cascade
    pub attempts: u32,
    /// Wall time spent
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl OrderResult {
    fn failure(
        error: &ExecError,
        order_type: Option<CloseOrderType>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            order_id: None,
            order_type,
            fill_price: None,
            executed_amount: Decimal::ZERO,
            error_message: Some(error.to_string()),
            error_code: Some(error.error_code()),
            error_class: Some(error.class()),
            attempts,
            elapsed,
        }
    }
}

// =============================================================================
// Configuration and stats
// =============================================================================

/// Executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseConfig {
    /// Attempt budget and delays
    pub retry: RetryPolicy,
    /// Fraction the aggressive limit is priced through the last trade
    pub limit_slippage: Decimal,
    /// Order book depth requested before limit orders
    pub book_depth: usize,
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            limit_slippage: Decimal::new(2, 3),
            book_depth: 5,
        }
    }
}

#[derive(Default)]
struct Counters {
    requested: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    permanent_failures: AtomicU64,
    validation_failures: AtomicU64,
    transient_failures: AtomicU64,
    unknown_failures: AtomicU64,
    market_fills: AtomicU64,
    limit_aggressive_fills: AtomicU64,
    limit_maker_fills: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of executor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// `execute_close` calls
    pub closes_requested: u64,
    /// Closes whose full amount filled
    pub closes_succeeded: u64,
    /// Closes that exhausted or aborted the cascade
    pub closes_failed: u64,
    /// Orders attempted
    pub attempts: u64,
    /// Waits taken before a retry
    pub retries: u64,
    /// Rate-limit responses
    pub rate_limited: u64,
    /// Permanent failures
    pub permanent_failures: u64,
    /// Pre-placement check failures
    pub validation_failures: u64,
    /// Network, timeout and unfilled-order failures
    pub transient_failures: u64,
    /// Failures no rule could classify
    pub unknown_failures: u64,
    /// Successes by market orders
    pub market_fills: u64,
    /// Successes by aggressive limits
    pub limit_aggressive_fills: u64,
    /// Successes by maker limits
    pub limit_maker_fills: u64,
}

// =============================================================================
// OrderExecutor
// =============================================================================

/// Executes close intents through the order type cascade.
pub struct OrderExecutor {
    gateways: Gateways,
    config: CloseConfig,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    counters: Counters,
}

impl OrderExecutor {
    /// Executor with no event sink and its own cancellation token.
    pub fn new(gateways: Gateways, config: CloseConfig) -> Self {
        Self {
            gateways,
            config,
            events: Arc::new(NoopEventSink),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Record outcomes through `events`
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Abort waits when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Configured gateways
    pub fn gateways(&self) -> &Gateways {
        &self.gateways
    }

    /// Gateway for `exchange`
    pub fn gateway(&self, exchange: &ExchangeId) -> Option<Arc<dyn ExchangePort>> {
        self.gateways.get(exchange).cloned()
    }

    /// Close `amount` of a `position_side` position on `exchange`.
    ///
    /// Never returns an error: the result carries success or the last failure.
    pub async fn execute_close(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
        position_side: Side,
        amount: Quantity,
        reason: &str,
    ) -> OrderResult {
        let started = Instant::now();
        bump(&self.counters.requested);

        let Some(gateway) = self.gateway(exchange) else {
            let err = ExecError::UnknownExchange(exchange.clone());
            error!(%symbol, %exchange, "Close requested for unconfigured exchange");
            bump(&self.counters.permanent_failures);
            return self.finish_failure(symbol, exchange, reason, &err, None, 0, started).await;
        };

        let side = position_side.exit_action();
        let amount = amount.as_decimal();
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut remaining = amount;
        let mut executed = Decimal::ZERO;
        let mut attempts = 0u32;
        let mut last: Option<(ExecError, CloseOrderType)> = None;

        info!(%symbol, %exchange, %side, %amount, reason, "Executing close");

        'cascade: for order_type in CloseOrderType::CASCADE {
            for attempt in 1..=max_attempts {
                if self.cancel.is_cancelled() {
                    last = Some((ExecError::Cancelled, order_type));
                    break 'cascade;
                }

                attempts += 1;
                bump(&self.counters.attempts);

                let err = match self.place(gateway.as_ref(), order_type, symbol, side, remaining).await
                {
                    Ok((placed, limit_price)) => {
                        let filled = placed.filled.max(Decimal::ZERO).min(remaining);
                        executed += filled;
                        remaining -= filled;

                        if remaining <= Decimal::ZERO {
                            let result = OrderResult {
                                success: true,
                                fill_price: placed.average_price.or(limit_price),
                                executed_amount: executed,
                                order_id: Some(placed.id),
                                order_type: Some(order_type),
                                error_message: None,
                                error_code: None,
                                error_class: None,
                                attempts,
                                elapsed: started.elapsed(),
                            };
                            return self.finish_success(symbol, exchange, reason, result).await;
                        }

                        ExecError::Unfilled(format!(
                            "order {} filled {} of {}, {} still open",
                            placed.id,
                            filled,
                            filled + remaining,
                            remaining
                        ))
                    },
                    Err(err) => err,
                };

                let class = err.class();
                warn!(
                    %symbol,
                    %exchange,
                    order_type = %order_type,
                    attempt,
                    class = %class,
                    error = %err,
                    "Close attempt failed"
                );

                match class {
                    ErrorClass::Permanent => bump(&self.counters.permanent_failures),
                    ErrorClass::RateLimited => bump(&self.counters.rate_limited),
                    ErrorClass::Validation => bump(&self.counters.validation_failures),
                    ErrorClass::Transient => bump(&self.counters.transient_failures),
                    ErrorClass::Unknown => bump(&self.counters.unknown_failures),
                }

                let delay = self.config.retry.delay_for(class, attempt);
                last = Some((err, order_type));

                match delay {
                    None if class == ErrorClass::Permanent => break 'cascade,
                    None => break,
                    Some(delay) if attempt < max_attempts => {
                        bump(&self.counters.retries);
                        if !self.pause(delay).await {
                            last = Some((ExecError::Cancelled, order_type));
                            break 'cascade;
                        }
                    },
                    Some(_) => {},
                }
            }
        }

        let (err, order_type) = match last {
            Some((err, order_type)) => (err, Some(order_type)),
            None => (ExecError::OrderRejected("cascade exhausted".to_string()), None),
        };
        let mut result = self
            .finish_failure(symbol, exchange, reason, &err, order_type, attempts, started)
            .await;
        result.executed_amount = executed;
        result
    }

    /// Counter snapshot
    pub fn stats(&self) -> ExecutorStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ExecutorStats {
            closes_requested: load(&c.requested),
            closes_succeeded: load(&c.succeeded),
            closes_failed: load(&c.failed),
            attempts: load(&c.attempts),
            retries: load(&c.retries),
            rate_limited: load(&c.rate_limited),
            permanent_failures: load(&c.permanent_failures),
            validation_failures: load(&c.validation_failures),
            transient_failures: load(&c.transient_failures),
            unknown_failures: load(&c.unknown_failures),
            market_fills: load(&c.market_fills),
            limit_aggressive_fills: load(&c.limit_aggressive_fills),
            limit_maker_fills: load(&c.limit_maker_fills),
        }
    }

    /// Build and place one order. Returns the fill and the limit price used.
    async fn place(
        &self,
        gateway: &dyn ExchangePort,
        order_type: CloseOrderType,
        symbol: &Symbol,
        side: OrderSide,
        amount: Decimal,
    ) -> ExecResult<(PlacedOrder, Option<Decimal>)> {
        let request = match order_type {
            CloseOrderType::Market => OrderRequest::market_close(symbol.clone(), side, amount),
            CloseOrderType::LimitAggressive => {
                let (_, last) = self.limit_preconditions(gateway, symbol).await?;
                let factor = match side {
                    OrderSide::Sell => Decimal::ONE - self.config.limit_slippage,
                    OrderSide::Buy => Decimal::ONE + self.config.limit_slippage,
                };
                OrderRequest::limit_close(symbol.clone(), side, amount, round_price(last * factor))
                    .ioc()
            },
            CloseOrderType::LimitMaker => {
                let (book, _) = self.limit_preconditions(gateway, symbol).await?;
                let level = match side {
                    OrderSide::Sell => book.best_ask(),
                    OrderSide::Buy => book.best_bid(),
                };
                let price = level.ok_or_else(|| {
                    ExecError::Precondition(format!("no resting levels to join for {}", side))
                })?;
                self.cancel_resting_exits(gateway, symbol, side).await;
                OrderRequest::limit_close(symbol.clone(), side, amount, round_price(price))
                    .post_only()
            },
        };

        debug!(%request, order_type = %order_type, "Placing close order");
        let placed = gateway.create_order(&request).await?;
        Ok((placed, request.price))
    }

    async fn limit_preconditions(
        &self,
        gateway: &dyn ExchangePort,
        symbol: &Symbol,
    ) -> ExecResult<(crate::ports::OrderBook, Decimal)> {
        let book = gateway.fetch_order_book(symbol, self.config.book_depth).await?;
        if book.is_empty() {
            return Err(ExecError::Precondition(format!("empty order book for {}", symbol)));
        }
        let ticker = gateway.fetch_ticker(symbol).await?;
        if ticker.last <= Decimal::ZERO {
            return Err(ExecError::Precondition(format!(
                "non-positive ticker price {} for {}",
                ticker.last, symbol
            )));
        }
        Ok((book, ticker.last))
    }

    /// Cancel reduce-only orders resting on the exit side so maker retries do
    /// not stack. Failures are logged only.
    async fn cancel_resting_exits(&self, gateway: &dyn ExchangePort, symbol: &Symbol, side: OrderSide) {
        let orders = match gateway.fetch_open_orders(Some(symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(%symbol, error = %e, "Could not list open orders before maker close");
                return;
            },
        };

        for order in orders.iter().filter(|o| o.reduce_only && o.side == side) {
            match gateway.cancel_order(symbol, &order.id).await {
                Ok(()) => debug!(%symbol, order_id = %order.id, "Cancelled resting exit order"),
                Err(e) => warn!(%symbol, order_id = %order.id, error = %e, "Cancel failed"),
            }
        }
    }

    /// Sleep unless cancelled first. Returns `false` when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn finish_success(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
        reason: &str,
        result: OrderResult,
    ) -> OrderResult {
        bump(&self.counters.succeeded);
        match result.order_type {
            Some(CloseOrderType::Market) => bump(&self.counters.market_fills),
            Some(CloseOrderType::LimitAggressive) => bump(&self.counters.limit_aggressive_fills),
            Some(CloseOrderType::LimitMaker) => bump(&self.counters.limit_maker_fills),
            None => {},
        }

        info!(
            %symbol,
            %exchange,
            order_type = ?result.order_type,
            order_id = ?result.order_id,
            attempts = result.attempts,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Close order executed"
        );

        self.record(EngineEvent::CloseOrderExecuted {
            symbol: symbol.clone(),
            exchange: exchange.clone(),
            order_id: result.order_id.clone().unwrap_or_default(),
            order_type: result.order_type.map(|t| t.to_string()).unwrap_or_default(),
            fill_price: result.fill_price,
            executed_amount: result.executed_amount,
            attempts: result.attempts,
            elapsed_ms: result.elapsed.as_millis() as u64,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failure(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
        reason: &str,
        err: &ExecError,
        order_type: Option<CloseOrderType>,
        attempts: u32,
        started: Instant,
    ) -> OrderResult {
        bump(&self.counters.failed);
        let result = OrderResult::failure(err, order_type, attempts, started.elapsed());

        error!(
            %symbol,
            %exchange,
            attempts,
            code = ?result.error_code,
            error = %err,
            "Close cascade failed"
        );

        self.record(EngineEvent::CloseOrderFailed {
            symbol: symbol.clone(),
            exchange: exchange.clone(),
            error: err.to_string(),
            error_code: result.error_code.clone(),
            attempts,
            elapsed_ms: result.elapsed.as_millis() as u64,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;

        result
    }

    async fn record(&self, event: EngineEvent) {
        if let Err(e) = self.events.record(event).await {
            warn!(error = %e, "Failed to record close outcome");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
