//! Warden Execution Layer
//!
//! Guaranteed-best-effort close execution against exchange gateways.
//!
//! # Architecture
//!
//! ```text
//! close intent → OrderExecutor → market / limit_aggressive / limit_maker → ExchangePort
//!                     │
//!                     └── EventSink (close_order_executed / close_order_failed)
//! ```
//!
//! # Components
//!
//! - **Ports**: `ExchangePort` capability trait and exchange-side records
//! - **Error classification**: `ExecError::class()` drives retry decisions
//! - **Retry policy**: cooldown for rate limits, capped exponential backoff
//! - **Executor**: the close cascade
//! - **Stub**: scripted in-memory exchange for tests and stub mode
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_exec::{CloseConfig, Gateways, OrderExecutor, StubExchange};
//!
//! let exchange = Arc::new(StubExchange::new(ExchangeId::new("binance")?));
//! let mut gateways = Gateways::new();
//! gateways.insert(exchange.id().clone(), exchange);
//!
//! let executor = OrderExecutor::new(gateways, CloseConfig::default());
//! let result = executor.execute_close(&symbol, &exchange_id, Side::Long, qty, "manual").await;
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod executor;
pub mod ports;
pub mod retry;
pub mod rounding;
pub mod sink;
pub mod stub;

// Re-exports for convenience
pub use error::{classify_message, ErrorClass, ExecError, ExecResult};
pub use executor::{CloseConfig, CloseOrderType, ExecutorStats, OrderExecutor, OrderResult};
pub use ports::{
    BookLevel, ExchangePort, ExchangePosition, Gateways, OpenOrder, OrderBook, OrderKind,
    OrderRequest, PlacedOrder, Ticker, TimeInForce,
};
pub use retry::RetryPolicy;
pub use rounding::round_price;
pub use sink::{EventSink, NoopEventSink, StoreEventSink};
pub use stub::{StubExchange, StubOrderKind};
