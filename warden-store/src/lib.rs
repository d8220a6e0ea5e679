//! Warden Storage Layer
//!
//! Persistence for positions, aged-position records and engine events.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing and stub mode
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//! - **Advisory locks**: Serialise check-then-insert per (symbol, exchange)
//!
//! # Usage
//!
//! ```rust
//! use warden_store::{insert_active_exclusive, InsertOutcome, MemoryStore, Store};
//! use warden_domain::{ExchangeId, Position, Price, Quantity, Side, Symbol};
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let position = Position::new_active(
//!         Symbol::from_pair("BTCUSDT").unwrap(),
//!         ExchangeId::new("binance").unwrap(),
//!         Side::Long,
//!         Quantity::new(dec!(0.1)).unwrap(),
//!         Price::new(dec!(95000)).unwrap(),
//!         "12345".to_string(),
//!     );
//!     let outcome = insert_active_exclusive(&store, &position).await.unwrap();
//!     assert_eq!(outcome, InsertOutcome::Inserted);
//!
//!     let active = store.positions().find_active().await.unwrap();
//!     println!("Active positions: {}", active.len());
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod dto;
mod error;
mod lock;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use dto::{AgedPositionRow, PositionRow};
pub use error::StoreError;
pub use lock::{insert_active_exclusive, AdvisoryLock, InsertOutcome, LockKey};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use repository::{AgedPositionRepository, EventRepository, PositionRepository, Store};
