//! Common library for the up/down trader.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling and migrations
//! - Coinbase, Gamma and CLOB API clients behind capability traits
//! - Order signing
//! - The transactional state store (Postgres + in-memory)
//! - Shared data models and the injectable clock

pub mod clob;
pub mod clock;
pub mod coinbase;
pub mod config;
pub mod db;
pub mod gamma;
pub mod models;
pub mod signer;
pub mod store;

pub use clob::{ClobClient, ClobError, OrderVenue, VenueAck, VenueOrder, VenueOrderStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coinbase::{CandleData, CoinbaseClient, FeedError, PriceSource};
pub use config::{Config, ConfigError, Credentials};
pub use db::{Database, DbError};
pub use gamma::{GammaClient, GammaError, GammaEvent, GammaMarket, MarketSource};
pub use signer::{OrderSigner, SignerError, WalletSigner};
pub use store::{MemStore, PgStore, StateStore, StoreError};

#[cfg(any(test, feature = "mocks"))]
pub use clob::MockOrderVenue;
#[cfg(any(test, feature = "mocks"))]
pub use coinbase::MockPriceSource;
#[cfg(any(test, feature = "mocks"))]
pub use gamma::MockMarketSource;
#[cfg(any(test, feature = "mocks"))]
pub use signer::MockOrderSigner;
