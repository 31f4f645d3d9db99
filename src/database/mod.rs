//! Database abstraction layer.
//!
//! The gatekeeper only talks to [`ConnectionPool`]; backends plug in through
//! the [`Connector`] and [`Session`] traits.
//!
//! # Feature Flags
//!
//! - `postgres` - Enable the PostgreSQL backend (enabled by default)

pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod result;
pub mod traits;

pub use pool::{
    ConnectionPool, PoolConfig, PoolMetrics, PoolMetricsSnapshot, PoolStatus, PooledConnection,
    SlotState,
};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnector, PostgresSession};
pub use result::*;
pub use traits::{Connector, Session};
