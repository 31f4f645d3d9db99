//! Read-only database gatekeeper for AI agents, served over MCP.
//!
//! Agents get two tools, `query_database` and `describe_table`, and two
//! resources listing the user tables and views. Every statement is classified before it can reach the database, each client is
//! rate limited, sessions come from a bounded pool, and every request lands
//! in an append-only audit trail.
//!
//! # Example
//!
//! ```no_run
//! use db_gatekeeper_mcp::{
//!     audit::{AuditSink, JsonlAuditWriter},
//!     config::GatekeeperConfig,
//!     database::PostgresConnector,
//!     gatekeeper::Gatekeeper,
//!     protocol::McpServerBuilder,
//!     server::{McpHandler, ServerStateBuilder},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatekeeperConfig::from_env()?;
//!     let connector = PostgresConnector::new(config.database.clone(), config.limits.query_timeout);
//!     let audit = AuditSink::spawn(
//!         JsonlAuditWriter::open(&config.audit.path).await?,
//!         config.audit.channel_capacity,
//!     );
//!
//!     let gatekeeper = Arc::new(
//!         Gatekeeper::builder()
//!             .config(&config)
//!             .connector(Arc::new(connector))
//!             .audit_sink(audit.clone())
//!             .build()?,
//!     );
//!
//!     let state = ServerStateBuilder::new()
//!         .config(config)
//!         .gatekeeper(gatekeeper)
//!         .build()
//!         .map_err(|e| anyhow::anyhow!(e))?;
//!
//!     let server = McpServerBuilder::new()
//!         .handler(McpHandler::new(Arc::new(state)))
//!         .with_tools()
//!         .with_resources()
//!         .build()?;
//!
//!     server.run().await?;
//!     audit.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod gatekeeper;
pub mod protocol;
pub mod security;
pub mod server;
pub mod tools;

pub use audit::{AuditEvent, AuditSink};
pub use config::{DatabaseConfig, DatabaseConfigBuilder, GatekeeperConfig};
pub use database::{ConnectionPool, Connector, PoolConfig, Session};
pub use error::{GatekeeperError, McpError, Result};
pub use gatekeeper::{
    Gatekeeper, GatekeeperBuilder, ObjectListing, QueryResponse, RequestedLimit,
    TableDescription,
};
pub use protocol::{McpServer, McpServerBuilder};
pub use security::{ComplexityGuard, RateLimiter, StatementClassifier};
pub use server::{McpHandler, ServerState, ServerStateBuilder};
