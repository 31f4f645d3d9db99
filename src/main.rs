//! MCP server binary entry point.

use anyhow::{Context, Result};
use db_gatekeeper_mcp::{
    audit::{AuditSink, JsonlAuditWriter},
    config::{GatekeeperConfig, mask_sensitive},
    database::PostgresConnector,
    gatekeeper::Gatekeeper,
    protocol::McpServerBuilder,
    server::{McpHandler, ServerStateBuilder},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const REAPER_INTERVAL: Duration = Duration::from_secs(30);
const LIMITER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = GatekeeperConfig::from_env().context("Invalid configuration")?;
    for warning in config.security_warnings() {
        warn!(target: "security", "{}", warning);
    }
    info!(
        host = %config.database.host,
        port = config.database.port,
        database = %config.database.database,
        username = %config.database.username,
        password = %mask_sensitive("password", &config.database.password),
        pool_max = config.pool.max_size,
        rate_limit = config.rate_limit.max_requests,
        max_rows = config.limits.max_rows,
        "Configuration loaded"
    );

    let audit_writer = JsonlAuditWriter::open(&config.audit.path)
        .await
        .with_context(|| format!("Cannot open audit log {}", config.audit.path.display()))?;
    let audit = AuditSink::spawn(audit_writer, config.audit.channel_capacity);

    let connector = PostgresConnector::new(config.database.clone(), config.limits.query_timeout);
    let gatekeeper = Arc::new(
        Gatekeeper::builder()
            .config(&config)
            .connector(Arc::new(connector))
            .audit_sink(audit.clone())
            .build()?,
    );

    // Start even if the database is down; checkouts retry on demand.
    match gatekeeper.pool().warm_up().await {
        Ok(opened) => info!(opened, "Connection pool warmed up"),
        Err(e) => warn!(error = %e, "Could not open initial connections"),
    }
    let reaper = gatekeeper.pool().spawn_reaper(REAPER_INTERVAL);
    let purge = gatekeeper.spawn_limiter_purge(LIMITER_PURGE_INTERVAL);

    let state = Arc::new(
        ServerStateBuilder::new()
            .config(config)
            .gatekeeper(Arc::clone(&gatekeeper))
            .build()
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    info!("Server state initialized with {} tools", state.tools.len());

    let server = McpServerBuilder::new()
        .handler(McpHandler::new(state))
        .name(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .with_tools()
        .with_resources()
        .build()?;

    info!("MCP server ready on stdio");
    let served = server.run().await;

    reaper.abort();
    purge.abort();
    audit.shutdown().await;
    info!(metrics = ?gatekeeper.pool().metrics(), "Server shutdown complete");

    served?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("db_gatekeeper_mcp=info,warn"));

    // JSON to stderr; stdout carries the protocol.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
