//! Scripted in-process database for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_gatekeeper_mcp::audit::{AuditSink, MemoryAuditWriter};
use db_gatekeeper_mcp::config::QueryLimits;
use db_gatekeeper_mcp::database::{
    CellValue, Column, ColumnSchema, Connector, DatabaseObject, ObjectKind, PoolConfig,
    QueryResult, Session,
};
use db_gatekeeper_mcp::error::{DatabaseError, DbResult};
use db_gatekeeper_mcp::gatekeeper::{Gatekeeper, GatekeeperBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Shared state behind every session the mock hands out.
#[derive(Default)]
pub struct MockDb {
    pub connects: AtomicUsize,
    pub fetches: AtomicUsize,
    pub describes: AtomicUsize,
    pub listings: AtomicUsize,
    pub cancels: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    /// Rows every query has available before the limit applies.
    pub available_rows: AtomicUsize,
    pub fail_next: AtomicBool,
    pub delay: Mutex<Duration>,
    pub executed: Mutex<Vec<String>>,
    pub tables: Mutex<HashMap<String, Vec<ColumnSchema>>>,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        let db = Self::default();
        db.available_rows.store(50, Ordering::SeqCst);
        db.tables.lock().insert(
            "users".into(),
            vec![
                ColumnSchema::new("created_at", "timestamp with time zone", true, 3),
                ColumnSchema::new("id", "bigint", false, 1),
                ColumnSchema::new("email", "text", false, 2),
            ],
        );
        Arc::new(db)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn describes(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    pub db: Arc<MockDb>,
}

struct MockSession {
    db: Arc<MockDb>,
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> DbResult<Box<dyn Session>> {
        self.db.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            db: Arc::clone(&self.db),
        }))
    }
}

/// Decrements `in_flight` even when the fetch future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn fetch(&self, sql: &str, max_rows: u64) -> DbResult<QueryResult> {
        self.db.fetches.fetch_add(1, Ordering::SeqCst);
        self.db.executed.lock().push(sql.to_string());

        let now = self.db.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.db.in_flight);
        self.db.peak.fetch_max(now, Ordering::SeqCst);

        let delay = *self.db.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.db.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::QueryFailed("relation \"t\" does not exist".into()));
        }

        let available = self.db.available_rows.load(Ordering::SeqCst) as u64;
        let rows = (0..available.min(max_rows))
            .map(|i| vec![CellValue::Int(i as i64), CellValue::String(format!("row-{i}"))])
            .collect();
        Ok(QueryResult::new(
            vec![Column::new("id", "int8"), Column::new("label", "text")],
            rows,
            1,
        ))
    }

    async fn describe_table(&self, table: &str) -> DbResult<Vec<ColumnSchema>> {
        self.db.describes.fetch_add(1, Ordering::SeqCst);
        self.db
            .tables
            .lock()
            .get(&table.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))
    }

    async fn list_objects(&self, kind: ObjectKind) -> DbResult<Vec<DatabaseObject>> {
        self.db.listings.fetch_add(1, Ordering::SeqCst);
        if self.db.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionLost("server closed the connection".into()));
        }
        Ok(match kind {
            ObjectKind::Table => self
                .db
                .tables
                .lock()
                .keys()
                .map(|name| DatabaseObject::new("public", name.clone()))
                .collect(),
            ObjectKind::View => vec![DatabaseObject::new("reporting", "active_users")],
        })
    }

    async fn cancel(&self) -> DbResult<()> {
        self.db.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

pub struct Harness {
    pub gatekeeper: Arc<Gatekeeper>,
    pub db: Arc<MockDb>,
    pub audit: MemoryAuditWriter,
}

impl Harness {
    pub async fn audit_events(&self) -> Vec<db_gatekeeper_mcp::audit::AuditEvent> {
        self.gatekeeper.audit().flush().await.expect("audit sink open");
        self.audit.events()
    }
}

/// Small limits so tests stay fast: max 20 rows, default 10, 1s timeout.
pub fn limits() -> QueryLimits {
    QueryLimits {
        query_timeout: Duration::from_secs(1),
        max_rows: 20,
        default_row_limit: 10,
    }
}

pub fn pool(max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size: 0,
        max_size,
        checkout_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn builder(db: &Arc<MockDb>, audit: &MemoryAuditWriter) -> GatekeeperBuilder {
    Gatekeeper::builder()
        .connector(Arc::new(MockConnector { db: Arc::clone(db) }))
        .audit_sink(AuditSink::spawn(audit.clone(), 64))
        .pool(pool(4))
        .limits(limits())
        .rate_limit(100, Duration::from_secs(60))
}

pub fn harness_with(configure: impl FnOnce(GatekeeperBuilder) -> GatekeeperBuilder) -> Harness {
    let db = MockDb::new();
    let audit = MemoryAuditWriter::new();
    let gatekeeper = configure(builder(&db, &audit))
        .build()
        .expect("valid gatekeeper");
    Harness {
        gatekeeper: Arc::new(gatekeeper),
        db,
        audit,
    }
}

pub fn harness() -> Harness {
    harness_with(|b| b)
}
