//! The public operations and the pipeline behind them.
//!
//! Every request moves through validation, rate limiting, pooled execution
//! and auditing in that order. Nothing reaches the database before the
//! statement has been classified as a single read, and every request ends
//! with exactly one audit event, including requests abandoned mid-flight.

mod lifecycle;
mod request;

pub use lifecycle::{InvalidTransition, RequestLifecycle, RequestState};
pub use request::{Request, RequestedLimit};

use crate::audit::{AuditEvent, AuditSink, CANCELLED, Operation};
use crate::config::{GatekeeperConfig, QueryLimits, RateLimitConfig};
use crate::database::{
    Column, ColumnSchema, Connector, ConnectionPool, DatabaseObject, ObjectKind, PoolConfig, Row,
};
use crate::error::{ConfigError, ConfigResult, DatabaseError, GatekeeperError};
use crate::security::{
    ComplexityGuard, ComplexityLimits, RateDecision, RateLimiter, StatementClassifier,
    ValidationVerdict,
};
use chrono::Utc;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// Longest table name echoed into the audit trail.
const MAX_SUBJECT_CHARS: usize = 256;

/// Audit subject of a call whose arguments never decoded.
const MALFORMED_SUBJECT: &str = "<invalid arguments>";

/// Rows returned by `execute_query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub row_count: u64,
    /// The effective limit was reached, more rows may exist.
    pub truncated: bool,
    pub execution_time_ms: u64,
}

/// Columns returned by `describe_table`, in ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescription {
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
}

/// User tables or views returned by `list_objects`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectListing {
    pub kind: ObjectKind,
    pub count: usize,
    pub objects: Vec<DatabaseObject>,
}

/// Read-only access point to the database.
pub struct Gatekeeper {
    classifier: StatementClassifier,
    complexity: ComplexityGuard,
    rate_limiter: RateLimiter,
    pool: ConnectionPool,
    audit: AuditSink,
    limits: QueryLimits,
}

impl Gatekeeper {
    pub fn builder() -> GatekeeperBuilder {
        GatekeeperBuilder::new()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Run a single read statement on behalf of `client_id`.
    #[instrument(skip_all, fields(client_id = %client_id))]
    pub async fn execute_query(
        &self,
        client_id: &str,
        statement: &str,
        limit: RequestedLimit,
    ) -> Result<QueryResponse, GatekeeperError> {
        let request = Request::new(client_id, Operation::Query, statement, limit.clone());
        let mut tracker = Tracker::new(request, self.audit.clone(), StatementClassifier::redact(statement));
        debug!(request_id = %tracker.request.request_id, "Query received");

        let requested = match limit {
            RequestedLimit::Absent => None,
            RequestedLimit::Rows(n) => Some(n),
            RequestedLimit::Invalid(given) => {
                tracker.step(RequestState::Rejected);
                return tracker.fail(GatekeeperError::InvalidLimit(given)).await;
            }
        };

        tracker.step(RequestState::Classifying);
        let verdict = self.admit(statement);
        if !verdict.redacted_text.is_empty() {
            tracker.subject = verdict.redacted_text.clone();
        }
        if !verdict.allowed {
            tracker.step(RequestState::Rejected);
            tracker.message = verdict.detail.clone();
            return tracker.fail(GatekeeperError::Validation(verdict.reason)).await;
        }

        self.throttle(&mut tracker).await?;

        tracker.step(RequestState::Executing);
        let effective = self.limits.effective_limit(requested);
        tracker.effective_limit = Some(effective);

        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                tracker.step(RequestState::Failed);
                return tracker.fail(e.into()).await;
            }
        };

        let result = self
            .pool
            .execute(&mut conn, &verdict.executable_text, effective, self.limits.query_timeout)
            .await;

        match result {
            Ok(mut result) => {
                self.pool.checkin(conn, true);
                // The session bounds the rows itself; never hand out more.
                result.rows.truncate(effective as usize);
                let row_count = result.rows.len() as u64;
                let response = QueryResponse {
                    columns: result.columns,
                    rows: result.rows,
                    row_count,
                    truncated: effective > 0 && row_count == effective,
                    execution_time_ms: result.execution_time_ms,
                };
                tracker.step(RequestState::Succeeded);
                tracker.succeed(row_count).await?;
                info!(
                    request_id = %tracker.request.request_id,
                    rows = row_count,
                    truncated = response.truncated,
                    "Query completed"
                );
                Ok(response)
            }
            Err(e) => {
                self.pool.checkin(conn, false);
                log_execution_error(&tracker.request, &e);
                tracker.step(timeout_or_failed(&e));
                tracker.fail(e.into()).await
            }
        }
    }

    /// Describe the columns of one table on behalf of `client_id`.
    #[instrument(skip_all, fields(client_id = %client_id))]
    pub async fn describe_table(
        &self,
        client_id: &str,
        table_name: &str,
    ) -> Result<TableDescription, GatekeeperError> {
        let request = Request::new(client_id, Operation::Describe, table_name, RequestedLimit::Absent);
        let subject: String = table_name.trim().chars().take(MAX_SUBJECT_CHARS).collect();
        let mut tracker = Tracker::new(request, self.audit.clone(), subject);
        debug!(request_id = %tracker.request.request_id, "Describe received");

        tracker.step(RequestState::Classifying);
        let verdict = self.classifier.validate_identifier(table_name);
        if !verdict.allowed {
            tracker.step(RequestState::Rejected);
            tracker.message = verdict.detail.clone();
            return tracker.fail(GatekeeperError::Validation(verdict.reason)).await;
        }

        self.throttle(&mut tracker).await?;

        tracker.step(RequestState::Executing);
        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                tracker.step(RequestState::Failed);
                return tracker.fail(e.into()).await;
            }
        };

        let table = verdict.normalized_text;
        let result = self
            .pool
            .describe(&mut conn, &table, self.limits.query_timeout)
            .await;

        match result {
            Ok(mut columns) => {
                self.pool.checkin(conn, true);
                columns.sort_by_key(|c| c.position);
                tracker.step(RequestState::Succeeded);
                tracker.succeed(columns.len() as u64).await?;
                Ok(TableDescription {
                    table_name: table,
                    columns,
                })
            }
            Err(e) => {
                // A missing table is an empty answer, the session is fine.
                let healthy = matches!(e, DatabaseError::TableNotFound(_));
                self.pool.checkin(conn, healthy);
                log_execution_error(&tracker.request, &e);
                tracker.step(timeout_or_failed(&e));
                tracker.fail(e.into()).await
            }
        }
    }

    /// List the user tables or views on behalf of `client_id`. System
    /// schemas are never part of the answer.
    #[instrument(skip_all, fields(client_id = %client_id, kind = ?kind))]
    pub async fn list_objects(
        &self,
        client_id: &str,
        kind: ObjectKind,
    ) -> Result<ObjectListing, GatekeeperError> {
        let request = Request::new(client_id, Operation::ListObjects, kind.plural(), RequestedLimit::Absent);
        let mut tracker = Tracker::new(request, self.audit.clone(), kind.plural().to_string());
        debug!(request_id = %tracker.request.request_id, "Listing received");

        // The kind is a closed set, there is no caller text to classify.
        tracker.step(RequestState::Classifying);
        self.throttle(&mut tracker).await?;

        tracker.step(RequestState::Executing);
        let mut conn = match self.pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                tracker.step(RequestState::Failed);
                return tracker.fail(e.into()).await;
            }
        };

        let result = self
            .pool
            .list_objects(&mut conn, kind, self.limits.query_timeout)
            .await;

        match result {
            Ok(objects) => {
                self.pool.checkin(conn, true);
                tracker.step(RequestState::Succeeded);
                tracker.succeed(objects.len() as u64).await?;
                Ok(ObjectListing {
                    kind,
                    count: objects.len(),
                    objects,
                })
            }
            Err(e) => {
                self.pool.checkin(conn, false);
                log_execution_error(&tracker.request, &e);
                tracker.step(timeout_or_failed(&e));
                tracker.fail(e.into()).await
            }
        }
    }

    /// Audit a tool call whose arguments could not be decoded and refuse it.
    /// `detail` must not echo argument values.
    pub async fn reject_arguments<T>(
        &self,
        client_id: &str,
        operation: Operation,
        detail: &str,
    ) -> Result<T, GatekeeperError> {
        let request = Request::new(client_id, operation, "", RequestedLimit::Absent);
        let mut tracker = Tracker::new(request, self.audit.clone(), MALFORMED_SUBJECT.into());
        tracker.step(RequestState::Rejected);
        tracker
            .fail(GatekeeperError::InvalidArguments(detail.to_string()))
            .await
    }

    /// Classification followed by the complexity ceilings.
    fn admit(&self, statement: &str) -> ValidationVerdict {
        let verdict = self.classifier.classify(statement);
        self.complexity.check(&verdict)
    }

    /// Charge one request to the client's window. Only validated requests
    /// get here.
    async fn throttle(&self, tracker: &mut Tracker) -> Result<(), GatekeeperError> {
        match self.rate_limiter.try_acquire(&tracker.request.client_id) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after } => {
                tracker.step(RequestState::RateLimited);
                tracker.fail(GatekeeperError::RateLimited { retry_after }).await
            }
        }
    }

    /// Periodically forget clients idle for longer than two windows.
    pub fn spawn_limiter_purge(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gatekeeper) = weak.upgrade() else {
                    break;
                };
                let idle = gatekeeper.rate_limiter.window() * 2;
                gatekeeper.rate_limiter.purge_idle(idle);
            }
        })
    }
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("pool", &self.pool)
            .field("limits", &self.limits)
            .finish()
    }
}

fn log_execution_error(request: &Request, err: &DatabaseError) {
    if err.is_connection_loss() {
        error!(request_id = %request.request_id, error = %err, "Database session lost");
    } else {
        debug!(request_id = %request.request_id, error = %err, "Statement failed");
    }
}

fn timeout_or_failed(err: &DatabaseError) -> RequestState {
    match err {
        DatabaseError::Timeout(_) => RequestState::TimedOut,
        _ => RequestState::Failed,
    }
}

/// Carries one request to its audit event. Dropping it before an outcome
/// was recorded writes a `CANCELLED` event instead.
struct Tracker {
    request: Request,
    lifecycle: RequestLifecycle,
    sink: AuditSink,
    subject: String,
    effective_limit: Option<u64>,
    message: Option<String>,
}

impl Tracker {
    fn new(request: Request, sink: AuditSink, subject: String) -> Self {
        Self {
            request,
            lifecycle: RequestLifecycle::new(),
            sink,
            subject,
            effective_limit: None,
            message: None,
        }
    }

    fn step(&mut self, next: RequestState) {
        if let Err(e) = self.lifecycle.advance(next) {
            error!(request_id = %self.request.request_id, error = %e, "Request lifecycle violated");
            debug_assert!(false, "{e}");
        }
    }

    fn event(&self, outcome: Cow<'static, str>, row_count: Option<u64>) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            request_id: self.request.request_id,
            client_id: self.request.client_id.clone(),
            operation: self.request.operation,
            subject: self.subject.clone(),
            requested_limit: self.request.requested_limit.clone(),
            effective_limit: self.effective_limit,
            allowed: outcome == "OK",
            outcome: outcome.into_owned(),
            row_count,
            duration_ms: self.request.elapsed_ms(),
            message: self.message.clone(),
        }
    }

    async fn record(&mut self, event: AuditEvent) -> Result<(), GatekeeperError> {
        let recorded = self.sink.record(event).await;
        self.step(RequestState::Audited);
        self.step(RequestState::Done);
        recorded.map_err(|e| {
            error!(request_id = %self.request.request_id, error = %e, "Audit event could not be recorded");
            GatekeeperError::Execution("audit trail unavailable".into())
        })
    }

    async fn succeed(&mut self, row_count: u64) -> Result<(), GatekeeperError> {
        let event = self.event("OK".into(), Some(row_count));
        self.record(event).await
    }

    async fn fail<T>(&mut self, err: GatekeeperError) -> Result<T, GatekeeperError> {
        if self.message.is_none() {
            self.message = Some(err.to_string());
        }
        if !err.is_security_event() {
            info!(request_id = %self.request.request_id, code = %err.code(), error = %err, "Request failed");
        }
        let event = self.event(err.code(), None);
        self.record(event).await?;
        Err(err)
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if self.lifecycle.is_audited() {
            return;
        }
        debug!(request_id = %self.request.request_id, state = ?self.lifecycle.state(), "Request abandoned");
        self.message = Some(format!("abandoned while {:?}", self.lifecycle.state()));
        let event = self.event(CANCELLED.into(), None);
        self.step(RequestState::Audited);
        if let Err(e) = self.sink.try_record(event) {
            error!(request_id = %self.request.request_id, error = %e, "Cancellation could not be audited");
        }
    }
}

/// Builder for [`Gatekeeper`].
pub struct GatekeeperBuilder {
    connector: Option<Arc<dyn Connector>>,
    audit: Option<AuditSink>,
    pool: PoolConfig,
    rate_limit: RateLimitConfig,
    limits: QueryLimits,
    complexity: ComplexityLimits,
}

impl Default for GatekeeperBuilder {
    fn default() -> Self {
        Self {
            connector: None,
            audit: None,
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            limits: QueryLimits::default(),
            complexity: ComplexityLimits::default(),
        }
    }
}

impl GatekeeperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take pool, rate limit, row/time and complexity settings from `config`.
    pub fn config(mut self, config: &GatekeeperConfig) -> Self {
        self.pool = config.pool.clone();
        self.rate_limit = config.rate_limit;
        self.limits = config.limits;
        self.complexity = config.complexity;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn audit_sink(mut self, sink: AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit = RateLimitConfig { max_requests, window };
        self
    }

    pub fn limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn complexity(mut self, complexity: ComplexityLimits) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn build(self) -> ConfigResult<Gatekeeper> {
        let connector = self
            .connector
            .ok_or(ConfigError::MissingField("connector".into()))?;
        let audit = self
            .audit
            .ok_or(ConfigError::MissingField("audit_sink".into()))?;
        if self.limits.max_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_rows".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.limits.query_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "query_timeout".into(),
                message: "must be greater than 0".into(),
            });
        }

        Ok(Gatekeeper {
            classifier: StatementClassifier::new(),
            complexity: ComplexityGuard::new(self.complexity),
            rate_limiter: RateLimiter::new(self.rate_limit.max_requests, self.rate_limit.window),
            pool: ConnectionPool::new(connector, self.pool),
            audit,
            limits: self.limits,
        })
    }
}
