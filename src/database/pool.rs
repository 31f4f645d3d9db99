//! Bounded connection pool.
//!
//! Sessions live in a fixed arena of slots with index free-lists for idle
//! and vacant slots, all behind one mutex. A semaphore with `max_size`
//! permits gates checkout, so the number of issued connections can never
//! exceed the configured bound. Every reserved or in-use slot is backed by
//! exactly one permit, which guarantees a permit holder always finds an
//! idle or vacant slot.

use crate::database::result::{ColumnSchema, DatabaseObject, ObjectKind, QueryResult};
use crate::database::traits::{Connector, Session};
use crate::error::{DatabaseError, DbResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound on waiting for a cancel request after a query timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub checkout_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            checkout_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Pool metrics for monitoring.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections_created: AtomicU32,
    pub connections_closed: AtomicU32,
    pub connection_errors: AtomicU32,
    pub queries_executed: AtomicU32,
    pub query_errors: AtomicU32,
    pub query_timeouts: AtomicU32,
    pub checkout_timeouts: AtomicU32,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            query_timeouts: self.query_timeouts.load(Ordering::Relaxed),
            checkout_timeouts: self.checkout_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub connections_created: u32,
    pub connections_closed: u32,
    pub connection_errors: u32,
    pub queries_executed: u32,
    pub query_errors: u32,
    pub query_timeouts: u32,
    pub checkout_timeouts: u32,
}

/// Pool status information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub min_size: usize,
    /// Slots holding (or currently opening) a session.
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Vacant,
    Idle,
    /// Checked out, or reserved while a session is being opened.
    InUse,
    /// Evicted after a failure; reusable like a vacant slot.
    Broken,
}

struct Slot {
    state: SlotState,
    session: Option<Box<dyn Session>>,
    created_at: Instant,
    last_used_at: Instant,
}

struct Slots {
    slots: Vec<Slot>,
    idle: Vec<usize>,
    vacant: Vec<usize>,
}

impl Slots {
    fn new(size: usize) -> Self {
        let now = Instant::now();
        let slots = (0..size)
            .map(|_| Slot {
                state: SlotState::Vacant,
                session: None,
                created_at: now,
                last_used_at: now,
            })
            .collect();
        // Reversed so the lowest index is handed out first.
        let vacant = (0..size).rev().collect();
        Self {
            slots,
            idle: Vec::with_capacity(size),
            vacant,
        }
    }

    fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Idle | SlotState::InUse))
            .count()
    }

    fn vacate(&mut self, index: usize, state: SlotState) -> Option<Box<dyn Session>> {
        let slot = &mut self.slots[index];
        slot.state = state;
        self.vacant.push(index);
        slot.session.take()
    }
}

enum Claim {
    Idle {
        slot: usize,
        session: Box<dyn Session>,
        created_at: Instant,
        last_used_at: Instant,
    },
    Vacant(usize),
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    slots: Mutex<Slots>,
    permits: Arc<Semaphore>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn claim(&self) -> Option<Claim> {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.idle.pop() {
            let slot = &mut slots.slots[index];
            slot.state = SlotState::InUse;
            return Some(match slot.session.take() {
                Some(session) => Claim::Idle {
                    slot: index,
                    session,
                    created_at: slot.created_at,
                    last_used_at: slot.last_used_at,
                },
                None => Claim::Vacant(index),
            });
        }
        let index = slots.vacant.pop()?;
        slots.slots[index].state = SlotState::InUse;
        Some(Claim::Vacant(index))
    }

    fn is_stale(&self, created_at: Instant, last_used_at: Instant, now: Instant) -> bool {
        now.duration_since(last_used_at) > self.config.idle_timeout
            || now.duration_since(created_at) > self.config.max_lifetime
    }

    /// Returns a slot and its session to the pool. Returns the live count
    /// after the release.
    fn release(&self, index: usize, session: Option<Box<dyn Session>>, healthy: bool) -> usize {
        let healthy = healthy && session.as_ref().is_some_and(|s| !s.is_closed());
        let mut slots = self.slots.lock();

        let discarded = if healthy {
            let slot = &mut slots.slots[index];
            slot.state = SlotState::Idle;
            slot.session = session;
            slot.last_used_at = Instant::now();
            slots.idle.push(index);
            None
        } else {
            slots.vacate(index, SlotState::Broken);
            session
        };
        let live = slots.live();
        drop(slots);

        if discarded.is_some() {
            PoolMetrics::bump(&self.metrics.connections_closed);
            debug!(slot = index, "Discarded unhealthy session");
        }
        live
    }

    async fn open(&self, index: usize) -> DbResult<(Box<dyn Session>, Instant)> {
        match tokio::time::timeout(self.config.checkout_timeout, self.connector.connect()).await {
            Ok(Ok(session)) => {
                PoolMetrics::bump(&self.metrics.connections_created);
                debug!(slot = index, backend = self.connector.name(), "Opened session");
                Ok((session, Instant::now()))
            }
            Ok(Err(e)) => {
                PoolMetrics::bump(&self.metrics.connection_errors);
                error!(slot = index, error = %e, "Failed to open session");
                Err(e)
            }
            Err(_) => {
                PoolMetrics::bump(&self.metrics.connection_errors);
                error!(slot = index, "Timed out opening session");
                Err(DatabaseError::ConnectionFailed(format!(
                    "connect timed out after {}ms",
                    self.config.checkout_timeout.as_millis()
                )))
            }
        }
    }
}

/// Returns a reserved slot to the vacant list unless disarmed. Covers both
/// connect failures and cancelled checkouts.
struct SlotReservation<'a> {
    inner: &'a PoolInner,
    slot: usize,
    armed: bool,
}

impl SlotReservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.slots.lock().vacate(self.slot, SlotState::Vacant);
        }
    }
}

/// A session checked out of the pool.
///
/// Hand it back with [`ConnectionPool::checkin`]. Dropping it instead counts
/// as an unhealthy checkin.
pub struct PooledConnection {
    slot: usize,
    session: Option<Box<dyn Session>>,
    created_at: Instant,
    last_used_at: Instant,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    fn session(&self) -> DbResult<&dyn Session> {
        self.session
            .as_deref()
            .ok_or_else(|| DatabaseError::ConnectionLost("session already released".into()))
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(slot = self.slot, "Connection dropped without checkin");
            let live = self.inner.release(self.slot, Some(session), false);
            ConnectionPool::replenish_if_needed(&self.inner, live);
        }
    }
}

/// Bounded pool of database sessions. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, mut config: PoolConfig) -> Self {
        config.max_size = config.max_size.max(1);
        config.min_size = config.min_size.min(config.max_size);

        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots::new(config.max_size)),
                permits: Arc::new(Semaphore::new(config.max_size)),
                connector,
                config,
                metrics: PoolMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Check out a session, waiting at most the configured checkout timeout
    /// for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::PoolExhausted`] if no permit frees up in time,
    /// or the connector's error if a fresh session cannot be opened.
    #[instrument(skip(self), level = "debug")]
    pub async fn checkout(&self) -> DbResult<PooledConnection> {
        let started = Instant::now();
        let permits = Arc::clone(&self.inner.permits);

        let permit = match tokio::time::timeout(self.inner.config.checkout_timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::ConnectionFailed("pool is closed".into())),
            Err(_) => {
                PoolMetrics::bump(&self.inner.metrics.checkout_timeouts);
                let waited = started.elapsed();
                warn!(waited_ms = waited.as_millis() as u64, "Connection pool exhausted");
                return Err(DatabaseError::PoolExhausted(waited));
            }
        };

        let claim = self.inner.claim().ok_or_else(|| {
            error!("Permit granted but no free slot");
            DatabaseError::ConnectionFailed("no free pool slot".into())
        })?;

        let slot = match claim {
            Claim::Idle {
                slot,
                session,
                created_at,
                last_used_at,
            } => {
                let now = Instant::now();
                if !session.is_closed() && !self.inner.is_stale(created_at, last_used_at, now) {
                    debug!(slot, "Reusing idle session");
                    return Ok(PooledConnection {
                        slot,
                        session: Some(session),
                        created_at,
                        last_used_at,
                        inner: Arc::clone(&self.inner),
                        _permit: permit,
                    });
                }
                debug!(slot, "Replacing stale idle session");
                PoolMetrics::bump(&self.inner.metrics.connections_closed);
                drop(session);
                slot
            }
            Claim::Vacant(slot) => slot,
        };

        let reservation = SlotReservation {
            inner: &self.inner,
            slot,
            armed: true,
        };
        let (session, created_at) = self.inner.open(slot).await?;
        reservation.disarm();

        {
            let mut slots = self.inner.slots.lock();
            let entry = &mut slots.slots[slot];
            entry.created_at = created_at;
            entry.last_used_at = created_at;
        }

        Ok(PooledConnection {
            slot,
            session: Some(session),
            created_at,
            last_used_at: created_at,
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Return a connection. Unhealthy sessions are discarded and the pool is
    /// topped back up to `min_size` in the background.
    pub fn checkin(&self, mut conn: PooledConnection, healthy: bool) {
        let session = conn.session.take();
        let live = self.inner.release(conn.slot, session, healthy);
        if !healthy {
            Self::replenish_if_needed(&self.inner, live);
        }
        // Permit goes back only now, after the slot is on a free-list.
        drop(conn);
    }

    fn replenish_if_needed(inner: &Arc<PoolInner>, live: usize) {
        if live >= inner.config.min_size {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Self {
            inner: Arc::clone(inner),
        };
        handle.spawn(async move {
            if let Err(e) = pool.fill_to_min().await {
                warn!(error = %e, "Failed to replenish pool");
            }
        });
    }

    /// Open sessions in vacant slots until `min_size` are live. Only uses
    /// spare permits, so it never competes with waiting checkouts for slots.
    async fn fill_to_min(&self) -> DbResult<usize> {
        let mut opened = 0;
        loop {
            if self.inner.slots.lock().live() >= self.inner.config.min_size {
                return Ok(opened);
            }
            let Ok(_permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                return Ok(opened);
            };
            let Some(Claim::Vacant(slot)) = self.claim_vacant() else {
                return Ok(opened);
            };

            let reservation = SlotReservation {
                inner: &self.inner,
                slot,
                armed: true,
            };
            let (session, created_at) = self.inner.open(slot).await?;
            reservation.disarm();

            {
                let mut slots = self.inner.slots.lock();
                let entry = &mut slots.slots[slot];
                entry.state = SlotState::Idle;
                entry.session = Some(session);
                entry.created_at = created_at;
                entry.last_used_at = created_at;
                slots.idle.push(slot);
            }
            opened += 1;
        }
    }

    fn claim_vacant(&self) -> Option<Claim> {
        let mut slots = self.inner.slots.lock();
        let index = slots.vacant.pop()?;
        slots.slots[index].state = SlotState::InUse;
        Some(Claim::Vacant(index))
    }

    /// Create `min_size` sessions up front.
    pub async fn warm_up(&self) -> DbResult<usize> {
        let opened = self.fill_to_min().await?;
        info!(opened, min_size = self.inner.config.min_size, "Connection pool warmed up");
        Ok(opened)
    }

    /// Close idle sessions past their idle timeout or lifetime. Returns how
    /// many were closed.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.inner.slots.lock();
        let mut expired = Vec::new();

        let idle = std::mem::take(&mut slots.idle);
        for index in idle {
            let slot = &slots.slots[index];
            let closed = slot.session.as_ref().is_none_or(|s| s.is_closed());
            if closed || self.inner.is_stale(slot.created_at, slot.last_used_at, now) {
                expired.extend(slots.vacate(index, SlotState::Vacant));
            } else {
                slots.idle.push(index);
            }
        }
        drop(slots);

        let count = expired.len();
        if count > 0 {
            self.inner
                .metrics
                .connections_closed
                .fetch_add(count as u32, Ordering::Relaxed);
            debug!(closed = count, "Reaped idle sessions");
        }
        count
    }

    /// Periodically reap idle sessions and top the pool back up. The task
    /// ends once every handle to the pool is gone.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                pool.reap();
                if let Err(e) = pool.fill_to_min().await {
                    warn!(error = %e, "Reaper could not restore minimum pool size");
                }
            }
        })
    }

    /// Run a validated statement under `timeout`. On expiry the running
    /// statement is cancelled and [`DatabaseError::Timeout`] is returned.
    pub async fn execute(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        max_rows: u64,
        timeout: Duration,
    ) -> DbResult<QueryResult> {
        let result = {
            let session = conn.session()?;
            self.bounded(session, timeout, session.fetch(sql, max_rows)).await
        };
        conn.last_used_at = Instant::now();
        self.record(&result);
        result
    }

    /// Describe a table under `timeout`.
    pub async fn describe(
        &self,
        conn: &mut PooledConnection,
        table: &str,
        timeout: Duration,
    ) -> DbResult<Vec<ColumnSchema>> {
        let result = {
            let session = conn.session()?;
            self.bounded(session, timeout, session.describe_table(table)).await
        };
        conn.last_used_at = Instant::now();
        self.record(&result);
        result
    }

    /// List tables or views under `timeout`.
    pub async fn list_objects(
        &self,
        conn: &mut PooledConnection,
        kind: ObjectKind,
        timeout: Duration,
    ) -> DbResult<Vec<DatabaseObject>> {
        let result = {
            let session = conn.session()?;
            self.bounded(session, timeout, session.list_objects(kind)).await
        };
        conn.last_used_at = Instant::now();
        self.record(&result);
        result
    }

    async fn bounded<T>(
        &self,
        session: &dyn Session,
        timeout: Duration,
        work: impl std::future::Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                PoolMetrics::bump(&self.inner.metrics.query_timeouts);
                warn!(timeout_ms = timeout.as_millis() as u64, "Statement timed out, cancelling");
                match tokio::time::timeout(CANCEL_GRACE, session.cancel()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Cancel request failed"),
                    Err(_) => warn!("Cancel request timed out"),
                }
                Err(DatabaseError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn record<T>(&self, result: &DbResult<T>) {
        match result {
            Ok(_) => PoolMetrics::bump(&self.inner.metrics.queries_executed),
            Err(DatabaseError::Timeout(_)) => {}
            Err(_) => PoolMetrics::bump(&self.inner.metrics.query_errors),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.inner.slots.lock();
        let idle = slots.idle.len();
        let in_use = slots
            .slots
            .iter()
            .filter(|s| s.state == SlotState::InUse)
            .count();
        PoolStatus {
            max_size: self.inner.config.max_size,
            min_size: self.inner.config.min_size,
            live: idle + in_use,
            idle,
            in_use,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.inner.connector.name())
            .field("status", &self.status())
            .finish()
    }
}
