//! Per-client fixed-window rate limiter.
//!
//! Each client gets its own window guarded by its own mutex; the map shard
//! lock is only held while looking the entry up, so clients never contend
//! on each other's counters.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Mutable window state for one client.
#[derive(Debug)]
struct ClientWindow {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl ClientWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            blocked_until: None,
            last_seen: now,
        }
    }
}

/// Snapshot of one client's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub blocked: bool,
    pub requests_used: u32,
    pub requests_remaining: u32,
    pub reset_in: Duration,
}

/// Fixed-window limiter keyed by client id.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clients: DashMap<String, Arc<Mutex<ClientWindow>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn client(&self, client_id: &str) -> Arc<Mutex<ClientWindow>> {
        if let Some(entry) = self.clients.get(client_id) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ClientWindow::new(Instant::now()))));
        Arc::clone(entry.value())
    }

    /// Count a request against the client's window.
    pub fn try_acquire(&self, client_id: &str) -> RateDecision {
        let client = self.client(client_id);
        let mut state = client.lock();
        let now = Instant::now();
        state.last_seen = now;

        if let Some(until) = state.blocked_until {
            if now < until {
                let retry_after = until - now;
                debug!(client_id, ?retry_after, "Client still blocked");
                return RateDecision::Denied { retry_after };
            }
        }

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
            state.blocked_until = None;
        }

        if state.count >= self.max_requests {
            let until = state.window_start + self.window;
            state.blocked_until = Some(until);
            let retry_after = until.saturating_duration_since(now);
            warn!(
                target: "security",
                client_id,
                limit = self.max_requests,
                window_secs = self.window.as_secs(),
                "Rate limit exceeded"
            );
            return RateDecision::Denied { retry_after };
        }

        state.count += 1;
        RateDecision::Allowed {
            remaining: self.max_requests - state.count,
        }
    }

    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.try_acquire(client_id).is_allowed()
    }

    /// Current window of a client without counting a request.
    pub fn client_status(&self, client_id: &str) -> ClientStatus {
        let Some(client) = self.clients.get(client_id).map(|e| Arc::clone(e.value())) else {
            return ClientStatus {
                blocked: false,
                requests_used: 0,
                requests_remaining: self.max_requests,
                reset_in: Duration::ZERO,
            };
        };

        let state = client.lock();
        let now = Instant::now();
        let expired = now.duration_since(state.window_start) >= self.window;
        let blocked = state.blocked_until.is_some_and(|until| now < until);

        if expired && !blocked {
            return ClientStatus {
                blocked: false,
                requests_used: 0,
                requests_remaining: self.max_requests,
                reset_in: Duration::ZERO,
            };
        }

        let reset_at = state.blocked_until.unwrap_or(state.window_start + self.window);
        ClientStatus {
            blocked,
            requests_used: state.count,
            requests_remaining: self.max_requests.saturating_sub(state.count),
            reset_in: reset_at.saturating_duration_since(now),
        }
    }

    /// Drop client windows untouched for longer than `idle`. Returns how
    /// many were removed.
    pub fn purge_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients
            .retain(|_, client| now.duration_since(client.lock().last_seen) <= idle);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, "Purged idle rate limit windows");
        }
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}
