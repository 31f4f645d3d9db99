//! Append-only audit trail.
//!
//! Every request produces exactly one [`AuditEvent`]. Events are handed to
//! an [`AuditSink`], which only awaits a bounded channel enqueue; a
//! background task drains the channel and persists batches through an
//! [`AuditWriter`].

mod sink;
mod writer;

pub use sink::{AuditError, AuditSink};
pub use writer::{AuditWriter, BatchWriteError, JsonlAuditWriter, MemoryAuditWriter};

use crate::gatekeeper::RequestedLimit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which public operation a request invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Query,
    Describe,
    ListObjects,
}

/// Outcome code written for requests abandoned before completion.
pub const CANCELLED: &str = "CANCELLED";

/// One self-contained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub client_id: String,
    pub operation: Operation,
    /// Redacted statement, or the table name for describes.
    pub subject: String,
    pub requested_limit: RequestedLimit,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub effective_limit: Option<u64>,
    /// `OK`, `REJECTED:<REASON>`, `RATE_LIMITED`, ...
    pub outcome: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub row_count: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl AuditEvent {
    /// Rejections, invalid limits and rate limits.
    pub fn is_security_event(&self) -> bool {
        self.outcome.starts_with("REJECTED:")
            || self.outcome == "RATE_LIMITED"
            || self.outcome == "INVALID_LIMIT"
    }
}

#[cfg(test)]
pub(crate) fn sample_event(outcome: &str) -> AuditEvent {
    AuditEvent {
        timestamp: Utc::now(),
        request_id: Uuid::new_v4(),
        client_id: "tester:1".into(),
        operation: Operation::Query,
        subject: "SELECT * FROM T WHERE A = '?'".into(),
        requested_limit: RequestedLimit::Rows(10),
        effective_limit: Some(10),
        outcome: outcome.into(),
        allowed: outcome == "OK",
        row_count: Some(3),
        duration_ms: 4,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = sample_event("REJECTED:FORBIDDEN_KEYWORD");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["operation"], "QUERY");
        assert_eq!(json["outcome"], "REJECTED:FORBIDDEN_KEYWORD");
        assert_eq!(json["requested_limit"], 10);
        assert!(json.get("message").is_none());
        assert!(event.is_security_event());

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_execution_errors_are_not_security_events() {
        assert!(!sample_event("EXECUTION_ERROR").is_security_event());
        assert!(!sample_event("POOL_EXHAUSTED").is_security_event());
        assert!(sample_event("RATE_LIMITED").is_security_event());
    }
}
