//! Inbound request data.

use crate::audit::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

/// Row limit as supplied by the caller, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestedLimit {
    #[default]
    Absent,
    Rows(u64),
    /// Anything that is not a non-negative integer, as the caller sent it.
    Invalid(String),
}

impl RequestedLimit {
    /// Interpret an optional JSON argument. `null` counts as absent.
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::Number(n)) => n.as_u64().map_or_else(|| Self::Invalid(n.to_string()), Self::Rows),
            Some(other) => Self::Invalid(other.to_string()),
        }
    }
}

impl From<u64> for RequestedLimit {
    fn from(v: u64) -> Self {
        Self::Rows(v)
    }
}

impl From<u32> for RequestedLimit {
    fn from(v: u32) -> Self {
        Self::Rows(v.into())
    }
}

impl From<i64> for RequestedLimit {
    fn from(v: i64) -> Self {
        u64::try_from(v).map_or_else(|_| Self::Invalid(v.to_string()), Self::Rows)
    }
}

impl From<i32> for RequestedLimit {
    fn from(v: i32) -> Self {
        Self::from(i64::from(v))
    }
}

impl From<Option<u64>> for RequestedLimit {
    fn from(v: Option<u64>) -> Self {
        v.map_or(Self::Absent, Self::Rows)
    }
}

/// One call to a gatekeeper operation. Immutable once built.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: Uuid,
    pub client_id: String,
    pub operation: Operation,
    pub raw_text: String,
    pub requested_limit: RequestedLimit,
    pub received_at: DateTime<Utc>,
    pub(crate) started: Instant,
}

impl Request {
    pub fn new(
        client_id: impl Into<String>,
        operation: Operation,
        raw_text: impl Into<String>,
        requested_limit: RequestedLimit,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id: client_id.into(),
            operation,
            raw_text: raw_text.into(),
            requested_limit,
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        assert_eq!(RequestedLimit::from_json(None), RequestedLimit::Absent);
        assert_eq!(RequestedLimit::from_json(Some(&json!(null))), RequestedLimit::Absent);
        assert_eq!(RequestedLimit::from_json(Some(&json!(25))), RequestedLimit::Rows(25));
        assert_eq!(RequestedLimit::from_json(Some(&json!(0))), RequestedLimit::Rows(0));
        assert_eq!(
            RequestedLimit::from_json(Some(&json!(-1))),
            RequestedLimit::Invalid("-1".into())
        );
        assert_eq!(
            RequestedLimit::from_json(Some(&json!("all"))),
            RequestedLimit::Invalid("\"all\"".into())
        );
        assert!(matches!(
            RequestedLimit::from_json(Some(&json!(2.5))),
            RequestedLimit::Invalid(_)
        ));
    }

    #[test]
    fn test_from_integers() {
        assert_eq!(RequestedLimit::from(-5i64), RequestedLimit::Invalid("-5".into()));
        assert_eq!(RequestedLimit::from(7i32), RequestedLimit::Rows(7));
        assert_eq!(RequestedLimit::from(None::<u64>), RequestedLimit::Absent);
    }

    #[test]
    fn test_serializes_as_plain_value() {
        assert_eq!(serde_json::to_value(RequestedLimit::Absent).unwrap(), json!(null));
        assert_eq!(serde_json::to_value(RequestedLimit::Rows(3)).unwrap(), json!(3));
        assert_eq!(
            serde_json::to_value(RequestedLimit::Invalid("x".into())).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::new("c", Operation::Query, "SELECT 1", RequestedLimit::Absent);
        let b = Request::new("c", Operation::Query, "SELECT 1", RequestedLimit::Absent);
        assert_ne!(a.request_id, b.request_id);
    }
}
