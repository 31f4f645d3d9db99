//! Complexity ceilings for already-classified reads.

use super::classifier::{ReasonCode, StatementClassifier, ValidationVerdict};
use serde::{Deserialize, Serialize};

/// Configured ceilings. A statement exceeding any of them is rejected,
/// never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityLimits {
    pub max_length: usize,
    pub max_joins: usize,
    pub max_subquery_depth: usize,
    pub max_unions: usize,
}

impl Default for ComplexityLimits {
    fn default() -> Self {
        Self {
            max_length: 5000,
            max_joins: 10,
            max_subquery_depth: 4,
            max_unions: 8,
        }
    }
}

/// Measured shape of a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComplexityProfile {
    pub length: usize,
    pub joins: usize,
    pub subquery_depth: usize,
    pub unions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ComplexityGuard {
    limits: ComplexityLimits,
}

impl ComplexityGuard {
    pub fn new(limits: ComplexityLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ComplexityLimits {
        &self.limits
    }

    /// Measure a statement. Text that is not a single allowed read yields
    /// `None`.
    pub fn measure(sql: &str) -> Option<ComplexityProfile> {
        let verdict = StatementClassifier::new().classify(sql);
        verdict.allowed.then_some(verdict.profile)
    }

    /// Check an allowed verdict against the ceilings. A rejected verdict is
    /// returned unchanged.
    pub fn check(&self, verdict: &ValidationVerdict) -> ValidationVerdict {
        if !verdict.allowed {
            return verdict.clone();
        }

        let reject = |detail: String| ValidationVerdict {
            allowed: false,
            reason: ReasonCode::TooComplex,
            executable_text: String::new(),
            detail: Some(detail),
            ..verdict.clone()
        };

        let profile = &verdict.profile;
        let limits = &self.limits;

        if profile.length > limits.max_length {
            return reject(format!("length {} exceeds {}", profile.length, limits.max_length));
        }
        if profile.joins > limits.max_joins {
            return reject(format!("{} joins exceed {}", profile.joins, limits.max_joins));
        }
        if profile.subquery_depth > limits.max_subquery_depth {
            return reject(format!(
                "subquery depth {} exceeds {}",
                profile.subquery_depth, limits.max_subquery_depth
            ));
        }
        if profile.unions > limits.max_unions {
            return reject(format!(
                "{} set operations exceed {}",
                profile.unions, limits.max_unions
            ));
        }

        verdict.clone()
    }
}
