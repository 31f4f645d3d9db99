//! Statement classification, complexity ceilings and rate limiting.

pub mod classifier;
pub mod complexity;
pub mod lexer;
pub mod rate_limiter;
pub mod shape;

pub use classifier::{ReasonCode, StatementClassifier, ValidationVerdict};
pub use complexity::{ComplexityGuard, ComplexityLimits, ComplexityProfile};
pub use rate_limiter::{ClientStatus, RateDecision, RateLimiter};
