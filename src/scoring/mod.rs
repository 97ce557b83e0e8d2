//! Severity and priority scoring.
//!
//! Each event passes through a fixed, ordered list of weighted factor
//! evaluators. The priority score is the capped sum of their contributions and
//! the severity bucket is derived from it with fixed thresholds.

pub mod factors;
pub mod scorer;
pub mod severity;

pub use factors::{FactorEvaluator, FactorOutcome, ScoringInput};
pub use scorer::{Assessment, ScoreResult, Scorer};
pub use severity::Severity;
