//! Correlation of alerts, chains and logs into higher-level threats.

pub mod engine;
pub mod threat;

pub use engine::{
    CorrelationEngine, CorrelationSettings, CorrelationSummary, RunOutcome, RunStatus, ThreatSet, TimelineEntry,
};
pub use threat::{CorrelatedThreat, ThreatEvent, ThreatRecord};
