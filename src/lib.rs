//! Security telemetry engine: scores normalized events into prioritized
//! alerts, folds duplicates, tracks per-attacker kill-chain progress and
//! correlates everything into threats served to the dashboard.

pub mod alerts;
pub mod api;
pub mod chains;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod scoring;
pub mod sweeper;
pub mod taxonomy;

pub use error::{EngineError, EngineResult};
pub use pipeline::{Engine, IngestHandle, IngestionPipeline};
