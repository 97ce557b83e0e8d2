//! Attack chain tracking: per-attacker kill-chain progress over time.

pub mod chain;
pub mod state;
pub mod tracker;

pub use chain::{chain_confidence, AttackChain, ChainEvent, ChainRecord};
pub use state::{ChainInput, ChainState};
pub use tracker::{ChainSettings, ChainStatistics, ChainSweep, ChainTracker, ChainUpdate};
