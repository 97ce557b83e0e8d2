use serde::Serialize;
use std::fmt;

/// Lifecycle of one attack chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    /// Opened by a single stage-bearing event.
    Building,
    /// Corroborated by further activity within the inactivity timeout.
    Active,
    /// No activity within the inactivity timeout. Retained and reactivated by
    /// the next event from the same attacker.
    Dormant,
    /// Past retention. Terminal.
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainInput {
    EventRecorded { event_count: u64 },
    InactivityElapsed,
    RetentionElapsed,
}

/// Events needed before a building chain counts as active.
pub const ACTIVATION_EVENTS: u64 = 2;

impl ChainState {
    /// Transition table.
    pub fn next(self, input: ChainInput) -> ChainState {
        use ChainInput::*;
        use ChainState::*;

        match (self, input) {
            (Evicted, _) => Evicted,
            (_, RetentionElapsed) => Evicted,

            (Building, EventRecorded { event_count }) if event_count >= ACTIVATION_EVENTS => Active,
            (Building, EventRecorded { .. }) => Building,
            (Active, EventRecorded { .. }) => Active,
            (Dormant, EventRecorded { .. }) => Active,

            (Building, InactivityElapsed) | (Active, InactivityElapsed) | (Dormant, InactivityElapsed) => Dormant,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ChainState::Building | ChainState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainState::Building => "building",
            ChainState::Active => "active",
            ChainState::Dormant => "dormant",
            ChainState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
