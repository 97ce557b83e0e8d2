use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kill-chain stage vocabulary.
///
/// The twelve named stages are ordered for display only; chains may skip or
/// revisit any of them. `Unknown` tags events whose type is not mapped and is
/// never recorded in a chain's `stages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillChainStage {
    Reconnaissance,
    InitialAccess,
    Execution,
    Persistence,
    PrivilegeEscalation,
    DefenseEvasion,
    CredentialAccess,
    Discovery,
    LateralMovement,
    Collection,
    Exfiltration,
    Impact,
    Unknown,
}

impl KillChainStage {
    pub const VOCABULARY: [KillChainStage; 12] = [
        KillChainStage::Reconnaissance,
        KillChainStage::InitialAccess,
        KillChainStage::Execution,
        KillChainStage::Persistence,
        KillChainStage::PrivilegeEscalation,
        KillChainStage::DefenseEvasion,
        KillChainStage::CredentialAccess,
        KillChainStage::Discovery,
        KillChainStage::LateralMovement,
        KillChainStage::Collection,
        KillChainStage::Exfiltration,
        KillChainStage::Impact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KillChainStage::Reconnaissance => "reconnaissance",
            KillChainStage::InitialAccess => "initial_access",
            KillChainStage::Execution => "execution",
            KillChainStage::Persistence => "persistence",
            KillChainStage::PrivilegeEscalation => "privilege_escalation",
            KillChainStage::DefenseEvasion => "defense_evasion",
            KillChainStage::CredentialAccess => "credential_access",
            KillChainStage::Discovery => "discovery",
            KillChainStage::LateralMovement => "lateral_movement",
            KillChainStage::Collection => "collection",
            KillChainStage::Exfiltration => "exfiltration",
            KillChainStage::Impact => "impact",
            KillChainStage::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, KillChainStage::Unknown)
    }

    /// Relative severity of reaching this stage, 0.0 to 1.0.
    pub fn weight(&self) -> f64 {
        match self {
            KillChainStage::Reconnaissance => 0.3,
            KillChainStage::InitialAccess => 0.7,
            KillChainStage::Execution => 0.6,
            KillChainStage::Persistence => 0.7,
            KillChainStage::PrivilegeEscalation => 0.85,
            KillChainStage::DefenseEvasion => 0.5,
            KillChainStage::CredentialAccess => 0.75,
            KillChainStage::Discovery => 0.35,
            KillChainStage::LateralMovement => 0.8,
            KillChainStage::Collection => 0.6,
            KillChainStage::Exfiltration => 0.9,
            KillChainStage::Impact => 1.0,
            KillChainStage::Unknown => 0.0,
        }
    }
}

impl fmt::Display for KillChainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KillChainStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        if normalized == "unknown" {
            return Ok(KillChainStage::Unknown);
        }
        KillChainStage::VOCABULARY
            .iter()
            .find(|stage| stage.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown kill-chain stage: {}", s))
    }
}
