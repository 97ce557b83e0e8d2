//! Event taxonomy: maps an event type onto a kill-chain stage and an attack
//! type label.
//!
//! The built-in table is a starting policy. Deployments extend or override it
//! through `taxonomy.rules` in the configuration file.

pub mod stage;

pub use stage::KillChainStage;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One configurable taxonomy rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxonomyRule {
    pub event_type: String,
    #[serde(default)]
    pub stage: Option<KillChainStage>,
    pub attack_type: String,
    /// Events of this type always become alerts, regardless of score.
    #[serde(default = "default_alerting")]
    pub alerting: bool,
}

fn default_alerting() -> bool {
    true
}

/// Result of classifying one event type.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub stage: KillChainStage,
    pub attack_type: String,
    pub alerting: bool,
}

#[derive(Debug, Clone)]
pub struct Taxonomy {
    rules: HashMap<String, TaxonomyRule>,
}

impl Taxonomy {
    /// Built-in table extended (and overridden) by `overrides`.
    pub fn with_overrides(overrides: &[TaxonomyRule]) -> Self {
        let mut taxonomy = Self::default();
        for rule in overrides {
            taxonomy.insert(rule.clone());
        }
        taxonomy
    }

    pub fn insert(&mut self, rule: TaxonomyRule) {
        self.rules.insert(normalize(&rule.event_type), rule);
    }

    pub fn classify(&self, event_type: &str) -> Classification {
        match self.rules.get(&normalize(event_type)) {
            Some(rule) => Classification {
                stage: rule.stage.unwrap_or(KillChainStage::Unknown),
                attack_type: rule.attack_type.clone(),
                alerting: rule.alerting,
            },
            None => Classification {
                stage: KillChainStage::Unknown,
                attack_type: event_type.to_string(),
                alerting: false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn normalize(event_type: &str) -> String {
    event_type.trim().to_lowercase().replace([' ', '-'], "_")
}

impl Default for Taxonomy {
    fn default() -> Self {
        use KillChainStage::*;

        let table: &[(&str, Option<KillChainStage>, &str)] = &[
            ("port_scan", Some(Reconnaissance), "Port Scan"),
            ("network_scan", Some(Reconnaissance), "Network Scan"),
            ("ping_sweep", Some(Reconnaissance), "Ping Sweep"),
            ("dns_enumeration", Some(Reconnaissance), "DNS Enumeration"),
            ("vulnerability_scan", Some(Reconnaissance), "Vulnerability Scan"),
            ("exploit_attempt", Some(InitialAccess), "Exploit Attempt"),
            ("sql_injection", Some(InitialAccess), "SQL Injection"),
            ("phishing", Some(InitialAccess), "Phishing"),
            ("web_attack", Some(InitialAccess), "Web Attack"),
            ("malware_execution", Some(Execution), "Malware Execution"),
            ("suspicious_process", Some(Execution), "Suspicious Process"),
            ("command_injection", Some(Execution), "Command Injection"),
            ("scheduled_task", Some(Persistence), "Scheduled Task Persistence"),
            ("new_service", Some(Persistence), "Service Persistence"),
            ("registry_run_key", Some(Persistence), "Registry Persistence"),
            ("privilege_escalation", Some(PrivilegeEscalation), "Privilege Escalation"),
            ("sudo_abuse", Some(PrivilegeEscalation), "Sudo Abuse"),
            ("log_cleared", Some(DefenseEvasion), "Log Tampering"),
            ("av_disabled", Some(DefenseEvasion), "Security Tool Tampering"),
            ("brute_force", Some(CredentialAccess), "Brute Force"),
            ("failed_login", Some(CredentialAccess), "Failed Login"),
            ("password_spray", Some(CredentialAccess), "Password Spray"),
            ("credential_dump", Some(CredentialAccess), "Credential Dumping"),
            ("account_enumeration", Some(Discovery), "Account Enumeration"),
            ("network_discovery", Some(Discovery), "Network Discovery"),
            ("lateral_movement", Some(LateralMovement), "Lateral Movement"),
            ("remote_execution", Some(LateralMovement), "Remote Execution"),
            ("rdp_login", Some(LateralMovement), "Remote Desktop Pivot"),
            ("data_staging", Some(Collection), "Data Staging"),
            ("data_exfiltration", Some(Exfiltration), "Data Exfiltration"),
            ("large_upload", Some(Exfiltration), "Large Outbound Transfer"),
            ("dns_tunnel", Some(Exfiltration), "DNS Tunneling"),
            ("ransomware", Some(Impact), "Ransomware"),
            ("data_destruction", Some(Impact), "Data Destruction"),
            ("ddos", Some(Impact), "Denial of Service"),
            ("ml_anomaly", None, "Anomalous Traffic"),
        ];

        let rules = table
            .iter()
            .map(|(event_type, stage, attack_type)| {
                (
                    event_type.to_string(),
                    TaxonomyRule {
                        event_type: event_type.to_string(),
                        stage: *stage,
                        attack_type: attack_type.to_string(),
                        alerting: true,
                    },
                )
            })
            .collect();

        Self { rules }
    }
}
