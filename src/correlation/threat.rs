use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use uuid::Uuid;

use crate::chains::chain_confidence;
use crate::events::{saturating_add, saturating_sub, LogEntry};
use crate::scoring::Severity;
use crate::taxonomy::KillChainStage;

/// Attack type given to threats spanning this many distinct stages.
pub const MULTI_STAGE_THRESHOLD: usize = 3;
pub const MULTI_STAGE_ATTACK: &str = "Multi-Stage Intrusion";

/// Key event of a correlated threat.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreatEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub stage: KillChainStage,
    pub attack_type: String,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub source_type: String,
    pub priority_score: f64,
    pub severity: Severity,
    pub alert_id: Option<Uuid>,
}

impl ThreatEvent {
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            event_id: entry.event.id.clone(),
            timestamp: entry.event.timestamp,
            event_type: entry.event.event_type.clone(),
            stage: entry.stage,
            attack_type: entry.attack_type.clone(),
            src_ip: entry.event.src_ip,
            dst_ip: entry.event.dst_ip,
            source_type: entry.event.source_type.clone(),
            priority_score: entry.priority_score,
            severity: entry.severity,
            alert_id: entry.alert_id,
        }
    }

    /// One-line summary for timeline rows.
    pub fn description(&self) -> String {
        let mut line = format!("{} from {}", self.event_type, self.src_ip);
        if let Some(dst) = self.dst_ip {
            line.push_str(&format!(" to {}", dst));
        }
        if self.stage.is_known() {
            line.push_str(&format!(" ({})", self.stage.as_str().replace('_', " ")));
        }
        line
    }
}

/// Engine-owned state of one correlated threat.
#[derive(Debug, Clone)]
pub struct ThreatRecord {
    pub id: Uuid,
    pub source_ips: BTreeSet<IpAddr>,
    pub target_ips: BTreeSet<IpAddr>,
    pub source_types: BTreeSet<String>,
    pub events: VecDeque<ThreatEvent>,
    pub event_count: u64,
    pub stage_counts: BTreeMap<KillChainStage, u64>,
    pub stage_order: Vec<KillChainStage>,
    pub stage_last_seen: BTreeMap<KillChainStage, DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub max_priority: f64,
    pub lead_attack_type: String,
    pub chain_confidence: f64,
}

/// Read-side view of a correlated threat.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelatedThreat {
    pub id: Uuid,
    pub attack_type: String,
    pub stage: KillChainStage,
    pub stages: Vec<KillChainStage>,
    pub confidence: f64,
    pub severity: Severity,
    pub max_priority: f64,
    pub source_ips: Vec<IpAddr>,
    pub target_ips: Vec<IpAddr>,
    pub source_types: Vec<String>,
    pub event_count: u64,
    pub events: Vec<ThreatEvent>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_seconds: i64,
    pub narrative: String,
}

impl ThreatRecord {
    pub fn open(entry: &LogEntry) -> Self {
        let ts = entry.event.timestamp;
        Self {
            id: Uuid::new_v4(),
            source_ips: BTreeSet::new(),
            target_ips: BTreeSet::new(),
            source_types: BTreeSet::new(),
            events: VecDeque::new(),
            event_count: 0,
            stage_counts: BTreeMap::new(),
            stage_order: Vec::new(),
            stage_last_seen: BTreeMap::new(),
            first_seen: ts,
            last_seen: ts,
            max_priority: 0.0,
            lead_attack_type: entry.attack_type.clone(),
            chain_confidence: 0.0,
        }
    }

    pub fn absorb(&mut self, entry: &LogEntry, chain_confidence: Option<f64>, max_events: usize) {
        let event = &entry.event;
        self.source_ips.insert(event.src_ip);
        if let Some(dst) = event.dst_ip {
            self.target_ips.insert(dst);
        }
        self.source_types.insert(event.source_type.clone());

        if entry.stage.is_known() {
            if !self.stage_counts.contains_key(&entry.stage) {
                self.stage_order.push(entry.stage);
            }
            *self.stage_counts.entry(entry.stage).or_insert(0) += 1;
            let seen = self.stage_last_seen.entry(entry.stage).or_insert(event.timestamp);
            if event.timestamp > *seen {
                *seen = event.timestamp;
            }
        }

        if event.timestamp < self.first_seen {
            self.first_seen = event.timestamp;
        }
        if event.timestamp > self.last_seen {
            self.last_seen = event.timestamp;
        }

        if self.event_count == 0 || entry.priority_score > self.max_priority {
            self.max_priority = entry.priority_score;
            self.lead_attack_type = entry.attack_type.clone();
        }
        if let Some(confidence) = chain_confidence {
            self.chain_confidence = self.chain_confidence.max(confidence);
        }

        self.event_count += 1;
        self.events.push_back(ThreatEvent::from_entry(entry));
        while self.events.len() > max_events {
            self.events.pop_front();
        }
    }

    /// Whether `at` falls within `window` of this threat's activity span.
    pub fn within_window(&self, at: DateTime<Utc>, window: chrono::Duration) -> bool {
        at <= saturating_add(self.last_seen, window) && at >= saturating_sub(self.first_seen, window)
    }

    /// Most frequent stage; the most recently seen wins a tie.
    pub fn dominant_stage(&self) -> KillChainStage {
        self.stage_counts
            .iter()
            .max_by(|(a_stage, a_count), (b_stage, b_count)| {
                a_count
                    .cmp(b_count)
                    .then_with(|| self.stage_last_seen.get(a_stage).cmp(&self.stage_last_seen.get(b_stage)))
            })
            .map(|(stage, _)| *stage)
            .unwrap_or(KillChainStage::Unknown)
    }

    /// Stages in discovery order.
    pub fn stages(&self) -> Vec<KillChainStage> {
        self.stage_order.clone()
    }

    pub fn attack_type(&self) -> String {
        if self.stage_counts.len() >= MULTI_STAGE_THRESHOLD {
            MULTI_STAGE_ATTACK.to_string()
        } else {
            self.lead_attack_type.clone()
        }
    }

    /// Own volume/diversity confidence combined with the attacker's chain
    /// confidence as independent evidence.
    pub fn confidence(&self) -> f64 {
        let own = chain_confidence(self.stage_counts.len(), self.event_count);
        let combined = 1.0 - (1.0 - own) * (1.0 - self.chain_confidence);
        (combined.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
    }

    pub fn severity(&self) -> Severity {
        Severity::from_score(self.max_priority.max(self.confidence() * 100.0))
    }

    pub fn narrative(&self) -> String {
        let sources = join_ips(&self.source_ips);
        let stages: Vec<String> = self
            .stages()
            .iter()
            .map(|s| s.as_str().replace('_', " "))
            .collect();

        let mut narrative = format!("{} activity from {}", self.attack_type(), sources);
        if !self.target_ips.is_empty() {
            narrative.push_str(&format!(" targeting {}", join_ips(&self.target_ips)));
        }
        if !stages.is_empty() {
            narrative.push_str(&format!(", progressing through {}", stages.join(" -> ")));
        }
        narrative.push_str(&format!(
            ". {} event{} across {} source type{} between {} and {}.",
            self.event_count,
            if self.event_count == 1 { "" } else { "s" },
            self.source_types.len(),
            if self.source_types.len() == 1 { "" } else { "s" },
            self.first_seen.format("%Y-%m-%d %H:%M:%S UTC"),
            self.last_seen.format("%Y-%m-%d %H:%M:%S UTC"),
        ));
        narrative
    }

    pub fn view(&self) -> CorrelatedThreat {
        CorrelatedThreat {
            id: self.id,
            attack_type: self.attack_type(),
            stage: self.dominant_stage(),
            stages: self.stages(),
            confidence: self.confidence(),
            severity: self.severity(),
            max_priority: self.max_priority,
            source_ips: self.source_ips.iter().copied().collect(),
            target_ips: self.target_ips.iter().copied().collect(),
            source_types: self.source_types.iter().cloned().collect(),
            event_count: self.event_count,
            events: self.events.iter().cloned().collect(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            duration_seconds: (self.last_seen - self.first_seen).num_seconds(),
            narrative: self.narrative(),
        }
    }
}

fn join_ips(ips: &BTreeSet<IpAddr>) -> String {
    const SHOWN: usize = 3;
    let mut shown: Vec<String> = ips.iter().take(SHOWN).map(|ip| ip.to_string()).collect();
    if ips.len() > SHOWN {
        shown.push(format!("{} more", ips.len() - SHOWN));
    }
    shown.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, RawEvent};
    use chrono::{Duration, TimeZone};

    fn entry(stage: KillChainStage, attack_type: &str, src: &str, at: DateTime<Utc>, score: f64) -> LogEntry {
        let event = Event::new(
            RawEvent::new(stage.as_str(), src)
                .with_timestamp(at)
                .with_dst_ip("10.0.0.9")
                .with_source_type("firewall"),
        )
        .unwrap();
        LogEntry::new(event, Severity::from_score(score), score, stage, attack_type.to_string())
    }

    #[test]
    fn test_dominant_stage_prefers_count_then_recency() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let first = entry(KillChainStage::Reconnaissance, "Port Scan", "203.0.113.7", t, 20.0);
        let mut threat = ThreatRecord::open(&first);
        threat.absorb(&first, None, 50);
        threat.absorb(
            &entry(KillChainStage::CredentialAccess, "Brute Force", "203.0.113.7", t + Duration::minutes(1), 60.0),
            None,
            50,
        );
        assert_eq!(threat.dominant_stage(), KillChainStage::CredentialAccess);

        threat.absorb(
            &entry(KillChainStage::Reconnaissance, "Port Scan", "203.0.113.7", t + Duration::minutes(2), 20.0),
            None,
            50,
        );
        assert_eq!(threat.dominant_stage(), KillChainStage::Reconnaissance);
        assert_eq!(threat.attack_type(), "Brute Force");
        assert_eq!(threat.max_priority, 60.0);
    }

    #[test]
    fn test_confidence_combines_chain_evidence() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let e = entry(KillChainStage::Reconnaissance, "Port Scan", "203.0.113.7", t, 20.0);
        let mut threat = ThreatRecord::open(&e);
        threat.absorb(&e, None, 50);
        let own = threat.confidence();
        assert!((own - 0.17).abs() < 1e-9);

        threat.absorb(&e, Some(0.5), 50);
        let combined = threat.confidence();
        let own = chain_confidence(1, 2);
        assert!((combined - (1.0 - (1.0 - own) * 0.5)).abs() < 1e-4);
    }

    #[test]
    fn test_multi_stage_attack_type_and_narrative() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let stages = [
            KillChainStage::Reconnaissance,
            KillChainStage::InitialAccess,
            KillChainStage::Exfiltration,
        ];
        let first = entry(stages[0], "Port Scan", "203.0.113.7", t, 20.0);
        let mut threat = ThreatRecord::open(&first);
        for (i, stage) in stages.iter().enumerate() {
            threat.absorb(
                &entry(*stage, "x", "203.0.113.7", t + Duration::minutes(i as i64), 30.0),
                None,
                2,
            );
        }

        let view = threat.view();
        assert_eq!(view.attack_type, MULTI_STAGE_ATTACK);
        assert_eq!(view.events.len(), 2);
        assert_eq!(view.event_count, 3);
        assert_eq!(view.stages.len(), 3);
        assert!(view.narrative.contains("reconnaissance -> initial access -> exfiltration"));
        assert!(view.narrative.contains("203.0.113.7"));
    }
}
