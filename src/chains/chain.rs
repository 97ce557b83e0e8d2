use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::net::IpAddr;
use uuid::Uuid;

use super::state::{ChainInput, ChainState};
use crate::scoring::Severity;
use crate::taxonomy::KillChainStage;

/// One event attributed to a chain.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainEvent {
    pub event_id: String,
    pub stage: KillChainStage,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub dst_ip: Option<IpAddr>,
}

/// Tracker-owned state of one attacker campaign.
#[derive(Debug, Clone)]
pub struct ChainRecord {
    pub id: Uuid,
    pub attacker_ip: IpAddr,
    pub target_ips: BTreeSet<IpAddr>,
    pub stages: Vec<KillChainStage>,
    pub events: VecDeque<ChainEvent>,
    pub event_count: u64,
    pub confidence: f64,
    pub state: ChainState,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Read-side view of a chain.
#[derive(Debug, Clone, Serialize)]
pub struct AttackChain {
    pub id: Uuid,
    pub attacker_ip: IpAddr,
    pub target_ips: Vec<IpAddr>,
    pub stages: Vec<KillChainStage>,
    pub events: Vec<ChainEvent>,
    pub event_count: u64,
    pub confidence: f64,
    pub severity: Severity,
    pub state: ChainState,
    pub is_active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub duration_seconds: i64,
    pub narrative: Option<String>,
}

/// `min(1, 0.15 * distinct_stages + 0.02 * event_count)`
pub fn chain_confidence(distinct_stages: usize, event_count: u64) -> f64 {
    let raw = 0.15 * distinct_stages as f64 + 0.02 * event_count as f64;
    (raw.min(1.0) * 10_000.0).round() / 10_000.0
}

impl ChainRecord {
    pub fn new(attacker_ip: IpAddr, first_seen: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            attacker_ip,
            target_ips: BTreeSet::new(),
            stages: Vec::new(),
            events: VecDeque::new(),
            event_count: 0,
            confidence: 0.0,
            state: ChainState::Building,
            first_seen,
            last_activity: first_seen,
        }
    }

    /// Apply one event. Returns the state before the event was recorded.
    pub fn record(&mut self, event: ChainEvent, inactivity_timeout: Duration, max_events: usize) -> ChainState {
        if event.timestamp - self.last_activity > inactivity_timeout {
            self.state = self.state.next(ChainInput::InactivityElapsed);
        }
        let previous = self.state;

        if event.stage.is_known() && !self.stages.contains(&event.stage) {
            self.stages.push(event.stage);
        }
        if let Some(dst) = event.dst_ip {
            if dst != self.attacker_ip {
                self.target_ips.insert(dst);
            }
        }
        if event.timestamp > self.last_activity {
            self.last_activity = event.timestamp;
        }
        if event.timestamp < self.first_seen {
            self.first_seen = event.timestamp;
        }

        self.events.push_back(event);
        while self.events.len() > max_events {
            self.events.pop_front();
        }

        self.event_count += 1;
        self.confidence = chain_confidence(self.stages.len(), self.event_count);
        self.state = self.state.next(ChainInput::EventRecorded {
            event_count: self.event_count,
        });

        previous
    }

    pub fn is_active(&self, now: DateTime<Utc>, inactivity_timeout: Duration) -> bool {
        now - self.last_activity <= inactivity_timeout
    }

    /// State as of `now`, derived from the stored state and elapsed time.
    pub fn effective_state(&self, now: DateTime<Utc>, inactivity_timeout: Duration, retention: Duration) -> ChainState {
        let idle = now - self.last_activity;
        let mut state = self.state;
        if idle > inactivity_timeout {
            state = state.next(ChainInput::InactivityElapsed);
        }
        if idle > retention {
            state = state.next(ChainInput::RetentionElapsed);
        }
        state
    }

    pub fn view(&self, now: DateTime<Utc>, inactivity_timeout: Duration, retention: Duration) -> AttackChain {
        AttackChain {
            id: self.id,
            attacker_ip: self.attacker_ip,
            target_ips: self.target_ips.iter().copied().collect(),
            stages: self.stages.clone(),
            events: self.events.iter().cloned().collect(),
            event_count: self.event_count,
            confidence: self.confidence,
            severity: Severity::from_score(self.confidence * 100.0),
            state: self.effective_state(now, inactivity_timeout, retention),
            is_active: self.is_active(now, inactivity_timeout),
            first_seen: self.first_seen,
            last_activity: self.last_activity,
            duration_seconds: (self.last_activity - self.first_seen).num_seconds(),
            narrative: self.narrative(),
        }
    }

    /// Stages in discovery order, joined into one sentence.
    pub fn narrative(&self) -> Option<String> {
        if self.stages.is_empty() {
            return None;
        }

        let stages: Vec<String> = self.stages.iter().map(|s| s.as_str().replace('_', " ")).collect();
        let progression = match stages.len() {
            1 => stages[0].clone(),
            n => format!("{}, then {}", stages[..n - 1].join(", then "), stages[n - 1]),
        };

        let targets = match self.target_ips.len() {
            0 => String::new(),
            1 => format!(" against {}", self.target_ips.iter().next().map(|ip| ip.to_string()).unwrap_or_default()),
            n => format!(" against {} hosts", n),
        };

        let minutes = (self.last_activity - self.first_seen).num_minutes();
        Some(format!(
            "Attacker {} performed {}{} over {} minute{} ({} event{}, confidence {:.2})",
            self.attacker_ip,
            progression,
            targets,
            minutes,
            if minutes == 1 { "" } else { "s" },
            self.event_count,
            if self.event_count == 1 { "" } else { "s" },
            self.confidence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(stage: KillChainStage, at: DateTime<Utc>, dst: Option<&str>) -> ChainEvent {
        ChainEvent {
            event_id: Uuid::new_v4().to_string(),
            stage,
            event_type: stage.as_str().to_string(),
            timestamp: at,
            dst_ip: dst.map(|d| d.parse().unwrap()),
        }
    }

    #[test]
    fn test_confidence_formula_is_capped() {
        assert_eq!(chain_confidence(0, 0), 0.0);
        assert!((chain_confidence(2, 2) - 0.34).abs() < 1e-9);
        assert_eq!(chain_confidence(12, 100), 1.0);
    }

    #[test]
    fn test_stages_keep_discovery_order_and_skip_unknown() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut chain = ChainRecord::new("203.0.113.7".parse().unwrap(), t);
        let timeout = Duration::minutes(30);

        chain.record(event(KillChainStage::CredentialAccess, t, Some("10.0.0.9")), timeout, 200);
        chain.record(event(KillChainStage::Unknown, t + Duration::minutes(1), None), timeout, 200);
        chain.record(event(KillChainStage::Reconnaissance, t + Duration::minutes(2), Some("10.0.0.9")), timeout, 200);
        chain.record(event(KillChainStage::CredentialAccess, t + Duration::minutes(3), None), timeout, 200);

        assert_eq!(
            chain.stages,
            vec![KillChainStage::CredentialAccess, KillChainStage::Reconnaissance]
        );
        assert_eq!(chain.events.len(), 4);
        assert_eq!(chain.target_ips.len(), 1);
        assert_eq!(chain.state, ChainState::Active);

        let narrative = chain.narrative().unwrap();
        assert!(narrative.contains("credential access, then reconnaissance"));
        assert!(narrative.contains("against 10.0.0.9"));
    }

    #[test]
    fn test_gap_marks_dormant_then_reactivates() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let timeout = Duration::minutes(30);
        let retention = Duration::hours(24);
        let mut chain = ChainRecord::new("203.0.113.7".parse().unwrap(), t);
        chain.record(event(KillChainStage::Reconnaissance, t, None), timeout, 200);

        let later = t + Duration::minutes(31);
        assert!(!chain.is_active(later, timeout));
        assert_eq!(chain.effective_state(later, timeout, retention), ChainState::Dormant);
        assert!(chain.is_active(t + Duration::minutes(30), timeout));

        let previous = chain.record(event(KillChainStage::Execution, later, None), timeout, 200);
        assert_eq!(previous, ChainState::Dormant);
        assert_eq!(chain.state, ChainState::Active);
        assert!(chain.is_active(later, timeout));
    }

    #[test]
    fn test_events_are_bounded() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut chain = ChainRecord::new("203.0.113.7".parse().unwrap(), t);
        for i in 0..10 {
            chain.record(
                event(KillChainStage::Discovery, t + Duration::seconds(i), None),
                Duration::minutes(30),
                4,
            );
        }
        assert_eq!(chain.events.len(), 4);
        assert_eq!(chain.event_count, 10);
    }
}
