use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};
use uuid::Uuid;

use super::chain::{AttackChain, ChainEvent, ChainRecord};
use super::state::{ChainInput, ChainState};
use crate::config::{span_seconds, ChainConfig};
use crate::events::Event;
use crate::taxonomy::KillChainStage;

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub inactivity_timeout: Duration,
    pub retention: Duration,
    pub max_events: usize,
}

impl From<&ChainConfig> for ChainSettings {
    fn from(config: &ChainConfig) -> Self {
        Self {
            inactivity_timeout: span_seconds(config.inactivity_timeout_seconds),
            retention: span_seconds(config.retention_seconds),
            max_events: config.max_events_per_chain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainUpdate {
    pub chain_id: Uuid,
    pub created: bool,
    pub reactivated: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainStatistics {
    pub total_chains: usize,
    pub active_chains: usize,
    pub avg_stages: f64,
    pub unique_attackers: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainSweep {
    pub dormant: usize,
    pub evicted: usize,
}

/// Per-attacker kill-chain tracking.
///
/// One chain per attacker IP at a time, indexed by attacker so lookups never
/// scan. A chain left idle past retention is replaced by a fresh one on the
/// attacker's next event.
pub struct ChainTracker {
    chains: HashMap<Uuid, ChainRecord>,
    by_attacker: HashMap<IpAddr, Uuid>,
    settings: ChainSettings,
}

impl ChainTracker {
    pub fn new(settings: ChainSettings) -> Self {
        Self {
            chains: HashMap::new(),
            by_attacker: HashMap::new(),
            settings,
        }
    }

    pub fn set_settings(&mut self, settings: ChainSettings) {
        self.settings = settings;
    }

    /// Attribute an event to its attacker's chain.
    ///
    /// An event without a known stage only extends an existing chain; it
    /// never opens one.
    pub fn record(&mut self, event: &Event, stage: KillChainStage) -> Option<ChainUpdate> {
        let attacker = event.src_ip;

        if let Some(id) = self.by_attacker.get(&attacker).copied() {
            let expired = self
                .chains
                .get(&id)
                .map(|c| event.timestamp - c.last_activity > self.settings.retention)
                .unwrap_or(true);
            if expired {
                self.evict(id);
            }
        }

        let chain_id = match self.by_attacker.get(&attacker) {
            Some(id) => *id,
            None if stage.is_known() => {
                let chain = ChainRecord::new(attacker, event.timestamp);
                let id = chain.id;
                info!(chain_id = %id, attacker_ip = %attacker, stage = %stage, "Attack chain created");
                self.by_attacker.insert(attacker, id);
                self.chains.insert(id, chain);
                id
            }
            None => return None,
        };

        let chain = self.chains.get_mut(&chain_id)?;
        let created = chain.event_count == 0;
        let previous = chain.record(
            ChainEvent {
                event_id: event.id.clone(),
                stage,
                event_type: event.event_type.clone(),
                timestamp: event.timestamp,
                dst_ip: event.dst_ip,
            },
            self.settings.inactivity_timeout,
            self.settings.max_events,
        );

        let reactivated = previous == ChainState::Dormant;
        if reactivated {
            info!(
                chain_id = %chain_id,
                attacker_ip = %attacker,
                event_count = chain.event_count,
                "Attack chain reactivated"
            );
        } else {
            debug!(
                chain_id = %chain_id,
                stages = chain.stages.len(),
                confidence = chain.confidence,
                "Attack chain extended"
            );
        }

        Some(ChainUpdate {
            chain_id,
            created,
            reactivated,
            confidence: chain.confidence,
        })
    }

    fn evict(&mut self, id: Uuid) {
        if let Some(mut chain) = self.chains.remove(&id) {
            chain.state = chain.state.next(ChainInput::RetentionElapsed);
            if self.by_attacker.get(&chain.attacker_ip) == Some(&id) {
                self.by_attacker.remove(&chain.attacker_ip);
            }
            info!(
                chain_id = %id,
                attacker_ip = %chain.attacker_ip,
                state = %chain.state,
                "Attack chain evicted"
            );
        }
    }

    fn view(&self, chain: &ChainRecord, now: DateTime<Utc>) -> AttackChain {
        chain.view(now, self.settings.inactivity_timeout, self.settings.retention)
    }

    /// Chains with activity inside the inactivity timeout, most recent first.
    pub fn active_chains(&self, now: DateTime<Utc>) -> Vec<AttackChain> {
        let mut chains: Vec<AttackChain> = self
            .chains
            .values()
            .filter(|c| c.is_active(now, self.settings.inactivity_timeout))
            .map(|c| self.view(c, now))
            .collect();
        sort_by_activity(&mut chains);
        chains
    }

    pub fn all_chains(&self, now: DateTime<Utc>) -> Vec<AttackChain> {
        let mut chains: Vec<AttackChain> = self.chains.values().map(|c| self.view(c, now)).collect();
        sort_by_activity(&mut chains);
        chains
    }

    pub fn chain(&self, id: Uuid, now: DateTime<Utc>) -> Option<AttackChain> {
        self.chains.get(&id).map(|c| self.view(c, now))
    }

    pub fn chain_for_attacker(&self, attacker: IpAddr, now: DateTime<Utc>) -> Option<AttackChain> {
        self.by_attacker
            .get(&attacker)
            .and_then(|id| self.chains.get(id))
            .map(|c| self.view(c, now))
    }

    /// Current chain confidence per attacker, for correlation.
    pub fn confidence_by_attacker(&self) -> HashMap<IpAddr, f64> {
        self.by_attacker
            .iter()
            .filter_map(|(ip, id)| self.chains.get(id).map(|c| (*ip, c.confidence)))
            .collect()
    }

    pub fn statistics(&self, now: DateTime<Utc>) -> ChainStatistics {
        let total_chains = self.chains.len();
        let active_chains = self
            .chains
            .values()
            .filter(|c| c.is_active(now, self.settings.inactivity_timeout))
            .count();
        let avg_stages = if total_chains == 0 {
            0.0
        } else {
            let stages: usize = self.chains.values().map(|c| c.stages.len()).sum();
            ((stages as f64 / total_chains as f64) * 100.0).round() / 100.0
        };

        ChainStatistics {
            total_chains,
            active_chains,
            avg_stages,
            unique_attackers: self.by_attacker.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Mark idle chains dormant and evict chains past retention.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> ChainSweep {
        let mut report = ChainSweep::default();
        let timeout = self.settings.inactivity_timeout;
        let retention = self.settings.retention;

        let mut expired = Vec::new();
        for chain in self.chains.values_mut() {
            match chain.effective_state(now, timeout, retention) {
                ChainState::Evicted => expired.push(chain.id),
                ChainState::Dormant if chain.state != ChainState::Dormant => {
                    chain.state = chain.state.next(ChainInput::InactivityElapsed);
                    report.dormant += 1;
                    info!(
                        chain_id = %chain.id,
                        attacker_ip = %chain.attacker_ip,
                        stages = chain.stages.len(),
                        "Attack chain dormant"
                    );
                }
                _ => {}
            }
        }

        report.evicted = expired.len();
        for id in expired {
            self.evict(id);
        }
        report
    }
}

fn sort_by_activity(chains: &mut [AttackChain]) {
    chains.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });
}
