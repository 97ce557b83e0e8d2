use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::threat::{CorrelatedThreat, ThreatEvent, ThreatRecord};
use crate::chains::ChainTracker;
use crate::config::{span_seconds, CorrelationConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{saturating_sub, EventStore, LogEntry};
use crate::metrics;
use crate::scoring::Severity;

/// Records between supersession checks during a rebuild.
const ABORT_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone)]
pub struct CorrelationSettings {
    pub window: Duration,
    pub max_events_per_threat: usize,
    pub timeline_limit: usize,
    pub retention: Duration,
}

impl From<&CorrelationConfig> for CorrelationSettings {
    fn from(config: &CorrelationConfig) -> Self {
        Self {
            window: span_seconds(config.window_seconds),
            max_events_per_threat: config.max_events_per_threat,
            timeline_limit: config.timeline_limit,
            retention: span_seconds(config.retention_seconds),
        }
    }
}

/// One generation of correlated threats.
///
/// Owned behind the engine's lock; a recompute builds a fresh set off to the
/// side and swaps it in whole.
#[derive(Debug, Clone)]
pub struct ThreatSet {
    pub generation: u64,
    threats: HashMap<Uuid, ThreatRecord>,
    by_source: HashMap<IpAddr, Uuid>,
    by_target: HashMap<IpAddr, Uuid>,
    /// Highest event sequence number reflected in this set.
    last_seq: u64,
    settings: CorrelationSettings,
}

impl ThreatSet {
    pub fn new(generation: u64, settings: CorrelationSettings) -> Self {
        Self {
            generation,
            threats: HashMap::new(),
            by_source: HashMap::new(),
            by_target: HashMap::new(),
            last_seq: 0,
            settings,
        }
    }

    pub fn set_settings(&mut self, settings: CorrelationSettings) {
        self.settings = settings;
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Attach an entry to a threat sharing its source (or a threat that
    /// targeted its source) within the correlation window, else open a new
    /// one. Entries already reflected in this set are skipped.
    pub fn apply(&mut self, entry: &LogEntry, chain_confidence: Option<f64>) -> Option<Uuid> {
        if entry.seq != 0 && entry.seq <= self.last_seq {
            return None;
        }
        self.last_seq = self.last_seq.max(entry.seq);
        self.attach(entry, chain_confidence)
    }

    fn attach(&mut self, entry: &LogEntry, chain_confidence: Option<f64>) -> Option<Uuid> {
        let src = entry.event.src_ip;
        let at = entry.event.timestamp;
        let window = self.settings.window;

        let candidate = [self.by_source.get(&src), self.by_target.get(&src)]
            .into_iter()
            .flatten()
            .copied()
            .find(|id| self.threats.get(id).map(|t| t.within_window(at, window)).unwrap_or(false));

        let id = match candidate {
            Some(id) => id,
            None => {
                let threat = ThreatRecord::open(entry);
                let id = threat.id;
                debug!(
                    threat_id = %id,
                    src_ip = %src,
                    attack_type = %entry.attack_type,
                    "Correlated threat opened"
                );
                self.threats.insert(id, threat);
                id
            }
        };

        let threat = self.threats.get_mut(&id)?;
        threat.absorb(entry, chain_confidence, self.settings.max_events_per_threat);

        self.by_source.insert(src, id);
        if let Some(dst) = entry.event.dst_ip {
            self.by_target.insert(dst, id);
        }
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.threats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threats.is_empty()
    }

    pub fn views(&self) -> Vec<CorrelatedThreat> {
        let mut threats: Vec<CorrelatedThreat> = self.threats.values().map(ThreatRecord::view).collect();
        threats.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });
        threats
    }

    pub fn view(&self, id: Uuid) -> Option<CorrelatedThreat> {
        self.threats.get(&id).map(ThreatRecord::view)
    }

    /// Drop threats idle past retention.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = saturating_sub(now, self.settings.retention);
        let before = self.threats.len();
        self.threats.retain(|_, t| t.last_seen >= horizon);
        let threats = &self.threats;
        self.by_source.retain(|_, id| threats.contains_key(id));
        self.by_target.retain(|_, id| threats.contains_key(id));
        before - self.threats.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Superseded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub status: RunStatus,
    pub generation: u64,
    pub threat_count: usize,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationSummary {
    pub total_threats: usize,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub total_events: u64,
    pub active_threats: usize,
    pub generation: u64,
    pub last_run: Option<RunOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub threat_id: Uuid,
    pub threat_attack_type: String,
    /// Narrative of the owning threat.
    pub narrative: String,
    pub description: String,
    #[serde(flatten)]
    pub event: ThreatEvent,
}

/// Cross-source correlation of alerts, chains and logs into threats.
pub struct CorrelationEngine {
    state: RwLock<ThreatSet>,
    generation: AtomicU64,
    last_run: RwLock<Option<RunOutcome>>,
    events: Arc<RwLock<EventStore>>,
    chains: Arc<RwLock<ChainTracker>>,
}

impl CorrelationEngine {
    pub fn new(
        settings: CorrelationSettings,
        events: Arc<RwLock<EventStore>>,
        chains: Arc<RwLock<ChainTracker>>,
    ) -> Self {
        Self {
            state: RwLock::new(ThreatSet::new(0, settings)),
            generation: AtomicU64::new(0),
            last_run: RwLock::new(None),
            events,
            chains,
        }
    }

    /// The live set. Incremental ingestion writes through this lock.
    pub fn state(&self) -> &RwLock<ThreatSet> {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn set_settings(&self, settings: CorrelationSettings) {
        self.state.write().await.set_settings(settings);
    }

    /// Discard all threats and rebuild from the retained corpus.
    ///
    /// The newest invocation wins: an older run that notices a newer
    /// generation stops and reports `Superseded`, leaving the live set
    /// untouched. Ingestion continues throughout; entries it appends while
    /// the rebuild runs are replayed onto the new set before the swap.
    pub async fn run(&self) -> RunOutcome {
        let started = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation = generation, "Correlation run started");

        let result = self.rebuild(generation).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(threat_count) => {
                info!(
                    generation = generation,
                    threats = threat_count,
                    duration_ms = duration_ms,
                    "Correlation run completed"
                );
                RunOutcome {
                    success: true,
                    status: RunStatus::Completed,
                    generation,
                    threat_count,
                    duration_ms,
                    finished_at: Utc::now(),
                }
            }
            Err(err) => {
                match &err {
                    EngineError::RecomputeAborted { .. } => {
                        info!(generation = generation, "Correlation run superseded")
                    }
                    other => warn!(generation = generation, error = %other, "Correlation run failed"),
                }
                RunOutcome {
                    success: true,
                    status: RunStatus::Superseded,
                    generation,
                    threat_count: self.state.read().await.len(),
                    duration_ms,
                    finished_at: Utc::now(),
                }
            }
        };

        metrics::CORRELATION_RUNS
            .with_label_values(&[outcome.status.as_str()])
            .inc();
        metrics::CORRELATION_RUN_DURATION.observe(started.elapsed().as_secs_f64());

        if outcome.status == RunStatus::Completed {
            *self.last_run.write().await = Some(outcome.clone());
        }
        outcome
    }

    fn check_current(&self, generation: u64) -> EngineResult<()> {
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(EngineError::RecomputeAborted { generation });
        }
        Ok(())
    }

    async fn rebuild(&self, generation: u64) -> EngineResult<usize> {
        let (mut snapshot, snapshot_seq) = self.events.read().await.correlatable_snapshot();
        let confidences = self.chains.read().await.confidence_by_attacker();
        let settings = self.state.read().await.settings.clone();

        snapshot.sort_by(|a, b| {
            a.event
                .timestamp
                .cmp(&b.event.timestamp)
                .then_with(|| a.seq.cmp(&b.seq))
        });

        let mut next = ThreatSet::new(generation, settings);
        for (i, entry) in snapshot.iter().enumerate() {
            if i % ABORT_CHECK_INTERVAL == 0 {
                self.check_current(generation)?;
                tokio::task::yield_now().await;
            }
            next.attach(entry, confidences.get(&entry.event.src_ip).copied());
        }
        next.last_seq = snapshot_seq;

        let mut live = self.state.write().await;
        self.check_current(generation)?;

        let pending = self.events.read().await.correlatable_since(snapshot_seq);
        if !pending.is_empty() {
            let confidences = self.chains.read().await.confidence_by_attacker();
            debug!(generation = generation, replayed = pending.len(), "Replaying entries ingested during rebuild");
            for entry in pending {
                next.apply(&entry, confidences.get(&entry.event.src_ip).copied());
            }
        }

        let count = next.len();
        *live = next;
        Ok(count)
    }

    pub async fn threats(&self, limit: usize) -> Vec<CorrelatedThreat> {
        let mut threats = self.state.read().await.views();
        threats.truncate(limit);
        threats
    }

    pub async fn threat(&self, id: Uuid) -> Option<CorrelatedThreat> {
        self.state.read().await.view(id)
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> CorrelationSummary {
        let state = self.state.read().await;
        let mut summary = CorrelationSummary {
            total_threats: state.len(),
            critical_count: 0,
            high_count: 0,
            medium_count: 0,
            low_count: 0,
            total_events: 0,
            active_threats: 0,
            generation: state.generation,
            last_run: self.last_run.read().await.clone(),
        };

        for threat in state.threats.values() {
            match threat.severity() {
                Severity::Critical => summary.critical_count += 1,
                Severity::High => summary.high_count += 1,
                Severity::Medium => summary.medium_count += 1,
                Severity::Low => summary.low_count += 1,
            }
            summary.total_events += threat.event_count;
            if now - threat.last_seen <= state.settings.window {
                summary.active_threats += 1;
            }
        }
        summary
    }

    /// Key events across all threats, newest first.
    pub async fn timeline(&self, limit: usize) -> Vec<TimelineEntry> {
        let state = self.state.read().await;
        let limit = limit.min(state.settings.timeline_limit);

        let mut entries: Vec<TimelineEntry> = state
            .threats
            .values()
            .flat_map(|threat| {
                let attack_type = threat.attack_type();
                let narrative = threat.narrative();
                threat.events.iter().map(move |event| TimelineEntry {
                    threat_id: threat.id,
                    threat_attack_type: attack_type.clone(),
                    narrative: narrative.clone(),
                    description: event.description(),
                    event: event.clone(),
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.event
                .timestamp
                .cmp(&a.event.timestamp)
                .then_with(|| b.event.priority_score.total_cmp(&a.event.priority_score))
        });
        entries.truncate(limit);
        entries
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.state.write().await.sweep(now);
        if evicted > 0 {
            info!(evicted = evicted, "Correlated threats swept");
        }
        evicted
    }
}
