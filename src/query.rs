use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::alerts::{Alert, AlertRecord, AlertStatistics, LiveAlert};
use crate::chains::{AttackChain, ChainStatistics};
use crate::config::QueryConfig;
use crate::correlation::{CorrelatedThreat, CorrelationSummary, TimelineEntry};
use crate::events::{LogEntry, TrafficRecord, TrafficStats};
use crate::metrics;
use crate::pipeline::Engine;

/// Totals across every store, for the dashboard header.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub events_retained: usize,
    pub alerts_processed: u64,
    pub alerts_suppressed: u64,
    pub open_groups: usize,
    pub total_chains: usize,
    pub active_chains: usize,
    pub total_threats: usize,
    pub total_packets: u64,
    pub protocols: BTreeMap<String, u64>,
    pub sources: BTreeMap<String, usize>,
    pub correlation_generation: u64,
    pub uptime_seconds: u64,
}

/// Clamp a requested row count. Missing, unparseable or zero values fall
/// back to the default; anything above the cap is cut to the cap.
pub fn clamp_limit(requested: Option<&str>, limits: &QueryConfig) -> usize {
    let default = limits.default_limit.min(limits.max_limit);
    match requested.and_then(|raw| raw.trim().parse::<usize>().ok()) {
        Some(0) | None => default,
        Some(n) => n.min(limits.max_limit),
    }
}

/// Read-only views over the engine's stores. Every call takes its own
/// snapshot under a read lock and never fails on empty state.
#[derive(Clone)]
pub struct QueryFacade {
    engine: Arc<Engine>,
}

impl QueryFacade {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn limit(&self, requested: Option<&str>) -> usize {
        clamp_limit(requested, &*self.engine.query.read().await)
    }

    fn record(endpoint: &str) {
        metrics::QUERY_TOTAL.with_label_values(&[endpoint]).inc();
    }

    pub async fn prioritized(&self, limit: usize) -> Vec<Alert> {
        Self::record("prioritized");
        self.engine.alerts.read().await.prioritized(limit)
    }

    pub async fn aggregated(&self, limit: usize) -> Vec<Alert> {
        Self::record("aggregated");
        self.engine.alerts.read().await.aggregated(limit)
    }

    pub async fn alert_statistics(&self) -> AlertStatistics {
        Self::record("alert_statistics");
        self.engine.alerts.read().await.statistics()
    }

    pub async fn alert_history(&self, limit: usize) -> Vec<AlertRecord> {
        Self::record("alert_history");
        self.engine.alerts.read().await.history(limit)
    }

    pub async fn live_alerts(&self, limit: usize) -> Vec<LiveAlert> {
        Self::record("live_alerts");
        self.engine.alerts.read().await.live(limit)
    }

    pub async fn active_chains(&self) -> Vec<AttackChain> {
        Self::record("active_chains");
        let limit = self.engine.query.read().await.max_limit;
        let mut chains = self.engine.chains.read().await.active_chains(Utc::now());
        chains.truncate(limit);
        chains
    }

    pub async fn all_chains(&self) -> Vec<AttackChain> {
        Self::record("all_chains");
        let limit = self.engine.query.read().await.max_limit;
        let mut chains = self.engine.chains.read().await.all_chains(Utc::now());
        chains.truncate(limit);
        chains
    }

    pub async fn chain_statistics(&self) -> ChainStatistics {
        Self::record("chain_statistics");
        self.engine.chains.read().await.statistics(Utc::now())
    }

    pub async fn chain(&self, id: Uuid) -> Option<AttackChain> {
        Self::record("chain");
        self.engine.chains.read().await.chain(id, Utc::now())
    }

    pub async fn threats(&self, limit: usize) -> Vec<CorrelatedThreat> {
        Self::record("threats");
        self.engine.correlation.threats(limit).await
    }

    pub async fn threat(&self, id: Uuid) -> Option<CorrelatedThreat> {
        Self::record("threat");
        self.engine.correlation.threat(id).await
    }

    pub async fn correlation_summary(&self) -> CorrelationSummary {
        Self::record("correlation_summary");
        self.engine.correlation.summary(Utc::now()).await
    }

    pub async fn timeline(&self, limit: usize) -> Vec<TimelineEntry> {
        Self::record("timeline");
        self.engine.correlation.timeline(limit).await
    }

    pub async fn logs_recent(&self, limit: usize) -> Vec<LogEntry> {
        Self::record("logs_recent");
        self.engine.events.read().await.recent(limit)
    }

    pub async fn logs_by_source(&self, source: &str, limit: usize) -> Vec<LogEntry> {
        Self::record("logs_by_source");
        self.engine.events.read().await.by_source(source, limit)
    }

    pub async fn traffic_by_ip(&self, ip: IpAddr, limit: usize) -> Vec<LogEntry> {
        Self::record("traffic_by_ip");
        self.engine.events.read().await.by_ip(ip, limit)
    }

    pub async fn traffic_recent(&self, limit: usize) -> Vec<TrafficRecord> {
        Self::record("traffic_recent");
        self.engine.events.read().await.recent_traffic(limit)
    }

    pub async fn traffic(&self) -> TrafficStats {
        Self::record("traffic");
        self.engine.traffic.read().await.clone()
    }

    pub async fn summary(&self) -> StatsSummary {
        Self::record("summary");
        let now = Utc::now();

        let (events_retained, sources): (usize, BTreeMap<String, usize>) = {
            let events = self.engine.events.read().await;
            (events.len(), events.source_counts().into_iter().collect())
        };
        let alerts = self.engine.alerts.read().await.statistics();
        let chains = self.engine.chains.read().await.statistics(now);
        let total_threats = self.engine.correlation.state().read().await.len();
        let traffic = self.engine.traffic.read().await.clone();

        StatsSummary {
            events_retained,
            alerts_processed: alerts.total_processed,
            alerts_suppressed: alerts.suppressed,
            open_groups: alerts.open_groups,
            total_chains: chains.total_chains,
            active_chains: chains.active_chains,
            total_threats,
            total_packets: traffic.total_packets,
            protocols: traffic.protocols,
            sources,
            correlation_generation: self.engine.correlation.generation(),
            uptime_seconds: self.engine.uptime_seconds(),
        }
    }
}
