use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::event::{saturating_sub, Event};
use super::traffic::TrafficRecord;
use crate::config::{span_seconds, EventsConfig};
use crate::scoring::Severity;
use crate::taxonomy::KillChainStage;

/// A retained event together with what the pipeline derived from it.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(skip)]
    pub seq: u64,
    #[serde(skip)]
    pub ingested_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
    pub severity: Severity,
    pub priority_score: f64,
    pub stage: KillChainStage,
    pub attack_type: String,
    pub alert_id: Option<Uuid>,
    /// Feeds the chain tracker and correlation engine.
    #[serde(skip)]
    pub correlatable: bool,
}

impl LogEntry {
    pub fn new(
        event: Event,
        severity: Severity,
        priority_score: f64,
        stage: KillChainStage,
        attack_type: String,
    ) -> Self {
        Self {
            seq: 0,
            ingested_at: Utc::now(),
            event,
            severity,
            priority_score,
            stage,
            attack_type,
            alert_id: None,
            correlatable: stage.is_known(),
        }
    }

    pub fn with_alert(mut self, alert_id: Uuid) -> Self {
        self.alert_id = Some(alert_id);
        self.correlatable = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventStoreSettings {
    pub capacity: usize,
    pub retention: Duration,
}

impl From<&EventsConfig> for EventStoreSettings {
    fn from(config: &EventsConfig) -> Self {
        Self {
            capacity: config.capacity,
            retention: span_seconds(config.retention_seconds),
        }
    }
}

/// Bounded, retention-windowed store of normalized events.
///
/// Entries are kept in ingestion order. A per-source index shares the same
/// `Arc`s so source queries do not scan the whole store.
pub struct EventStore {
    entries: VecDeque<Arc<LogEntry>>,
    by_source: HashMap<String, VecDeque<Arc<LogEntry>>>,
    next_seq: u64,
    settings: EventStoreSettings,
}

impl EventStore {
    pub fn new(settings: EventStoreSettings) -> Self {
        Self {
            entries: VecDeque::new(),
            by_source: HashMap::new(),
            next_seq: 1,
            settings,
        }
    }

    pub fn set_settings(&mut self, settings: EventStoreSettings) {
        self.settings = settings;
    }

    /// Append an entry, assigning its sequence number.
    pub fn append(&mut self, mut entry: LogEntry) -> Arc<LogEntry> {
        entry.seq = self.next_seq;
        self.next_seq += 1;

        let entry = Arc::new(entry);
        self.entries.push_back(entry.clone());
        self.by_source
            .entry(entry.event.source_type.clone())
            .or_default()
            .push_back(entry.clone());

        while self.entries.len() > self.settings.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.drop_from_source_index(&evicted);
            }
        }

        entry
    }

    fn drop_from_source_index(&mut self, evicted: &LogEntry) {
        if let Some(queue) = self.by_source.get_mut(&evicted.event.source_type) {
            while queue.front().map(|e| e.seq <= evicted.seq).unwrap_or(false) {
                queue.pop_front();
            }
            if queue.is_empty() {
                self.by_source.remove(&evicted.event.source_type);
            }
        }
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).map(|e| (**e).clone()).collect()
    }

    /// Protocol-bearing entries, newest first.
    pub fn recent_traffic(&self, limit: usize) -> Vec<TrafficRecord> {
        self.entries
            .iter()
            .rev()
            .filter_map(|e| TrafficRecord::from_entry(e))
            .take(limit)
            .collect()
    }

    pub fn by_source(&self, source_type: &str, limit: usize) -> Vec<LogEntry> {
        let key = source_type.trim().to_lowercase();
        self.by_source
            .get(&key)
            .map(|queue| queue.iter().rev().take(limit).map(|e| (**e).clone()).collect())
            .unwrap_or_default()
    }

    pub fn by_ip(&self, ip: IpAddr, limit: usize) -> Vec<LogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.event.src_ip == ip || e.event.dst_ip == Some(ip))
            .take(limit)
            .map(|e| (**e).clone())
            .collect()
    }

    /// Correlatable entries plus the highest sequence number assigned so far.
    pub fn correlatable_snapshot(&self) -> (Vec<Arc<LogEntry>>, u64) {
        let entries = self.entries.iter().filter(|e| e.correlatable).cloned().collect();
        (entries, self.last_seq())
    }

    /// Correlatable entries appended after `seq`, in sequence order.
    pub fn correlatable_since(&self, seq: u64) -> Vec<Arc<LogEntry>> {
        let start = self.entries.partition_point(|e| e.seq <= seq);
        self.entries
            .iter()
            .skip(start)
            .filter(|e| e.correlatable)
            .cloned()
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_counts(&self) -> HashMap<String, usize> {
        self.by_source.iter().map(|(k, v)| (k.clone(), v.len())).collect()
    }

    /// Drop entries ingested before the retention horizon.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = saturating_sub(now, self.settings.retention);
        let mut evicted = 0;

        while self.entries.front().map(|e| e.ingested_at < horizon).unwrap_or(false) {
            if let Some(entry) = self.entries.pop_front() {
                self.drop_from_source_index(&entry);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted = evicted, retained = self.entries.len(), "Event store swept");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawEvent;

    fn entry(event_type: &str, src: &str, source_type: &str) -> LogEntry {
        let event = Event::new(RawEvent::new(event_type, src).with_source_type(source_type)).unwrap();
        LogEntry::new(event, Severity::Low, 10.0, KillChainStage::Unknown, event_type.to_string())
    }

    fn store(capacity: usize) -> EventStore {
        EventStore::new(EventStoreSettings {
            capacity,
            retention: Duration::hours(1),
        })
    }

    #[test]
    fn test_recent_and_by_source_are_newest_first() {
        let mut store = store(100);
        store.append(entry("login", "10.0.0.1", "syslog"));
        store.append(entry("deny", "10.0.0.2", "firewall"));
        store.append(entry("logout", "10.0.0.3", "syslog"));

        let recent = store.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].event.event_type, "logout");

        let syslog = store.by_source("SYSLOG", 10);
        assert_eq!(syslog.len(), 2);
        assert_eq!(syslog[0].event.event_type, "logout");

        assert!(store.by_source("windows", 10).is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_from_both_indexes() {
        let mut store = store(2);
        store.append(entry("a", "10.0.0.1", "syslog"));
        store.append(entry("b", "10.0.0.2", "firewall"));
        store.append(entry("c", "10.0.0.3", "firewall"));

        assert_eq!(store.len(), 2);
        assert!(store.by_source("syslog", 10).is_empty());
        assert_eq!(store.by_source("firewall", 10).len(), 2);
        assert_eq!(store.last_seq(), 3);
    }

    #[test]
    fn test_correlatable_since_returns_only_newer_entries() {
        let mut store = store(100);
        let first = store.append(entry("port_scan", "10.0.0.1", "network").with_alert(Uuid::new_v4()));
        store.append(entry("heartbeat", "10.0.0.1", "network"));
        store.append(entry("brute_force", "10.0.0.1", "network").with_alert(Uuid::new_v4()));

        let newer = store.correlatable_since(first.seq);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].event.event_type, "brute_force");

        let (snapshot, last) = store.correlatable_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(last, 3);
    }

    #[test]
    fn test_sweep_drops_entries_past_retention() {
        let mut store = store(100);
        store.append(entry("a", "10.0.0.1", "syslog"));
        store.append(entry("b", "10.0.0.2", "syslog"));

        assert_eq!(store.sweep(Utc::now()), 0);
        assert_eq!(store.sweep(Utc::now() + Duration::hours(2)), 2);
        assert!(store.is_empty());
        assert!(store.source_counts().is_empty());
    }

    #[test]
    fn test_by_ip_matches_source_or_destination() {
        let mut store = store(100);
        let event = Event::new(RawEvent::new("conn", "10.0.0.1").with_dst_ip("10.0.0.9")).unwrap();
        store.append(LogEntry::new(event, Severity::Low, 0.0, KillChainStage::Unknown, "conn".into()));
        store.append(entry("other", "10.0.0.2", "syslog"));

        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(store.by_ip(ip, 10).len(), 1);
    }
}
