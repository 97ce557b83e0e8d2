use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use super::alert::{Alert, AlertKey, AlertRecord, LiveAlert};
use crate::config::{span_seconds, AggregationConfig};
use crate::events::saturating_add;
use crate::scoring::Severity;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub window: Duration,
    pub retention: Duration,
    pub max_related: usize,
    pub recent_capacity: usize,
}

impl From<&AggregationConfig> for AggregatorSettings {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            window: span_seconds(config.window_seconds),
            retention: span_seconds(config.retention_seconds),
            max_related: config.max_related_alerts,
            recent_capacity: config.recent_capacity,
        }
    }
}

#[derive(Debug, Clone)]
struct AlertGroup {
    alert: Alert,
    window_end: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    Opened { group_id: Uuid },
    Merged { group_id: Uuid, count: u64 },
}

impl AggregationOutcome {
    pub fn group_id(&self) -> Uuid {
        match self {
            AggregationOutcome::Opened { group_id } | AggregationOutcome::Merged { group_id, .. } => *group_id,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, AggregationOutcome::Merged { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertStatistics {
    pub total_processed: u64,
    pub suppressed: u64,
    pub suppression_rate: f64,
    pub aggregated_groups: u64,
    pub open_groups: usize,
    pub by_severity: BTreeMap<Severity, u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSweep {
    pub closed: usize,
    pub evicted: usize,
}

/// Folds near-duplicate alerts into groups keyed by
/// `(alert_type, src_ip, dst_ip, protocol)` within a sliding window.
///
/// Counters are maintained on every ingest so statistics never rescan the
/// groups.
pub struct AlertAggregator {
    groups: HashMap<Uuid, AlertGroup>,
    open: HashMap<AlertKey, Uuid>,
    recent: VecDeque<Alert>,
    total_processed: u64,
    groups_created: u64,
    by_severity: BTreeMap<Severity, u64>,
    settings: AggregatorSettings,
}

impl AlertAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            groups: HashMap::new(),
            open: HashMap::new(),
            recent: VecDeque::new(),
            total_processed: 0,
            groups_created: 0,
            by_severity: BTreeMap::new(),
            settings,
        }
    }

    pub fn set_settings(&mut self, settings: AggregatorSettings) {
        self.settings = settings;
    }

    pub fn ingest(&mut self, alert: Alert) -> AggregationOutcome {
        self.total_processed += 1;
        *self.by_severity.entry(alert.severity).or_insert(0) += 1;

        self.recent.push_back(alert.clone());
        while self.recent.len() > self.settings.recent_capacity {
            self.recent.pop_front();
        }

        let key = alert.key();
        if let Some(group_id) = self.open.get(&key).copied() {
            let expired = self
                .groups
                .get(&group_id)
                .map(|group| alert.timestamp > group.window_end)
                .unwrap_or(true);

            if !expired {
                if let Some(group) = self.groups.get_mut(&group_id) {
                    let count = merge(group, &alert, &self.settings);
                    debug!(
                        group_id = %group_id,
                        alert_type = %alert.alert_type,
                        count = count,
                        "Alert folded into open group"
                    );
                    return AggregationOutcome::Merged { group_id, count };
                }
            }

            self.close(group_id, alert.timestamp);
        }

        let group_id = alert.id;
        info!(
            group_id = %group_id,
            alert_type = %alert.alert_type,
            src_ip = %alert.src_ip,
            priority_score = alert.priority_score,
            "Alert group opened"
        );

        self.open.insert(key, group_id);
        self.groups.insert(
            group_id,
            AlertGroup {
                window_end: saturating_add(alert.timestamp, self.settings.window),
                alert,
                closed_at: None,
            },
        );
        self.groups_created += 1;

        AggregationOutcome::Opened { group_id }
    }

    fn close(&mut self, group_id: Uuid, now: DateTime<Utc>) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            if group.closed_at.is_none() {
                group.closed_at = Some(now);
                self.open.remove(&group.alert.key());
                debug!(group_id = %group_id, count = group.alert.count, "Alert group closed");
            }
        }
    }

    /// Open and recently closed groups, highest priority first and most
    /// recent first among equal scores.
    pub fn prioritized(&self, limit: usize) -> Vec<Alert> {
        let mut alerts: Vec<&Alert> = self.groups.values().map(|g| &g.alert).collect();
        sort_by_priority(&mut alerts);
        alerts.into_iter().take(limit).cloned().collect()
    }

    /// Groups that folded at least one duplicate, same ordering.
    pub fn aggregated(&self, limit: usize) -> Vec<Alert> {
        let mut alerts: Vec<&Alert> = self
            .groups
            .values()
            .map(|g| &g.alert)
            .filter(|a| a.count > 1)
            .collect();
        sort_by_priority(&mut alerts);
        alerts.into_iter().take(limit).cloned().collect()
    }

    /// Raw alerts as scored, oldest first.
    pub fn live(&self, limit: usize) -> Vec<LiveAlert> {
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).map(Alert::to_live).collect()
    }

    /// Individual alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<AlertRecord> {
        self.recent.iter().rev().take(limit).map(Alert::to_record).collect()
    }

    pub fn group(&self, id: Uuid) -> Option<Alert> {
        self.groups.get(&id).map(|g| g.alert.clone())
    }

    pub fn statistics(&self) -> AlertStatistics {
        let suppressed = self.total_processed - self.groups_created;
        let suppression_rate = if self.total_processed == 0 {
            0.0
        } else {
            suppressed as f64 / self.total_processed as f64
        };

        AlertStatistics {
            total_processed: self.total_processed,
            suppressed,
            suppression_rate,
            aggregated_groups: self.groups_created,
            open_groups: self.open.len(),
            by_severity: self.by_severity.clone(),
        }
    }

    pub fn open_groups(&self) -> usize {
        self.open.len()
    }

    pub fn retained_groups(&self) -> usize {
        self.groups.len()
    }

    /// Close groups whose window has passed and evict closed groups past
    /// retention.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> AggregatorSweep {
        let expired: Vec<Uuid> = self
            .open
            .values()
            .copied()
            .filter(|id| self.groups.get(id).map(|g| g.window_end < now).unwrap_or(true))
            .collect();

        let mut report = AggregatorSweep::default();
        for id in expired {
            if self.groups.contains_key(&id) {
                self.close(id, now);
                report.closed += 1;
            } else {
                self.open.retain(|_, open_id| *open_id != id);
            }
        }

        let retention = self.settings.retention;
        let before = self.groups.len();
        self.groups.retain(|_, group| match group.closed_at {
            Some(closed_at) => now - closed_at <= retention,
            None => true,
        });
        report.evicted = before - self.groups.len();

        if report.closed > 0 || report.evicted > 0 {
            info!(
                closed = report.closed,
                evicted = report.evicted,
                open = self.open.len(),
                "Alert groups swept"
            );
        }
        report
    }
}

fn merge(group: &mut AlertGroup, alert: &Alert, settings: &AggregatorSettings) -> u64 {
    let target = &mut group.alert;
    target.count += 1;
    target.related_alerts.push(alert.summary());
    if target.related_alerts.len() > settings.max_related {
        let excess = target.related_alerts.len() - settings.max_related;
        target.related_alerts.drain(..excess);
    }

    if alert.priority_score > target.priority_score {
        target.priority_score = alert.priority_score;
        target.severity = alert.severity;
        target.score_breakdown = alert.score_breakdown.clone();
        target.factors = alert.factors.clone();
    }

    if alert.timestamp > target.last_seen {
        target.last_seen = alert.timestamp;
    }

    let extended = saturating_add(alert.timestamp, settings.window);
    if extended > group.window_end {
        group.window_end = extended;
    }

    target.count
}

fn sort_by_priority(alerts: &mut [&Alert]) {
    alerts.sort_by(|a, b| {
        b.priority_score
            .total_cmp(&a.priority_score)
            .then_with(|| b.last_seen.cmp(&a.last_seen))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use crate::events::{Event, RawEvent};
    use crate::scoring::Scorer;
    use crate::taxonomy::Taxonomy;
    use chrono::TimeZone;

    fn settings() -> AggregatorSettings {
        AggregatorSettings {
            window: Duration::minutes(5),
            retention: Duration::hours(1),
            max_related: 50,
            recent_capacity: 100,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn alert(event_type: &str, src: &str, at: DateTime<Utc>, score: f64) -> Alert {
        let event = Event::new(
            RawEvent::new(event_type, src)
                .with_timestamp(at)
                .with_dst_ip("10.0.0.9")
                .with_protocol("TCP"),
        )
        .unwrap();
        let mut scorer = Scorer::new(&ScoringConfig::default(), Taxonomy::default());
        let mut assessment = scorer.assess(&event);
        assessment.score.priority_score = score;
        assessment.score.severity = Severity::from_score(score);
        Alert::from_event(&event, &assessment)
    }

    #[test]
    fn test_duplicates_fold_into_one_group() {
        let mut aggregator = AlertAggregator::new(settings());
        let t = base();

        let first = aggregator.ingest(alert("port_scan", "10.0.0.5", t, 30.0));
        aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::seconds(20), 70.0));
        let third = aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::seconds(40), 50.0));

        assert_eq!(third, AggregationOutcome::Merged { group_id: first.group_id(), count: 3 });

        let groups = aggregator.aggregated(10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 3);
        assert_eq!(groups[0].related_alerts.len(), 2);
        assert_eq!(groups[0].priority_score, 70.0);
        assert_eq!(groups[0].severity, Severity::High);
    }

    #[test]
    fn test_accounting_invariant_holds() {
        let mut aggregator = AlertAggregator::new(settings());
        let t = base();
        for i in 0..10 {
            let src = if i % 3 == 0 { "10.0.0.1" } else { "10.0.0.2" };
            aggregator.ingest(alert("brute_force", src, t + Duration::seconds(i), 45.0));
            let stats = aggregator.statistics();
            assert_eq!(stats.suppressed + stats.aggregated_groups, stats.total_processed);
        }

        let stats = aggregator.statistics();
        assert_eq!(stats.total_processed, 10);
        assert_eq!(stats.aggregated_groups, 2);
        assert!((stats.suppression_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_empty_statistics_are_zero() {
        let aggregator = AlertAggregator::new(settings());
        let stats = aggregator.statistics();
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.suppressed, 0);
        assert_eq!(stats.suppression_rate, 0.0);
        assert_eq!(stats.aggregated_groups, 0);
        assert!(aggregator.prioritized(10).is_empty());
    }

    #[test]
    fn test_alert_after_window_opens_new_group() {
        let mut aggregator = AlertAggregator::new(settings());
        let t = base();

        aggregator.ingest(alert("port_scan", "10.0.0.5", t, 30.0));
        // Each fold extends the window.
        aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::minutes(4), 30.0));
        let extended = aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::minutes(8), 30.0));
        assert!(extended.is_suppressed());

        let late = aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::minutes(20), 30.0));
        assert!(!late.is_suppressed());
        assert_eq!(aggregator.statistics().aggregated_groups, 2);
        assert_eq!(aggregator.open_groups(), 1);
    }

    #[test]
    fn test_related_alerts_are_bounded() {
        let mut aggregator = AlertAggregator::new(AggregatorSettings {
            max_related: 3,
            ..settings()
        });
        let t = base();
        for i in 0..10 {
            aggregator.ingest(alert("port_scan", "10.0.0.5", t + Duration::seconds(i), 30.0));
        }
        let group = &aggregator.aggregated(1)[0];
        assert_eq!(group.count, 10);
        assert_eq!(group.related_alerts.len(), 3);
    }

    #[test]
    fn test_prioritized_ordering_breaks_ties_by_recency() {
        let mut aggregator = AlertAggregator::new(settings());
        let t = base();
        aggregator.ingest(alert("port_scan", "10.0.0.1", t, 50.0));
        aggregator.ingest(alert("port_scan", "10.0.0.2", t + Duration::seconds(5), 50.0));
        aggregator.ingest(alert("brute_force", "10.0.0.3", t, 90.0));

        let ordered: Vec<String> = aggregator
            .prioritized(10)
            .iter()
            .map(|a| a.src_ip.to_string())
            .collect();
        assert_eq!(ordered, vec!["10.0.0.3", "10.0.0.2", "10.0.0.1"]);
        assert_eq!(aggregator.prioritized(1).len(), 1);
    }

    #[test]
    fn test_sweep_closes_then_evicts() {
        let mut aggregator = AlertAggregator::new(settings());
        let t = base();
        aggregator.ingest(alert("port_scan", "10.0.0.5", t, 30.0));

        let report = aggregator.sweep(t + Duration::minutes(10));
        assert_eq!(report, AggregatorSweep { closed: 1, evicted: 0 });
        assert_eq!(aggregator.open_groups(), 0);
        assert_eq!(aggregator.prioritized(10).len(), 1);

        let report = aggregator.sweep(t + Duration::hours(2));
        assert_eq!(report.evicted, 1);
        assert!(aggregator.prioritized(10).is_empty());

        // Counters survive eviction.
        assert_eq!(aggregator.statistics().total_processed, 1);
    }
}
