use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics;
use crate::pipeline::Engine;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub events_evicted: usize,
    pub groups_closed: usize,
    pub groups_evicted: usize,
    pub chains_dormant: usize,
    pub chains_evicted: usize,
    pub threats_evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// One eviction pass over every store. Each store is locked on its own, so
/// readers are held off for one store at a time.
pub async fn sweep_once(engine: &Engine, now: DateTime<Utc>) -> SweepReport {
    let events_evicted = engine.events.write().await.sweep(now);

    let (alerts, open_groups) = {
        let mut aggregator = engine.alerts.write().await;
        (aggregator.sweep(now), aggregator.open_groups())
    };
    metrics::OPEN_ALERT_GROUPS.set(open_groups as i64);

    let (chains, active_chains) = {
        let mut tracker = engine.chains.write().await;
        let sweep = tracker.sweep(now);
        (sweep, tracker.statistics(now).active_chains)
    };
    metrics::ACTIVE_CHAINS.set(active_chains as i64);

    let threats_evicted = engine.correlation.sweep(now).await;

    SweepReport {
        events_evicted,
        groups_closed: alerts.closed,
        groups_evicted: alerts.evicted,
        chains_dormant: chains.dormant,
        chains_evicted: chains.evicted,
        threats_evicted,
    }
}

/// Run `sweep_once` on a fixed interval until the task is aborted.
pub fn spawn_sweeper(engine: Arc<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_seconds = interval.as_secs(), "Eviction sweeper started");

        loop {
            ticker.tick().await;
            let report = sweep_once(&engine, Utc::now()).await;
            if report.is_empty() {
                debug!("Sweep found nothing to evict");
            } else {
                info!(
                    events_evicted = report.events_evicted,
                    groups_closed = report.groups_closed,
                    groups_evicted = report.groups_evicted,
                    chains_dormant = report.chains_dormant,
                    chains_evicted = report.chains_evicted,
                    threats_evicted = report.threats_evicted,
                    "Sweep completed"
                );
            }
        }
    })
}
