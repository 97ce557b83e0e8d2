use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{AggregationOutcome, AggregatorSettings, Alert, AlertAggregator};
use crate::chains::{ChainSettings, ChainTracker, ChainUpdate};
use crate::config::{EngineConfig, IngestionConfig, QueryConfig};
use crate::correlation::{CorrelationEngine, CorrelationSettings};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventStore, EventStoreSettings, LogEntry, RawEvent, TrafficStats};
use crate::metrics;
use crate::scoring::Scorer;
use crate::taxonomy::Taxonomy;

/// The shared stores. Each sits behind its own lock and is written only by
/// the ingestion worker (and the sweeper); readers take snapshots.
pub struct Engine {
    pub events: Arc<RwLock<EventStore>>,
    pub traffic: Arc<RwLock<TrafficStats>>,
    pub alerts: Arc<RwLock<AlertAggregator>>,
    pub chains: Arc<RwLock<ChainTracker>>,
    pub correlation: Arc<CorrelationEngine>,
    pub query: RwLock<QueryConfig>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let events = Arc::new(RwLock::new(EventStore::new(EventStoreSettings::from(&config.events))));
        let chains = Arc::new(RwLock::new(ChainTracker::new(ChainSettings::from(&config.chains))));
        let correlation = Arc::new(CorrelationEngine::new(
            CorrelationSettings::from(&config.correlation),
            events.clone(),
            chains.clone(),
        ));

        Self {
            events,
            traffic: Arc::new(RwLock::new(TrafficStats::default())),
            alerts: Arc::new(RwLock::new(AlertAggregator::new(AggregatorSettings::from(&config.aggregation)))),
            chains,
            correlation,
            query: RwLock::new(config.query.clone()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Push window and retention settings into every store.
    pub async fn apply_settings(&self, config: &EngineConfig) {
        self.events.write().await.set_settings(EventStoreSettings::from(&config.events));
        self.alerts.write().await.set_settings(AggregatorSettings::from(&config.aggregation));
        self.chains.write().await.set_settings(ChainSettings::from(&config.chains));
        self.correlation
            .set_settings(CorrelationSettings::from(&config.correlation))
            .await;
        *self.query.write().await = config.query.clone();
    }
}

#[derive(Debug)]
pub enum PipelineCommand {
    Ingest(Box<Event>),
    Reconfigure(Box<EngineConfig>),
}

/// Producer side of the ingestion queue. Cheap to clone.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
    depth: Arc<AtomicUsize>,
}

impl IngestHandle {
    /// Normalize and enqueue one event. Malformed events are rejected here
    /// and never reach the worker.
    pub fn submit(&self, raw: RawEvent) -> EngineResult<()> {
        let event = match Event::new(raw) {
            Ok(event) => event,
            Err(err) => {
                metrics::EVENTS_REJECTED.with_label_values(&[err.kind()]).inc();
                debug!(error = %err, "Event rejected at ingestion boundary");
                return Err(err);
            }
        };
        self.send(PipelineCommand::Ingest(Box::new(event)))
    }

    pub fn reconfigure(&self, config: EngineConfig) -> EngineResult<()> {
        self.send(PipelineCommand::Reconfigure(Box::new(config)))
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// False once the worker has stopped.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, command: PipelineCommand) -> EngineResult<()> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(command).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::PipelineClosed);
        }
        metrics::INGEST_QUEUE_DEPTH.set(self.queue_depth() as i64);
        Ok(())
    }
}

/// Lock acquisition policy for store writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl From<&IngestionConfig> for RetryPolicy {
    fn from(config: &IngestionConfig) -> Self {
        Self {
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to one base interval of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = if base > 0 { rand::thread_rng().gen_range(0..=base) } else { 0 };
        Duration::from_millis(exp + jitter)
    }

    /// Acquire `lock` for writing, retrying on timeout.
    pub async fn write<'a, T>(&self, store: &'static str, lock: &'a RwLock<T>) -> EngineResult<RwLockWriteGuard<'a, T>> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.lock_timeout, lock.write()).await {
                Ok(guard) => return Ok(guard),
                Err(_) if attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    debug!(store = store, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Store lock contended, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(_) => {
                    return Err(EngineError::TransientStore {
                        store,
                        attempts: attempt + 1,
                    })
                }
            }
        }
    }
}

/// What one event produced as it moved through the stores.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub seq: u64,
    pub alert_id: Option<Uuid>,
    pub aggregation: Option<AggregationOutcome>,
    pub chain: Option<ChainUpdate>,
    pub threat_id: Option<Uuid>,
}

/// Single consumer of the ingestion queue. Owns the scorer and is the only
/// writer of the stores on the ingestion path.
pub struct IngestionPipeline {
    engine: Arc<Engine>,
    scorer: Scorer,
    retry: RetryPolicy,
    rx: mpsc::UnboundedReceiver<PipelineCommand>,
    depth: Arc<AtomicUsize>,
}

impl IngestionPipeline {
    pub fn new(engine: Arc<Engine>, config: &EngineConfig) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let scorer = Scorer::new(&config.scoring, Taxonomy::with_overrides(&config.taxonomy.rules));

        let pipeline = Self {
            engine,
            scorer,
            retry: RetryPolicy::from(&config.ingestion),
            rx,
            depth: depth.clone(),
        };
        (pipeline, IngestHandle { tx, depth })
    }

    /// Drain the queue until every handle is dropped.
    pub async fn run(mut self) {
        info!("Ingestion pipeline started");
        while let Some(command) = self.rx.recv().await {
            let remaining = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            metrics::INGEST_QUEUE_DEPTH.set(remaining as i64);

            match command {
                PipelineCommand::Ingest(event) => {
                    let event_id = event.id.clone();
                    if let Err(err) = self.process(*event).await {
                        error!(event_id = %event_id, error = %err, "Event dropped");
                    }
                }
                PipelineCommand::Reconfigure(config) => self.reconfigure(*config).await,
            }
        }
        info!("Ingestion pipeline stopped");
    }

    async fn reconfigure(&mut self, config: EngineConfig) {
        self.scorer
            .reconfigure(&config.scoring, Taxonomy::with_overrides(&config.taxonomy.rules));
        self.retry = RetryPolicy::from(&config.ingestion);
        self.engine.apply_settings(&config).await;
        info!(
            taxonomy_rules = self.scorer.taxonomy().len(),
            "Scoring rules and store settings reconfigured"
        );

        // Rules changed: rebuild threats without stalling the queue.
        let correlation = self.engine.correlation.clone();
        tokio::spawn(async move {
            correlation.run().await;
        });
    }

    /// Score one event and apply it to each store in turn: event store,
    /// traffic stats, aggregator, chain tracker, correlation engine.
    pub async fn process(&mut self, event: Event) -> EngineResult<IngestOutcome> {
        let assessment = self.scorer.assess(&event);
        let alert = assessment.alert.then(|| Alert::from_event(&event, &assessment));

        let mut entry = LogEntry::new(
            event,
            assessment.score.severity,
            assessment.score.priority_score,
            assessment.classification.stage,
            assessment.classification.attack_type.clone(),
        );
        if let Some(alert) = &alert {
            entry = entry.with_alert(alert.id);
        }

        let entry = {
            let mut events = self.guarded("events", &*self.engine.events).await?;
            events.append(entry)
        };

        self.guarded("traffic", &*self.engine.traffic)
            .await?
            .record(&entry.event);

        let aggregation = match alert {
            Some(alert) => {
                let mut aggregator = self.guarded("aggregator", &*self.engine.alerts).await?;
                let outcome = aggregator.ingest(alert);
                metrics::ALERTS_PROCESSED.inc();
                if outcome.is_suppressed() {
                    metrics::ALERTS_SUPPRESSED.inc();
                }
                metrics::OPEN_ALERT_GROUPS.set(aggregator.open_groups() as i64);
                Some(outcome)
            }
            None => None,
        };

        let (chain, threat_id) = if entry.correlatable {
            let chain = self
                .guarded("chains", &*self.engine.chains)
                .await?
                .record(&entry.event, entry.stage);

            let mut threats = self.guarded("correlation", self.engine.correlation.state()).await?;
            let threat_id = threats.apply(&entry, chain.as_ref().map(|c| c.confidence));
            (chain, threat_id)
        } else {
            (None, None)
        };

        metrics::EVENTS_INGESTED.inc();
        debug!(
            event_id = %entry.event.id,
            seq = entry.seq,
            score = entry.priority_score,
            severity = %entry.severity,
            "Event ingested"
        );

        Ok(IngestOutcome {
            seq: entry.seq,
            alert_id: entry.alert_id,
            aggregation,
            chain,
            threat_id,
        })
    }

    async fn guarded<'a, T>(&self, store: &'static str, lock: &'a RwLock<T>) -> EngineResult<RwLockWriteGuard<'a, T>> {
        self.retry.write(store, lock).await.map_err(|err| {
            metrics::EVENTS_DROPPED.with_label_values(&[store]).inc();
            warn!(store = store, error = %err, "Store write lock unavailable");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::extra_keys;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn pipeline() -> (IngestionPipeline, IngestHandle, Arc<Engine>) {
        let config = EngineConfig::default();
        let engine = Arc::new(Engine::new(&config));
        let (pipeline, handle) = IngestionPipeline::new(engine.clone(), &config);
        (pipeline, handle, engine)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(minutes)
    }

    fn event(event_type: &str, src: &str, minutes: i64) -> Event {
        Event::new(
            RawEvent::new(event_type, src)
                .with_timestamp(at(minutes))
                .with_dst_ip("10.0.0.9")
                .with_protocol("tcp")
                .with_source_type("network"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_alert_flows_through_every_store() {
        let (mut pipeline, _handle, engine) = pipeline();

        let outcome = pipeline.process(event("port_scan", "203.0.113.7", 0)).await.unwrap();
        assert_eq!(outcome.seq, 1);
        assert!(outcome.alert_id.is_some());
        assert!(matches!(outcome.aggregation, Some(AggregationOutcome::Opened { .. })));
        assert!(outcome.chain.as_ref().map(|c| c.created).unwrap_or(false));
        assert!(outcome.threat_id.is_some());

        assert_eq!(engine.events.read().await.len(), 1);
        assert_eq!(engine.traffic.read().await.total_packets, 1);
        assert_eq!(engine.alerts.read().await.statistics().total_processed, 1);
        assert_eq!(engine.chains.read().await.len(), 1);
        assert_eq!(engine.correlation.state().read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_low_score_event_stays_out_of_chains() {
        let (mut pipeline, _handle, engine) = pipeline();

        let event = Event::new(
            RawEvent::new("heartbeat", "10.0.0.1")
                .with_timestamp(at(0))
                .with_extra(extra_keys::SEVERITY, serde_json::json!("low")),
        )
        .unwrap();
        let outcome = pipeline.process(event).await.unwrap();

        assert!(outcome.alert_id.is_none());
        assert!(outcome.chain.is_none());
        assert!(outcome.threat_id.is_none());
        assert_eq!(engine.events.read().await.len(), 1);
        assert!(engine.chains.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_events() {
        let (_pipeline, handle, _engine) = pipeline();
        let err = handle.submit(RawEvent::new("port_scan", "not-an-ip")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(handle.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let (pipeline, handle, engine) = pipeline();
        let worker = tokio::spawn(pipeline.run());

        for i in 0..3 {
            handle
                .submit(
                    RawEvent::new("port_scan", "10.0.0.5")
                        .with_timestamp(at(i))
                        .with_dst_ip("10.0.0.9")
                        .with_protocol("TCP"),
                )
                .unwrap();
        }
        drop(handle);
        worker.await.unwrap();

        let stats = engine.alerts.read().await.statistics();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.suppressed, 2);
        assert_eq!(engine.alerts.read().await.aggregated(100).len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_does_not_stop_worker() {
        let (pipeline, handle, engine) = pipeline();
        let worker = tokio::spawn(pipeline.run());

        let mut far = RawEvent::new("port_scan", "10.0.0.5").with_dst_ip("10.0.0.9");
        far.timestamp = Some(serde_json::json!(8210266876799i64));
        assert!(matches!(handle.submit(far), Err(EngineError::Validation(_))));

        let latest = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        handle
            .submit(RawEvent::new("port_scan", "10.0.0.5").with_timestamp(latest).with_dst_ip("10.0.0.9"))
            .unwrap();
        handle
            .submit(RawEvent::new("brute_force", "10.0.0.6").with_timestamp(at(0)).with_dst_ip("10.0.0.9"))
            .unwrap();
        drop(handle);
        worker.await.unwrap();

        assert_eq!(engine.events.read().await.len(), 2);
        assert_eq!(engine.alerts.read().await.statistics().total_processed, 2);
    }

    #[tokio::test]
    async fn test_contended_store_times_out_after_retries() {
        let policy = RetryPolicy {
            lock_timeout: Duration::from_millis(5),
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
        };
        let lock = RwLock::new(0u32);
        let _reader = lock.read().await;

        let err = policy.write("events", &lock).await.unwrap_err();
        assert!(matches!(err, EngineError::TransientStore { store: "events", attempts: 3 }));
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            lock_timeout: Duration::from_millis(5),
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
        };
        let first = policy.backoff(0);
        let third = policy.backoff(2);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));
    }
}
