use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::pipeline::{Engine, IngestHandle};

/// How long a store's read lock may take before the store counts as degraded.
const STORE_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Queue depth above which ingestion is reported degraded.
const QUEUE_DEPTH_WARNING: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Starting,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub latency_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub events_retained: Option<usize>,
    pub correlation_generation: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub dependencies: BTreeMap<String, DependencyHealth>,
    pub metrics: HealthMetrics,
    pub startup_time: DateTime<Utc>,
}

pub struct HealthCheckManager {
    engine: Arc<Engine>,
    ingest: IngestHandle,
}

impl HealthCheckManager {
    pub fn new(engine: Arc<Engine>, ingest: IngestHandle) -> Self {
        Self { engine, ingest }
    }

    /// Probe every store and the ingestion worker.
    pub async fn check_health(&self) -> Result<HealthStatus> {
        let mut dependencies = BTreeMap::new();

        let checks = [
            check_store("events", &*self.engine.events).await,
            check_store("traffic", &*self.engine.traffic).await,
            check_store("aggregator", &*self.engine.alerts).await,
            check_store("chains", &*self.engine.chains).await,
            check_store("correlation", self.engine.correlation.state()).await,
            self.check_ingestion(),
        ];

        let mut overall_status = ServiceStatus::Healthy;
        for check in checks {
            match check.status {
                ServiceStatus::Unhealthy => overall_status = ServiceStatus::Unhealthy,
                ServiceStatus::Degraded if overall_status == ServiceStatus::Healthy => {
                    overall_status = ServiceStatus::Degraded
                }
                _ => {}
            }
            dependencies.insert(check.name.clone(), check);
        }

        let health_status = HealthStatus {
            status: overall_status,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dependencies,
            metrics: self.get_health_metrics().await,
            startup_time: self.engine.started_at(),
        };

        tracing::debug!(status = ?health_status.status, "Health check completed");
        Ok(health_status)
    }

    fn check_ingestion(&self) -> DependencyHealth {
        let depth = self.ingest.queue_depth();
        let (status, error_message) = if !self.ingest.is_running() {
            (ServiceStatus::Unhealthy, Some("ingestion worker stopped".to_string()))
        } else if depth > QUEUE_DEPTH_WARNING {
            (ServiceStatus::Degraded, Some(format!("{} events queued", depth)))
        } else {
            (ServiceStatus::Healthy, None)
        };

        DependencyHealth {
            name: "ingestion".to_string(),
            status,
            latency_ms: None,
            last_check: Utc::now(),
            error_message,
        }
    }

    async fn get_health_metrics(&self) -> HealthMetrics {
        let events_retained = timeout(STORE_CHECK_TIMEOUT, self.engine.events.read())
            .await
            .ok()
            .map(|events| events.len());

        HealthMetrics {
            uptime_seconds: self.engine.uptime_seconds(),
            queue_depth: self.ingest.queue_depth(),
            events_retained,
            correlation_generation: self.engine.correlation.generation(),
        }
    }

    /// Cheap liveness probe: the worker is running.
    pub fn quick_health_check(&self) -> ServiceStatus {
        if self.ingest.is_running() {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unhealthy
        }
    }

    /// Refuse to serve if the engine cannot take events.
    pub async fn validate_startup_dependencies(&self) -> Result<()> {
        tracing::info!("Validating startup dependencies");

        let health_status = self.check_health().await?;

        match health_status.status {
            ServiceStatus::Healthy => {
                tracing::info!("All engine components are healthy");
                Ok(())
            }
            ServiceStatus::Degraded => {
                tracing::warn!("Some engine components are degraded, starting anyway");
                Ok(())
            }
            ServiceStatus::Unhealthy => {
                let unhealthy: Vec<String> = health_status
                    .dependencies
                    .iter()
                    .filter(|(_, dep)| dep.status == ServiceStatus::Unhealthy)
                    .map(|(name, dep)| format!("{}: {}", name, dep.error_message.as_deref().unwrap_or("unknown error")))
                    .collect();

                let error_msg = format!("Startup validation failed. Unhealthy components: {}", unhealthy.join(", "));
                tracing::error!("{}", error_msg);
                Err(anyhow::anyhow!(error_msg))
            }
            ServiceStatus::Starting => Err(anyhow::anyhow!("Service is still starting up")),
        }
    }
}

async fn check_store<T>(name: &str, lock: &RwLock<T>) -> DependencyHealth {
    let start_time = Instant::now();

    match timeout(STORE_CHECK_TIMEOUT, lock.read()).await {
        Ok(_guard) => DependencyHealth {
            name: name.to_string(),
            status: ServiceStatus::Healthy,
            latency_ms: Some(start_time.elapsed().as_millis() as u64),
            last_check: Utc::now(),
            error_message: None,
        },
        Err(_) => {
            tracing::warn!(store = name, "Store read lock not acquired within health budget");
            DependencyHealth {
                name: name.to_string(),
                status: ServiceStatus::Degraded,
                latency_ms: None,
                last_check: Utc::now(),
                error_message: Some("lock contended".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::IngestionPipeline;

    fn manager() -> (HealthCheckManager, IngestionPipeline) {
        let config = EngineConfig::default();
        let engine = Arc::new(Engine::new(&config));
        let (pipeline, handle) = IngestionPipeline::new(engine.clone(), &config);
        (HealthCheckManager::new(engine, handle), pipeline)
    }

    #[tokio::test]
    async fn test_idle_engine_is_healthy() {
        let (manager, _pipeline) = manager();
        let status = manager.check_health().await.unwrap();

        assert_eq!(status.status, ServiceStatus::Healthy);
        assert_eq!(status.dependencies.len(), 6);
        assert_eq!(status.metrics.events_retained, Some(0));
        assert!(manager.validate_startup_dependencies().await.is_ok());
    }

    #[tokio::test]
    async fn test_stopped_worker_is_unhealthy() {
        let (manager, pipeline) = manager();
        drop(pipeline);

        assert_eq!(manager.quick_health_check(), ServiceStatus::Unhealthy);
        let status = manager.check_health().await.unwrap();
        assert_eq!(status.status, ServiceStatus::Unhealthy);
        assert!(manager.validate_startup_dependencies().await.is_err());
    }

    #[tokio::test]
    async fn test_contended_store_degrades() {
        let (manager, _pipeline) = manager();
        let _writer = manager.engine.chains.write().await;

        let status = manager.check_health().await.unwrap();
        assert_eq!(status.status, ServiceStatus::Degraded);
        assert_eq!(status.dependencies["chains"].status, ServiceStatus::Degraded);
    }

    #[test]
    fn test_service_status_serialization() {
        let status = ServiceStatus::Healthy;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"healthy\"");
        let deserialized: ServiceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
