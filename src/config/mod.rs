use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use validator::Validate;

pub mod sources;
pub mod validation;

use crate::taxonomy::TaxonomyRule;
use sources::*;
use validation::ConfigValidator;

/// Configured seconds as a chrono span, saturating at the largest span.
pub fn span_seconds(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "NIDRS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "nidrs.toml";

/// Layered configuration manager with hot reloading.
///
/// Sources are merged in order, later sources overriding earlier ones:
/// built-in defaults, the configuration file, then the environment.
pub struct ConfigManager {
    sources: Arc<Vec<Box<dyn ConfigSource>>>,
    current_config: Arc<RwLock<EngineConfig>>,
}

impl ConfigManager {
    pub async fn new() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let sources: Vec<Box<dyn ConfigSource>> = vec![
            Box::new(FileConfigSource::new(path)?),
            Box::new(EnvConfigSource::new()),
        ];
        Self::with_sources(sources).await
    }

    pub async fn with_sources(sources: Vec<Box<dyn ConfigSource>>) -> Result<Self> {
        let validator = ConfigValidator::new();

        let initial_config = Self::load_merged_config(&sources).await?;
        validator.validate(&initial_config)?;

        Ok(Self {
            sources: Arc::new(sources),
            current_config: Arc::new(RwLock::new(initial_config)),
        })
    }

    pub async fn get_config(&self) -> EngineConfig {
        self.current_config.read().await.clone()
    }

    async fn load_merged_config(sources: &[Box<dyn ConfigSource>]) -> Result<EngineConfig> {
        let mut merged_config = ConfigMap::new();

        for source in sources {
            match source.load_config().await {
                Ok(config) => {
                    tracing::debug!(source = source.name(), values = config.len(), "Loaded configuration source");
                    merged_config.merge(config);
                }
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "Failed to load configuration source");
                }
            }
        }

        let config: EngineConfig = if merged_config.is_empty() {
            EngineConfig::default()
        } else {
            merged_config.try_into().context("Failed to parse configuration")?
        };

        Ok(config)
    }

    /// Watch every source and re-merge on change. Each accepted
    /// configuration is published on the returned channel; an invalid one is
    /// reported and the previous configuration stays in force.
    pub async fn watch_changes(&self) -> Result<mpsc::Receiver<ConfigChangeEvent>> {
        let (tx, rx) = mpsc::channel(100);

        for source in self.sources.iter() {
            let mut change_stream = source.watch_changes().await?;
            let tx_clone = tx.clone();
            let current = self.current_config.clone();
            let sources = self.sources.clone();

            tokio::spawn(async move {
                let validator = ConfigValidator::new();
                while let Some(change) = change_stream.recv().await {
                    tracing::info!(source = %change.source, change = ?change.change_type, "Configuration change detected");

                    match Self::load_merged_config(&sources).await {
                        Ok(new_config) => {
                            if let Err(e) = validator.validate(&new_config) {
                                tracing::error!(error = %e, "Configuration validation failed, keeping previous configuration");
                                let _ = tx_clone.send(ConfigChangeEvent::ValidationFailed(e)).await;
                                continue;
                            }

                            *current.write().await = new_config.clone();
                            let _ = tx_clone.send(ConfigChangeEvent::Updated(Box::new(new_config))).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload configuration");
                            let _ = tx_clone.send(ConfigChangeEvent::LoadFailed(e)).await;
                        }
                    }
                }
            });
        }

        Ok(rx)
    }
}

#[derive(Debug)]
pub enum ConfigChangeEvent {
    Updated(Box<EngineConfig>),
    ValidationFailed(anyhow::Error),
    LoadFailed(anyhow::Error),
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_config(&self) -> Result<ConfigMap>;
    async fn watch_changes(&self) -> Result<mpsc::Receiver<ConfigChange>>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub source: String,
    pub change_type: ConfigChangeType,
    pub affected_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ConfigChangeType {
    Added,
    Modified,
    Removed,
}

/// Flattened `section.key` → value map produced by every source.
pub type ConfigMap = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub ingestion: IngestionConfig,
    #[validate(nested)]
    pub scoring: ScoringConfig,
    #[validate(nested)]
    pub aggregation: AggregationConfig,
    #[validate(nested)]
    pub chains: ChainConfig,
    #[validate(nested)]
    pub correlation: CorrelationConfig,
    #[validate(nested)]
    pub events: EventsConfig,
    #[validate(nested)]
    pub query: QueryConfig,
    #[validate(nested)]
    pub sweeper: SweeperConfig,
    #[validate(nested)]
    pub observability: ObservabilityConfig,
    pub taxonomy: TaxonomyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(range(min = 1024, max = 65535))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IngestionConfig {
    /// Per-attempt wait for a store's write lock.
    #[validate(range(min = 1, max = 60000))]
    pub lock_timeout_ms: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    #[validate(range(min = 1, max = 10000))]
    pub retry_backoff_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 250,
            max_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ScoringConfig {
    /// Events scoring at least this much become alerts.
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_alert_score: f64,
    pub known_bad_ports: Vec<u16>,
    pub privileged_users: Vec<String>,
    #[validate(range(max = 23))]
    pub business_hours_start: u32,
    #[validate(range(min = 1, max = 24))]
    pub business_hours_end: u32,
    #[validate(range(min = 1))]
    pub failure_window_seconds: u64,
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[validate(range(min = 1))]
    pub rarity_window_seconds: u64,
    /// CIDRs or addresses of known-hostile sources.
    pub threat_intel: Vec<String>,
    #[validate(range(min = 1))]
    pub max_tracked_sources: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_alert_score: 40.0,
            known_bad_ports: vec![23, 445, 1433, 3306, 3389, 4444, 5900, 6667, 31337],
            privileged_users: ["root", "admin", "administrator", "system", "sa"]
                .iter()
                .map(|u| u.to_string())
                .collect(),
            business_hours_start: 8,
            business_hours_end: 18,
            failure_window_seconds: 300,
            failure_threshold: 5,
            rarity_window_seconds: 86_400,
            threat_intel: Vec::new(),
            max_tracked_sources: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AggregationConfig {
    #[validate(range(min = 1))]
    pub window_seconds: u64,
    /// How long a closed group stays visible before eviction.
    #[validate(range(min = 1))]
    pub retention_seconds: u64,
    #[validate(range(min = 1, max = 1000))]
    pub max_related_alerts: usize,
    #[validate(range(min = 1))]
    pub recent_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_seconds: 300,
            retention_seconds: 3600,
            max_related_alerts: 50,
            recent_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ChainConfig {
    #[validate(range(min = 1))]
    pub inactivity_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub retention_seconds: u64,
    #[validate(range(min = 1))]
    pub max_events_per_chain: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_seconds: 1800,
            retention_seconds: 86_400,
            max_events_per_chain: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CorrelationConfig {
    #[validate(range(min = 1))]
    pub window_seconds: u64,
    #[validate(range(min = 1))]
    pub max_events_per_threat: usize,
    #[validate(range(min = 1))]
    pub timeline_limit: usize,
    #[validate(range(min = 1))]
    pub retention_seconds: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3600,
            max_events_per_threat: 50,
            timeline_limit: 500,
            retention_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EventsConfig {
    #[validate(range(min = 1))]
    pub capacity: usize,
    #[validate(range(min = 1))]
    pub retention_seconds: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retention_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueryConfig {
    #[validate(range(min = 1))]
    pub default_limit: usize,
    #[validate(range(min = 1, max = 10000))]
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SweeperConfig {
    #[validate(range(min = 1, max = 3600))]
    pub interval_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_seconds: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[validate(nested)]
    pub metrics: MetricsConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    #[validate(length(min = 1))]
    pub level: String,
    /// `json`, `pretty` or `compact`.
    #[validate(length(min = 1))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Taxonomy entries extending or overriding the built-in table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    pub rules: Vec<TaxonomyRule>,
}

impl TryFrom<ConfigMap> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(config_map: ConfigMap) -> Result<Self> {
        let nested_config = Self::unflatten_config(config_map)?;

        serde_json::from_value(nested_config).context("Failed to deserialize configuration")
    }
}

impl EngineConfig {
    fn unflatten_config(config_map: ConfigMap) -> Result<serde_json::Value> {
        let mut nested = serde_json::Map::new();

        // Shorter keys first so a section table never clobbers a more
        // specific override of one of its keys.
        let mut entries: Vec<(String, serde_json::Value)> = config_map.into_iter().collect();
        entries.sort_by(|a, b| a.0.matches('.').count().cmp(&b.0.matches('.').count()).then(a.0.cmp(&b.0)));

        for (key, value) in entries {
            let parts: Vec<&str> = key.split('.').collect();
            Self::insert_nested(&mut nested, &parts, value);
        }

        Ok(serde_json::Value::Object(nested))
    }

    fn insert_nested(map: &mut serde_json::Map<String, serde_json::Value>, parts: &[&str], value: serde_json::Value) {
        if parts.is_empty() {
            return;
        }

        if parts.len() == 1 {
            map.insert(parts[0].to_string(), value);
            return;
        }

        let key = parts[0];
        let remaining = &parts[1..];

        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));

        if !entry.is_object() {
            *entry = serde_json::Value::Object(serde_json::Map::new());
        }
        if let serde_json::Value::Object(ref mut obj) = entry {
            Self::insert_nested(obj, remaining, value);
        }
    }
}

trait ConfigMapExt {
    fn merge(&mut self, other: ConfigMap);
}

impl ConfigMapExt for ConfigMap {
    fn merge(&mut self, other: ConfigMap) {
        for (key, value) in other {
            self.insert(key, value);
        }
    }
}
