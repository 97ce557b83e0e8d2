use super::{ConfigChange, ConfigChangeType, ConfigMap, ConfigSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::env;
use std::path::Path;
use tokio::fs;
use tokio::sync::mpsc;

/// Environment variables prefixed `NIDRS_`. A double underscore separates
/// nesting levels: `NIDRS_AGGREGATION__WINDOW_SECONDS=120`.
pub struct EnvConfigSource {
    prefix: String,
}

impl EnvConfigSource {
    pub fn new() -> Self {
        Self {
            prefix: "NIDRS_".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn config_key(&self, var: &str) -> Option<String> {
        let stripped = var.strip_prefix(&self.prefix)?;
        if stripped.is_empty() {
            return None;
        }
        Some(stripped.to_lowercase().split("__").collect::<Vec<_>>().join("."))
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON when the value parses as JSON (numbers, booleans, arrays), else a
/// plain string.
fn parse_env_value(value: String) -> serde_json::Value {
    serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value))
}

#[async_trait]
impl ConfigSource for EnvConfigSource {
    async fn load_config(&self) -> Result<ConfigMap> {
        let mut config = ConfigMap::new();

        if let Ok(port) = env::var("PORT") {
            config.insert("server.port".to_string(), parse_env_value(port));
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            config.insert(
                "observability.logging.level".to_string(),
                serde_json::Value::String(log_level),
            );
        }

        // Prefixed variables win over the shortcuts above.
        for (key, value) in env::vars() {
            if let Some(config_key) = self.config_key(&key) {
                config.insert(config_key, parse_env_value(value));
            }
        }

        tracing::debug!("Loaded {} configuration values from environment", config.len());
        Ok(config)
    }

    async fn watch_changes(&self) -> Result<mpsc::Receiver<ConfigChange>> {
        let (_tx, rx) = mpsc::channel(1);
        tracing::debug!("Environment config source doesn't support change watching");
        Ok(rx)
    }

    fn name(&self) -> &str {
        "environment"
    }
}

/// TOML, YAML or JSON configuration file, chosen by extension.
pub struct FileConfigSource {
    file_path: String,
}

impl FileConfigSource {
    pub fn new(file_path: impl Into<String>) -> Result<Self> {
        let file_path = file_path.into();
        if file_path.trim().is_empty() {
            return Err(anyhow::anyhow!("Configuration file path is empty"));
        }
        Ok(Self { file_path })
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load_config(&self) -> Result<ConfigMap> {
        if !Path::new(&self.file_path).exists() {
            tracing::debug!("Configuration file {} does not exist", self.file_path);
            return Ok(ConfigMap::new());
        }

        let content = fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("Failed to read config file: {}", self.file_path))?;

        let config: ConfigMap = if self.file_path.ends_with(".toml") {
            let toml_value: toml::Value = toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", self.file_path))?;
            let json_value = serde_json::to_value(toml_value)
                .with_context(|| format!("Failed to convert TOML config: {}", self.file_path))?;
            flatten_json_value("", &json_value)
        } else if self.file_path.ends_with(".yaml") || self.file_path.ends_with(".yml") {
            let yaml_value: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", self.file_path))?;
            let json_value = serde_json::to_value(yaml_value)
                .with_context(|| format!("Failed to convert YAML config: {}", self.file_path))?;
            flatten_json_value("", &json_value)
        } else if self.file_path.ends_with(".json") {
            let json_value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", self.file_path))?;
            flatten_json_value("", &json_value)
        } else {
            return Err(anyhow::anyhow!("Unsupported config file format: {}", self.file_path));
        };

        tracing::debug!("Loaded {} configuration values from file: {}", config.len(), self.file_path);
        Ok(config)
    }

    async fn watch_changes(&self) -> Result<mpsc::Receiver<ConfigChange>> {
        let (tx, rx) = mpsc::channel(100);
        let file_path = self.file_path.clone();

        if !Path::new(&file_path).exists() {
            tracing::debug!("Configuration file {} does not exist, not watching", file_path);
            return Ok(rx);
        }

        tokio::spawn(async move {
            let (watch_tx, mut watch_rx) = mpsc::channel(100);

            let mut watcher = match RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    if let Ok(event) = res {
                        let _ = watch_tx.try_send(event);
                    }
                },
                notify::Config::default(),
            ) {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::error!("Failed to create file watcher: {}", e);
                    return;
                }
            };

            if let Err(e) = watcher.watch(Path::new(&file_path), RecursiveMode::NonRecursive) {
                tracing::error!("Failed to watch config file {}: {}", file_path, e);
                return;
            }

            while let Some(event) = watch_rx.recv().await {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let change = ConfigChange {
                        source: "file".to_string(),
                        change_type: ConfigChangeType::Modified,
                        affected_keys: vec![],
                    };

                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Flatten nested tables into dotted keys. Arrays are leaves.
fn flatten_json_value(prefix: &str, value: &serde_json::Value) -> ConfigMap {
    let mut config = ConfigMap::new();

    match value {
        serde_json::Value::Object(object) => {
            for (key, val) in object {
                let new_prefix = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                config.extend(flatten_json_value(&new_prefix, val));
            }
        }
        _ => {
            config.insert(prefix.to_string(), value.clone());
        }
    }

    config
}
