use super::EngineConfig;
use crate::scoring::factors::parse_network;
use anyhow::{Context, Result};
use validator::Validate;

/// Derive validation plus cross-field rules.
pub struct ConfigValidator {
    validators: Vec<Box<dyn CustomValidator>>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self {
            validators: vec![
                Box::new(WindowValidator),
                Box::new(ScoringValidator),
                Box::new(TaxonomyValidator),
                Box::new(QueryValidator),
            ],
        }
    }

    pub fn validate(&self, config: &EngineConfig) -> Result<()> {
        config.validate().context("Configuration validation failed")?;

        for validator in &self.validators {
            validator
                .validate(config)
                .with_context(|| format!("{} configuration rejected", validator.name()))?;
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

pub trait CustomValidator: Send + Sync {
    fn validate(&self, config: &EngineConfig) -> Result<()>;
    fn name(&self) -> &str;
}

/// Retention periods must outlive the windows they retain.
pub struct WindowValidator;

impl CustomValidator for WindowValidator {
    fn validate(&self, config: &EngineConfig) -> Result<()> {
        if config.chains.retention_seconds < config.chains.inactivity_timeout_seconds {
            return Err(anyhow::anyhow!(
                "chains.retention_seconds ({}) must be at least chains.inactivity_timeout_seconds ({})",
                config.chains.retention_seconds,
                config.chains.inactivity_timeout_seconds
            ));
        }

        if config.correlation.retention_seconds < config.correlation.window_seconds {
            return Err(anyhow::anyhow!(
                "correlation.retention_seconds ({}) must be at least correlation.window_seconds ({})",
                config.correlation.retention_seconds,
                config.correlation.window_seconds
            ));
        }

        if config.events.retention_seconds < config.correlation.window_seconds {
            tracing::warn!(
                events_retention = config.events.retention_seconds,
                correlation_window = config.correlation.window_seconds,
                "Event retention is shorter than the correlation window; recomputes will see a truncated corpus"
            );
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "window"
    }
}

pub struct ScoringValidator;

impl CustomValidator for ScoringValidator {
    fn validate(&self, config: &EngineConfig) -> Result<()> {
        let scoring = &config.scoring;
        if scoring.business_hours_start >= scoring.business_hours_end {
            return Err(anyhow::anyhow!(
                "scoring.business_hours_start ({}) must be before scoring.business_hours_end ({})",
                scoring.business_hours_start,
                scoring.business_hours_end
            ));
        }

        if let Some(bad) = scoring.threat_intel.iter().find(|cidr| parse_network(cidr).is_none()) {
            return Err(anyhow::anyhow!("scoring.threat_intel entry is not a CIDR or address: {}", bad));
        }

        if scoring.known_bad_ports.contains(&0) {
            return Err(anyhow::anyhow!("scoring.known_bad_ports must not contain port 0"));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "scoring"
    }
}

pub struct TaxonomyValidator;

impl CustomValidator for TaxonomyValidator {
    fn validate(&self, config: &EngineConfig) -> Result<()> {
        for rule in &config.taxonomy.rules {
            if rule.event_type.trim().is_empty() {
                return Err(anyhow::anyhow!("taxonomy rule with empty event_type"));
            }
            if rule.attack_type.trim().is_empty() {
                return Err(anyhow::anyhow!("taxonomy rule {} has an empty attack_type", rule.event_type));
            }
            if let Some(stage) = rule.stage {
                if !stage.is_known() {
                    return Err(anyhow::anyhow!(
                        "taxonomy rule {} names stage {}, which is not a kill-chain stage",
                        rule.event_type,
                        stage
                    ));
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "taxonomy"
    }
}

pub struct QueryValidator;

impl CustomValidator for QueryValidator {
    fn validate(&self, config: &EngineConfig) -> Result<()> {
        if config.query.default_limit > config.query.max_limit {
            return Err(anyhow::anyhow!(
                "query.default_limit ({}) exceeds query.max_limit ({})",
                config.query.default_limit,
                config.query.max_limit
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "query"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::{KillChainStage, TaxonomyRule};

    #[test]
    fn test_retention_shorter_than_timeout_is_rejected() {
        let mut config = EngineConfig::default();
        config.chains.retention_seconds = 60;
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("chains.retention_seconds"));
    }

    #[test]
    fn test_bad_threat_intel_and_hours_are_rejected() {
        let mut config = EngineConfig::default();
        config.scoring.threat_intel = vec!["10.0.0.0/8".to_string(), "not-a-network".to_string()];
        assert!(ConfigValidator::new().validate(&config).is_err());

        let mut config = EngineConfig::default();
        config.scoring.business_hours_start = 18;
        config.scoring.business_hours_end = 8;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_taxonomy_rule_with_unknown_stage_is_rejected() {
        let mut config = EngineConfig::default();
        config.taxonomy.rules.push(TaxonomyRule {
            event_type: "weird".to_string(),
            stage: Some(KillChainStage::Unknown),
            attack_type: "Weird".to_string(),
            alerting: true,
        });
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_default_limit_above_max_is_rejected() {
        let mut config = EngineConfig::default();
        config.query.default_limit = 1000;
        config.query.max_limit = 500;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }
}
