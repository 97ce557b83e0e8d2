use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::factors::{default_evaluators, FactorEvaluator, ScoringInput};
use super::severity::Severity;
use crate::config::ScoringConfig;
use crate::events::Event;
use crate::taxonomy::{Classification, Taxonomy};

/// Output of scoring one event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreResult {
    pub priority_score: f64,
    pub severity: Severity,
    pub score_breakdown: BTreeMap<String, f64>,
    pub factors: Vec<String>,
}

/// Classification and score of one event, plus whether it becomes an alert.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub classification: Classification,
    pub score: ScoreResult,
    pub alert: bool,
}

pub struct Scorer {
    evaluators: Vec<Box<dyn FactorEvaluator>>,
    taxonomy: Taxonomy,
    min_alert_score: f64,
}

impl Scorer {
    pub fn new(config: &ScoringConfig, taxonomy: Taxonomy) -> Self {
        Self::with_evaluators(default_evaluators(config), taxonomy, config.min_alert_score)
    }

    pub fn with_evaluators(
        evaluators: Vec<Box<dyn FactorEvaluator>>,
        taxonomy: Taxonomy,
        min_alert_score: f64,
    ) -> Self {
        Self {
            evaluators,
            taxonomy,
            min_alert_score,
        }
    }

    /// Swap in new rules. Stateful evaluators start over.
    pub fn reconfigure(&mut self, config: &ScoringConfig, taxonomy: Taxonomy) {
        self.evaluators = default_evaluators(config);
        self.taxonomy = taxonomy;
        self.min_alert_score = config.min_alert_score;
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn factor_names(&self) -> Vec<&'static str> {
        self.evaluators.iter().map(|e| e.name()).collect()
    }

    pub fn assess(&mut self, event: &Event) -> Assessment {
        let classification = self.taxonomy.classify(&event.event_type);
        let score = self.score(event, &classification);
        let alert = classification.alerting || score.priority_score >= self.min_alert_score;

        Assessment {
            classification,
            score,
            alert,
        }
    }

    pub fn score(&mut self, event: &Event, classification: &Classification) -> ScoreResult {
        let input = ScoringInput {
            event,
            classification,
        };

        let mut breakdown = BTreeMap::new();
        let mut factors = Vec::new();
        let mut total = 0.0;

        for evaluator in self.evaluators.iter_mut() {
            let Some(outcome) = evaluator.evaluate(&input) else {
                continue;
            };
            let contribution = round2(outcome.contribution.clamp(0.0, evaluator.max_weight()));
            if contribution > 0.0 {
                factors.push(outcome.reason);
            }
            total += contribution;
            breakdown.insert(evaluator.name().to_string(), contribution);
        }

        let priority_score = round2(total.min(100.0));
        let severity = Severity::from_score(priority_score);

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            priority_score = priority_score,
            severity = %severity,
            "Event scored"
        );

        ScoreResult {
            priority_score,
            severity,
            score_breakdown: breakdown,
            factors,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawEvent;
    use crate::scoring::factors::{names, FactorOutcome};
    use chrono::{TimeZone, Utc};

    struct Fixed {
        name: &'static str,
        weight: f64,
        value: Option<f64>,
    }

    impl FactorEvaluator for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn max_weight(&self) -> f64 {
            self.weight
        }

        fn evaluate(&mut self, _input: &ScoringInput<'_>) -> Option<FactorOutcome> {
            self.value.map(|v| FactorOutcome::new(v, format!("{} fired", self.name)))
        }
    }

    fn fixed(name: &'static str, weight: f64, value: Option<f64>) -> Box<dyn FactorEvaluator> {
        Box::new(Fixed { name, weight, value })
    }

    fn event(raw: RawEvent) -> Event {
        Event::new(raw).unwrap()
    }

    #[test]
    fn test_score_is_capped_and_contributions_clamped() {
        let mut scorer = Scorer::with_evaluators(
            vec![
                fixed("a", 60.0, Some(60.0)),
                fixed("b", 50.0, Some(80.0)),
                fixed("c", 10.0, Some(-5.0)),
            ],
            Taxonomy::default(),
            40.0,
        );

        let e = event(RawEvent::new("conn", "10.0.0.1"));
        let classification = scorer.taxonomy().classify("conn");
        let result = scorer.score(&e, &classification);

        assert_eq!(result.priority_score, 100.0);
        assert_eq!(result.severity, Severity::Critical);
        assert_eq!(result.score_breakdown["b"], 50.0);
        assert_eq!(result.score_breakdown["c"], 0.0);
        assert_eq!(result.factors, vec!["a fired".to_string(), "b fired".to_string()]);
    }

    #[test]
    fn test_non_computable_factor_is_omitted() {
        let mut scorer = Scorer::with_evaluators(
            vec![fixed("present", 20.0, Some(20.0)), fixed("missing", 20.0, None)],
            Taxonomy::default(),
            40.0,
        );

        let e = event(RawEvent::new("conn", "10.0.0.1"));
        let assessment = scorer.assess(&e);

        assert!(assessment.score.score_breakdown.contains_key("present"));
        assert!(!assessment.score.score_breakdown.contains_key("missing"));
        assert_eq!(assessment.score.factors.len(), 1);
        assert_eq!(assessment.score.severity, Severity::Low);
        assert!(!assessment.alert);
    }

    #[test]
    fn test_builtin_scoring_of_credential_attack() {
        let mut scorer = Scorer::new(&ScoringConfig::default(), Taxonomy::default());
        let night = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();

        let raw = RawEvent::new("brute_force", "10.0.0.5")
            .with_timestamp(night)
            .with_dst_ip("10.0.0.9")
            .with_port(3389)
            .with_user("administrator");
        let assessment = scorer.assess(&event(raw));

        // stage 35*0.75 + bad port 20 + privileged 15 + off hours 10 + rare dst 10
        assert!((assessment.score.priority_score - 81.25).abs() < 1e-9);
        assert_eq!(assessment.score.severity, Severity::Critical);
        assert!(assessment.alert);
        assert!(assessment.score.score_breakdown.contains_key(names::REPEATED_FAILURE_BURST));
        assert!(!assessment.score.score_breakdown.contains_key(names::THREAT_INTEL));
        assert_eq!(scorer.factor_names().len(), 8);
    }

    #[test]
    fn test_alerting_taxonomy_entry_promotes_low_score() {
        let mut scorer = Scorer::new(&ScoringConfig::default(), Taxonomy::default());
        let noon = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let assessment = scorer.assess(&event(RawEvent::new("port_scan", "10.0.0.5").with_timestamp(noon)));
        assert!(assessment.score.priority_score < 40.0);
        assert!(assessment.alert);

        let unmapped = scorer.assess(&event(RawEvent::new("heartbeat", "10.0.0.5").with_timestamp(noon)));
        assert!(!unmapped.alert);
    }
}
