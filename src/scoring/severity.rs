use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity bucket derived from a 0-100 priority score.
///
/// The thresholds are inclusive lower bounds and are relied on by the
/// dashboard's colouring and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

pub const CRITICAL_THRESHOLD: f64 = 80.0;
pub const HIGH_THRESHOLD: f64 = 60.0;
pub const MEDIUM_THRESHOLD: f64 = 40.0;

impl Severity {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= CRITICAL_THRESHOLD => Severity::Critical,
            s if s >= HIGH_THRESHOLD => Severity::High,
            s if s >= MEDIUM_THRESHOLD => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn to_score_range(&self) -> (f64, f64) {
        match self {
            Severity::Low => (0.0, MEDIUM_THRESHOLD),
            Severity::Medium => (MEDIUM_THRESHOLD, HIGH_THRESHOLD),
            Severity::High => (HIGH_THRESHOLD, CRITICAL_THRESHOLD),
            Severity::Critical => (CRITICAL_THRESHOLD, 100.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse a producer-supplied severity label.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" | "info" | "informational" => Some(Severity::Low),
            "medium" | "moderate" | "warning" => Some(Severity::Medium),
            "high" | "error" => Some(Severity::High),
            "critical" | "severe" | "emergency" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_thresholds_are_inclusive_lower_bounds() {
        assert_eq!(Severity::from_score(100.0), Severity::Critical);
        assert_eq!(Severity::from_score(80.0), Severity::Critical);
        assert_eq!(Severity::from_score(79.99), Severity::High);
        assert_eq!(Severity::from_score(60.0), Severity::High);
        assert_eq!(Severity::from_score(59.99), Severity::Medium);
        assert_eq!(Severity::from_score(40.0), Severity::Medium);
        assert_eq!(Severity::from_score(39.99), Severity::Low);
        assert_eq!(Severity::from_score(0.0), Severity::Low);
    }

    #[test]
    fn test_severity_is_monotone_in_score() {
        let mut previous = Severity::Low;
        for step in 0..=1000 {
            let current = Severity::from_score(step as f64 / 10.0);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_severity_labels() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
        assert_eq!(Severity::parse_label("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse_label("bogus"), None);
    }
}
