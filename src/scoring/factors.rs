use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use tracing::warn;

use super::severity::Severity;
use crate::config::{span_seconds, ScoringConfig};
use crate::events::{extra_keys, saturating_sub, Event};
use crate::taxonomy::{Classification, KillChainStage};

/// Stable `score_breakdown` keys. New factors may be added; existing keys are
/// never renamed.
pub mod names {
    pub const ATTACK_STAGE: &str = "attack_stage";
    pub const THREAT_INTEL: &str = "threat_intel";
    pub const KNOWN_BAD_PORT: &str = "known_bad_port";
    pub const REPEATED_FAILURE_BURST: &str = "repeated_failure_burst";
    pub const REPORTED_SEVERITY: &str = "reported_severity";
    pub const PRIVILEGED_USER: &str = "privileged_user";
    pub const OFF_HOURS: &str = "off_hours";
    pub const RARE_DESTINATION: &str = "rare_destination";
}

pub struct ScoringInput<'a> {
    pub event: &'a Event,
    pub classification: &'a Classification,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorOutcome {
    pub contribution: f64,
    /// Human-readable reason, listed in `factors` when the contribution is
    /// positive.
    pub reason: String,
}

impl FactorOutcome {
    pub fn new(contribution: f64, reason: impl Into<String>) -> Self {
        Self {
            contribution,
            reason: reason.into(),
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, String::new())
    }
}

/// A single weighted scoring factor.
///
/// Returning `None` means the factor could not be computed for this event
/// (for example the field it inspects is missing). Evaluators may keep state
/// across events; the scorer that owns them is driven by one task.
pub trait FactorEvaluator: Send + Sync {
    fn name(&self) -> &'static str;
    fn max_weight(&self) -> f64;
    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome>;
}

pub struct AttackStageFactor {
    weight: f64,
}

impl AttackStageFactor {
    pub const WEIGHT: f64 = 35.0;

    pub fn new() -> Self {
        Self { weight: Self::WEIGHT }
    }
}

impl FactorEvaluator for AttackStageFactor {
    fn name(&self) -> &'static str {
        names::ATTACK_STAGE
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let stage = input.classification.stage;
        if stage == KillChainStage::Unknown {
            return None;
        }
        Some(FactorOutcome::new(
            self.weight * stage.weight(),
            format!("Kill-chain stage: {}", stage),
        ))
    }
}

pub struct ThreatIntelFactor {
    weight: f64,
    networks: Vec<IpNet>,
}

impl ThreatIntelFactor {
    pub const WEIGHT: f64 = 25.0;

    pub fn new(cidrs: &[String]) -> Self {
        let networks = cidrs
            .iter()
            .filter_map(|cidr| match parse_network(cidr) {
                Some(net) => Some(net),
                None => {
                    warn!(cidr = %cidr, "Ignoring unparseable threat intel entry");
                    None
                }
            })
            .collect();

        Self {
            weight: Self::WEIGHT,
            networks,
        }
    }
}

/// Accepts either a CIDR or a bare address.
pub fn parse_network(value: &str) -> Option<IpNet> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(IpNet::from))
}

impl FactorEvaluator for ThreatIntelFactor {
    fn name(&self) -> &'static str {
        names::THREAT_INTEL
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        if self.networks.is_empty() {
            return None;
        }
        let src = input.event.src_ip;
        match self.networks.iter().find(|net| net.contains(&src)) {
            Some(net) => Some(FactorOutcome::new(
                self.weight,
                format!("Source {} listed in threat intel ({})", src, net),
            )),
            None => Some(FactorOutcome::zero()),
        }
    }
}

pub struct KnownBadPortFactor {
    weight: f64,
    ports: HashSet<u16>,
}

impl KnownBadPortFactor {
    pub const WEIGHT: f64 = 20.0;

    pub fn new(ports: &[u16]) -> Self {
        Self {
            weight: Self::WEIGHT,
            ports: ports.iter().copied().collect(),
        }
    }
}

impl FactorEvaluator for KnownBadPortFactor {
    fn name(&self) -> &'static str {
        names::KNOWN_BAD_PORT
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let port = input.event.port?;
        if self.ports.contains(&port) {
            Some(FactorOutcome::new(self.weight, format!("Known bad port {}", port)))
        } else {
            Some(FactorOutcome::zero())
        }
    }
}

/// Failed actions per source inside a sliding window of event time.
pub struct RepeatedFailureFactor {
    weight: f64,
    window: Duration,
    threshold: usize,
    max_sources: usize,
    failures: HashMap<IpAddr, VecDeque<DateTime<Utc>>>,
}

impl RepeatedFailureFactor {
    pub const WEIGHT: f64 = 20.0;

    pub fn new(window: Duration, threshold: usize, max_sources: usize) -> Self {
        Self {
            weight: Self::WEIGHT,
            window,
            threshold: threshold.max(1),
            max_sources: max_sources.max(1),
            failures: HashMap::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = saturating_sub(now, self.window);
        self.failures.retain(|_, times| {
            while times.front().map(|t| *t < horizon).unwrap_or(false) {
                times.pop_front();
            }
            !times.is_empty()
        });
    }
}

impl FactorEvaluator for RepeatedFailureFactor {
    fn name(&self) -> &'static str {
        names::REPEATED_FAILURE_BURST
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let event = input.event;
        let horizon = saturating_sub(event.timestamp, self.window);
        let is_failure = event.is_failure();

        if is_failure && !self.failures.contains_key(&event.src_ip) && self.failures.len() >= self.max_sources {
            self.prune(event.timestamp);
        }

        let count = match self.failures.get_mut(&event.src_ip) {
            Some(times) => {
                while times.front().map(|t| *t < horizon).unwrap_or(false) {
                    times.pop_front();
                }
                if is_failure {
                    times.push_back(event.timestamp);
                }
                times.len()
            }
            None if is_failure => {
                if self.failures.len() >= self.max_sources {
                    return Some(FactorOutcome::zero());
                }
                self.failures.insert(event.src_ip, VecDeque::from([event.timestamp]));
                1
            }
            None => 0,
        };

        let half = (self.threshold + 1) / 2;
        let window_secs = self.window.num_seconds();
        let outcome = if count >= self.threshold {
            let reason = if is_failure {
                format!("{} failed attempts from {} within {}s", count, event.src_ip, window_secs)
            } else {
                format!("Activity from {} after {} failed attempts", event.src_ip, count)
            };
            FactorOutcome::new(self.weight, reason)
        } else if is_failure && count >= half {
            FactorOutcome::new(
                self.weight / 2.0,
                format!("{} failed attempts from {} within {}s", count, event.src_ip, window_secs),
            )
        } else {
            FactorOutcome::zero()
        };

        Some(outcome)
    }
}

pub struct ReportedSeverityFactor {
    weight: f64,
}

impl ReportedSeverityFactor {
    pub const WEIGHT: f64 = 20.0;

    pub fn new() -> Self {
        Self { weight: Self::WEIGHT }
    }
}

impl FactorEvaluator for ReportedSeverityFactor {
    fn name(&self) -> &'static str {
        names::REPORTED_SEVERITY
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let label = input.event.extra_str(extra_keys::SEVERITY)?;
        let severity = Severity::parse_label(label)?;
        let fraction = match severity {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        };
        Some(FactorOutcome::new(
            self.weight * fraction,
            format!("Reported severity: {}", severity),
        ))
    }
}

pub struct PrivilegedUserFactor {
    weight: f64,
    accounts: HashSet<String>,
}

impl PrivilegedUserFactor {
    pub const WEIGHT: f64 = 15.0;

    pub fn new(accounts: &[String]) -> Self {
        Self {
            weight: Self::WEIGHT,
            accounts: accounts.iter().map(|a| a.trim().to_lowercase()).collect(),
        }
    }
}

impl FactorEvaluator for PrivilegedUserFactor {
    fn name(&self) -> &'static str {
        names::PRIVILEGED_USER
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let user = input.event.user.as_deref()?;
        let normalized = user.trim().to_lowercase();
        // DOMAIN\user and user@domain both reduce to the account name.
        let account = normalized
            .rsplit('\\')
            .next()
            .and_then(|u| u.split('@').next())
            .unwrap_or(normalized.as_str());

        if self.accounts.contains(account) || account.starts_with("admin") {
            Some(FactorOutcome::new(self.weight, format!("Privileged account: {}", user)))
        } else {
            Some(FactorOutcome::zero())
        }
    }
}

pub struct OffHoursFactor {
    weight: f64,
    start_hour: u32,
    end_hour: u32,
}

impl OffHoursFactor {
    pub const WEIGHT: f64 = 10.0;

    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            weight: Self::WEIGHT,
            start_hour,
            end_hour,
        }
    }
}

impl FactorEvaluator for OffHoursFactor {
    fn name(&self) -> &'static str {
        names::OFF_HOURS
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let ts = input.event.timestamp;
        let weekend = matches!(ts.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = ts.hour();
        let outside = hour < self.start_hour || hour >= self.end_hour;

        if weekend {
            Some(FactorOutcome::new(self.weight, format!("Weekend activity ({})", ts.weekday())))
        } else if outside {
            Some(FactorOutcome::new(
                self.weight,
                format!("Off-hours activity ({:02}:{:02} UTC)", hour, ts.minute()),
            ))
        } else {
            Some(FactorOutcome::zero())
        }
    }
}

/// Destinations not seen within the rarity window.
pub struct RareDestinationFactor {
    weight: f64,
    window: Duration,
    max_destinations: usize,
    last_seen: HashMap<IpAddr, DateTime<Utc>>,
}

impl RareDestinationFactor {
    pub const WEIGHT: f64 = 10.0;

    pub fn new(window: Duration, max_destinations: usize) -> Self {
        Self {
            weight: Self::WEIGHT,
            window,
            max_destinations: max_destinations.max(1),
            last_seen: HashMap::new(),
        }
    }
}

impl FactorEvaluator for RareDestinationFactor {
    fn name(&self) -> &'static str {
        names::RARE_DESTINATION
    }

    fn max_weight(&self) -> f64 {
        self.weight
    }

    fn evaluate(&mut self, input: &ScoringInput<'_>) -> Option<FactorOutcome> {
        let dst = input.event.dst_ip?;
        let ts = input.event.timestamp;
        let horizon = saturating_sub(ts, self.window);

        let rare = match self.last_seen.get(&dst) {
            Some(seen) => *seen < horizon,
            None => true,
        };

        if !self.last_seen.contains_key(&dst) && self.last_seen.len() >= self.max_destinations {
            self.last_seen.retain(|_, seen| *seen >= horizon);
        }
        if self.last_seen.contains_key(&dst) || self.last_seen.len() < self.max_destinations {
            let entry = self.last_seen.entry(dst).or_insert(ts);
            if ts > *entry {
                *entry = ts;
            }
        }

        if rare {
            Some(FactorOutcome::new(self.weight, format!("Rare destination {}", dst)))
        } else {
            Some(FactorOutcome::zero())
        }
    }
}

/// Built-in evaluators, in their fixed evaluation order.
pub fn default_evaluators(config: &ScoringConfig) -> Vec<Box<dyn FactorEvaluator>> {
    vec![
        Box::new(AttackStageFactor::new()),
        Box::new(ThreatIntelFactor::new(&config.threat_intel)),
        Box::new(KnownBadPortFactor::new(&config.known_bad_ports)),
        Box::new(RepeatedFailureFactor::new(
            span_seconds(config.failure_window_seconds),
            config.failure_threshold as usize,
            config.max_tracked_sources,
        )),
        Box::new(ReportedSeverityFactor::new()),
        Box::new(PrivilegedUserFactor::new(&config.privileged_users)),
        Box::new(OffHoursFactor::new(
            config.business_hours_start,
            config.business_hours_end,
        )),
        Box::new(RareDestinationFactor::new(
            span_seconds(config.rarity_window_seconds),
            config.max_tracked_sources,
        )),
    ]
}
