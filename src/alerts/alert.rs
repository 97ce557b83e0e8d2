use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::events::Event;
use crate::scoring::{Assessment, Severity};
use crate::taxonomy::KillChainStage;

/// A scored event, or a group of near-identical scored events once the
/// aggregator has folded duplicates into it.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: String,
    pub severity: Severity,
    pub priority_score: f64,
    pub score_breakdown: BTreeMap<String, f64>,
    pub factors: Vec<String>,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub count: u64,
    pub description: Option<String>,
    pub related_alerts: Vec<RelatedAlert>,
    pub event_id: String,
    pub stage: KillChainStage,
    pub attack_type: String,
    pub last_seen: DateTime<Utc>,
}

/// Summary of an alert folded into a group.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelatedAlert {
    pub id: Uuid,
    pub alert_type: String,
    pub priority_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub alert_type: String,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<String>,
}

impl Alert {
    pub fn from_event(event: &Event, assessment: &Assessment) -> Self {
        let description = if event.message.trim().is_empty() {
            Some(match event.dst_ip {
                Some(dst) => format!("{} from {} to {}", assessment.classification.attack_type, event.src_ip, dst),
                None => format!("{} from {}", assessment.classification.attack_type, event.src_ip),
            })
        } else {
            Some(event.message.clone())
        };

        Self {
            id: Uuid::new_v4(),
            alert_type: event.event_type.clone(),
            severity: assessment.score.severity,
            priority_score: assessment.score.priority_score,
            score_breakdown: assessment.score.score_breakdown.clone(),
            factors: assessment.score.factors.clone(),
            src_ip: event.src_ip,
            dst_ip: event.dst_ip,
            protocol: event.protocol.clone(),
            timestamp: event.timestamp,
            count: 1,
            description,
            related_alerts: Vec::new(),
            event_id: event.id.clone(),
            stage: assessment.classification.stage,
            attack_type: assessment.classification.attack_type.clone(),
            last_seen: event.timestamp,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            alert_type: self.alert_type.clone(),
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            protocol: self.protocol.clone(),
        }
    }

    pub fn summary(&self) -> RelatedAlert {
        RelatedAlert {
            id: self.id,
            alert_type: self.alert_type.clone(),
            priority_score: self.priority_score,
            timestamp: self.timestamp,
        }
    }

    /// Projection served on the live `/alerts` feed.
    pub fn to_live(&self) -> LiveAlert {
        LiveAlert {
            alert_type: self.alert_type.clone(),
            severity: self.severity,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            protocol: self.protocol.clone(),
            description: self.description.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn to_record(&self) -> AlertRecord {
        AlertRecord {
            id: self.id,
            timestamp: self.timestamp,
            alert_type: self.alert_type.clone(),
            severity: self.severity,
            priority_score: self.priority_score,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            protocol: self.protocol.clone(),
            description: self.description.clone(),
        }
    }
}

/// One individual alert in the `/api/alerts/history` listing.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub priority_score: f64,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<String>,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}
