use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Open, key-ordered extension fields attached by the normalizer.
pub type ExtraFields = BTreeMap<String, serde_json::Value>;

/// Well-known `extra_fields` keys. New keys may be added; existing keys keep
/// their meaning.
pub mod extra_keys {
    /// Producer-reported severity (`low`, `medium`, `high`, `critical`).
    pub const SEVERITY: &str = "severity";
    /// Outcome of the observed action (`success`, `failure`).
    pub const OUTCOME: &str = "outcome";
    /// Reporting host name.
    pub const HOSTNAME: &str = "hostname";
    /// Bytes transferred.
    pub const BYTES: &str = "bytes";
    /// Process or executable name.
    pub const PROCESS: &str = "process";
}

/// Event record as delivered by the external normalizer.
///
/// Every field is optional on the wire; `Event::new` decides what is
/// acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, alias = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub src_ip: Option<String>,
    #[serde(default)]
    pub dst_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, alias = "dst_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, alias = "description")]
    pub message: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub extra_fields: ExtraFields,
    #[serde(default)]
    pub raw_log: Option<String>,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, src_ip: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            src_ip: Some(src_ip.into()),
            timestamp: Some(serde_json::Value::String(Utc::now().to_rfc3339())),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(serde_json::Value::String(timestamp.to_rfc3339()));
        self
    }

    pub fn with_dst_ip(mut self, dst_ip: impl Into<String>) -> Self {
        self.dst_ip = Some(dst_ip.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_fields.insert(key.into(), value);
        self
    }
}

/// Canonical, immutable security event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub message: String,
    pub source_type: String,
    pub extra_fields: ExtraFields,
    pub raw_log: Option<String>,
}

impl Event {
    /// Validate a raw record into an `Event`.
    ///
    /// Fails when the timestamp is absent or unparseable, when an IP field is
    /// malformed, or when the event type is missing.
    pub fn new(raw: RawEvent) -> EngineResult<Self> {
        let timestamp = match raw.timestamp.as_ref() {
            Some(value) => parse_timestamp(value)?,
            None => return Err(EngineError::validation("timestamp is required")),
        };

        let event_type = raw
            .event_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::validation("event_type is required"))?;

        let src_ip = raw
            .src_ip
            .as_deref()
            .ok_or_else(|| EngineError::validation("src_ip is required"))
            .and_then(|ip| parse_ip("src_ip", ip))?;

        let dst_ip = match raw.dst_ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => Some(parse_ip("dst_ip", ip)?),
            _ => None,
        };

        let source_type = raw
            .source_type
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            id: raw
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp,
            event_type,
            src_ip,
            dst_ip,
            protocol: raw
                .protocol
                .map(|p| p.trim().to_uppercase())
                .filter(|p| !p.is_empty()),
            port: raw.port,
            user: raw.user.filter(|u| !u.trim().is_empty()),
            message: raw.message.unwrap_or_default(),
            source_type,
            extra_fields: raw.extra_fields,
            raw_log: raw.raw_log,
        })
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra_fields.get(key).and_then(|v| v.as_str())
    }

    /// Whether this event records a failed action (login, auth, connection).
    pub fn is_failure(&self) -> bool {
        if let Some(outcome) = self.extra_str(extra_keys::OUTCOME) {
            let outcome = outcome.to_lowercase();
            return outcome == "failure" || outcome == "failed" || outcome == "denied";
        }
        let event_type = self.event_type.to_lowercase();
        event_type.contains("fail") || event_type.contains("brute") || event_type.contains("denied")
    }
}

fn parse_ip(field: &str, value: &str) -> EngineResult<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| EngineError::validation(format!("{} is not a valid IP address: {}", field, value)))
}

/// Latest accepted event time, the last instant of year 9999.
const MAX_EVENT_SECONDS: i64 = 253_402_300_799;

/// `ts + delta`, clamped to the representable range.
pub fn saturating_add(ts: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    ts.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `ts - delta`, clamped to the representable range.
pub fn saturating_sub(ts: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    ts.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Event times must fall between the Unix epoch and the end of year 9999.
fn parse_timestamp(value: &serde_json::Value) -> EngineResult<DateTime<Utc>> {
    let ts = parse_timestamp_value(value)?;
    if ts.timestamp() < 0 || ts.timestamp() > MAX_EVENT_SECONDS {
        return Err(EngineError::validation(format!("timestamp out of range: {}", ts.to_rfc3339())));
    }
    Ok(ts)
}

fn parse_timestamp_value(value: &serde_json::Value) -> EngineResult<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            // Naive ISO-8601 timestamps are taken as UTC.
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            Err(EngineError::validation(format!("unparseable timestamp: {}", s)))
        }
        serde_json::Value::Number(n) => {
            let seconds = n
                .as_f64()
                .filter(|s| s.is_finite())
                .ok_or_else(|| EngineError::validation("timestamp is not a finite number"))?;
            if seconds < 0.0 || seconds > MAX_EVENT_SECONDS as f64 {
                return Err(EngineError::validation(format!("timestamp out of range: {}", seconds)));
            }
            let whole = seconds.trunc() as i64;
            let nanos = ((seconds.fract()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos)
                .single()
                .ok_or_else(|| EngineError::validation(format!("timestamp out of range: {}", seconds)))
        }
        other => Err(EngineError::validation(format!("unsupported timestamp value: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_from_raw_normalizes_fields() {
        let raw = RawEvent::new("port_scan", "10.0.0.5")
            .with_dst_ip("10.0.0.9")
            .with_protocol("tcp")
            .with_port(22)
            .with_source_type("Firewall");

        let event = Event::new(raw).unwrap();

        assert_eq!(event.event_type, "port_scan");
        assert_eq!(event.src_ip.to_string(), "10.0.0.5");
        assert_eq!(event.dst_ip.unwrap().to_string(), "10.0.0.9");
        assert_eq!(event.protocol.as_deref(), Some("TCP"));
        assert_eq!(event.source_type, "firewall");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_event_requires_parseable_timestamp() {
        let mut raw = RawEvent::new("port_scan", "10.0.0.5");
        raw.timestamp = None;
        assert!(matches!(Event::new(raw), Err(EngineError::Validation(_))));

        let mut raw = RawEvent::new("port_scan", "10.0.0.5");
        raw.timestamp = Some(json!("yesterday-ish"));
        assert!(matches!(Event::new(raw), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_event_rejects_malformed_src_ip() {
        let raw = RawEvent::new("port_scan", "10.0.0.500");
        let err = Event::new(raw).unwrap_err();
        assert!(err.to_string().contains("src_ip"));
    }

    #[test]
    fn test_timestamp_formats() {
        let mut raw = RawEvent::new("failed_login", "192.168.1.20");
        raw.timestamp = Some(json!("2024-05-01T12:30:00.250"));
        let event = Event::new(raw).unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2024-05-01T12:30:00.250+00:00");

        let mut raw = RawEvent::new("failed_login", "192.168.1.20");
        raw.timestamp = Some(json!(1714566600));
        let event = Event::new(raw).unwrap();
        assert_eq!(event.timestamp.timestamp(), 1714566600);
    }

    #[test]
    fn test_timestamps_outside_epoch_to_year_9999_are_rejected() {
        for value in [json!(8210266876799i64), json!(-8334601228800i64), json!(-1), json!("1969-12-31T23:59:59Z")] {
            let mut raw = RawEvent::new("port_scan", "10.0.0.5");
            raw.timestamp = Some(value);
            assert!(matches!(Event::new(raw), Err(EngineError::Validation(_))));
        }

        let mut raw = RawEvent::new("port_scan", "10.0.0.5");
        raw.timestamp = Some(json!("9999-12-31T23:59:59Z"));
        assert_eq!(Event::new(raw).unwrap().timestamp.timestamp(), MAX_EVENT_SECONDS);
    }

    #[test]
    fn test_saturating_arithmetic_clamps() {
        let latest = DateTime::<Utc>::MAX_UTC;
        assert_eq!(saturating_add(latest, Duration::days(1)), latest);
        let earliest = DateTime::<Utc>::MIN_UTC;
        assert_eq!(saturating_sub(earliest, Duration::days(1)), earliest);
    }

    #[test]
    fn test_wire_aliases_and_failure_detection() {
        let raw: RawEvent = serde_json::from_value(json!({
            "type": "ssh_login",
            "timestamp": "2024-05-01T12:30:00Z",
            "src_ip": "192.168.1.20",
            "dst_port": 22,
            "description": "login attempt",
            "extra_fields": { "outcome": "failure" }
        }))
        .unwrap();

        let event = Event::new(raw).unwrap();
        assert_eq!(event.event_type, "ssh_login");
        assert_eq!(event.port, Some(22));
        assert_eq!(event.message, "login attempt");
        assert!(event.is_failure());
    }
}
