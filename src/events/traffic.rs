use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::event::{extra_keys, Event};
use super::store::LogEntry;

/// Live traffic counters behind `GET /stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    pub total_packets: u64,
    pub protocols: BTreeMap<String, u64>,
}

impl TrafficStats {
    /// Count an event as a packet when it carries a protocol.
    pub fn record(&mut self, event: &Event) {
        if let Some(protocol) = &event.protocol {
            self.total_packets += 1;
            *self.protocols.entry(protocol.clone()).or_insert(0) += 1;
        }
    }
}

/// A protocol-bearing event as listed by `/api/traffic/recent`.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub protocol: String,
    pub port: Option<u16>,
    pub packet_size: Option<u64>,
}

impl TrafficRecord {
    pub fn from_entry(entry: &LogEntry) -> Option<Self> {
        let event = &entry.event;
        Some(Self {
            id: event.id.clone(),
            seq: entry.seq,
            timestamp: event.timestamp,
            src_ip: event.src_ip,
            dst_ip: event.dst_ip,
            protocol: event.protocol.clone()?,
            port: event.port,
            packet_size: event.extra_fields.get(extra_keys::BYTES).and_then(|v| v.as_u64()),
        })
    }
}
