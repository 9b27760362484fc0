//! Core data types shared across the capture, extraction, and scoring stages.

use serde::Serialize;
use std::fmt;

/// TCP flag bit positions within `PacketRecord::flags`, matching the wire layout
/// of the TCP header's control-bits octet (offset 13).
pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_ACK: u8 = 0x10;

/// The unit handed from capture to the worker loop. Only ever constructed for
/// packets that parsed as TCP over IP.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    /// Monotonic seconds with sub-second precision, relative to an
    /// arbitrary epoch fixed at the start of a capture session.
    pub timestamp: f64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub packet_size: u32,
}

impl PacketRecord {
    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & FLAG_RST != 0
    }
}

/// Composite lookup key for the feature extractor's per-scope counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowKey {
    Global,
    Source(String),
    Dest(String),
    Pair(String, String),
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::Global => write!(f, "global"),
            FlowKey::Source(ip) => write!(f, "src:{}", ip),
            FlowKey::Dest(ip) => write!(f, "dst:{}", ip),
            FlowKey::Pair(src, dst) => write!(f, "pair:{}->{}", src, dst),
        }
    }
}

/// The fixed-arity, ordered vector the classifier scores. Arity is always 20;
/// see `features::FEATURE_COUNT` and `features::FEATURE_NAMES`.
pub type FeatureVector = [f64; crate::features::FEATURE_COUNT];

/// Emitted to the `EventSink` when a classifier score crosses the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub probability: f64,
    pub feature_snapshot: Vec<f64>,
}

impl ThreatEvent {
    pub fn new(record: &PacketRecord, probability: f64, features: &FeatureVector) -> Self {
        ThreatEvent {
            timestamp: chrono::Utc::now(),
            src_ip: record.src_ip.clone(),
            dst_ip: record.dst_ip.clone(),
            src_port: record.src_port,
            dst_port: record.dst_port,
            probability,
            feature_snapshot: features.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flags: u8) -> PacketRecord {
        PacketRecord {
            timestamp: 0.0,
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 44000,
            dst_port: 80,
            flags,
            packet_size: 64,
        }
    }

    #[test]
    fn flag_helpers_decode_bit_positions() {
        let syn_ack = record(FLAG_SYN | FLAG_ACK);
        assert!(syn_ack.is_syn());
        assert!(syn_ack.is_ack());
        assert!(!syn_ack.is_fin());
        assert!(!syn_ack.is_rst());
    }

    #[test]
    fn flow_key_display_is_stable() {
        let pair = FlowKey::Pair("10.0.0.1".to_string(), "10.0.0.2".to_string());
        assert_eq!(pair.to_string(), "pair:10.0.0.1->10.0.0.2");
    }
}
