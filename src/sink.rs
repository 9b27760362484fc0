//! `EventSink` boundary: the coordinator's one-way outbound capability.
//!
//! `LoggingEventSink` formats every alert through `log`/`env_logger` in
//! place of an ANSI-highlighted `println!`, and `ChannelEventSink` gives
//! tests a drainable `crossbeam_channel::Receiver` in place of asserting
//! against captured stdout.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};

use crate::data::ThreatEvent;
use crate::stats::StatisticsSnapshot;

/// Deadline the coordinator allows a single `EventSink` call before giving up
/// and counting a `SinkTimeout`.
pub const SINK_DELIVERY_DEADLINE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Tagged events delivered to a subscriber. A sink must not block; the
/// coordinator enforces `SINK_DELIVERY_DEADLINE` around each call rather
/// than trusting implementations to self-limit.
#[derive(Debug, Clone)]
pub enum Event {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ThreatDetected(ThreatEvent),
    StatisticsSnapshot(StatisticsSnapshot),
    Error { kind: String, message: String },
}

/// Single-subscriber callback capability. Implementations must return
/// promptly; the coordinator does not wait past `SINK_DELIVERY_DEADLINE`.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: Event);
}

/// Formats every variant through the `log` facade, backed by `env_logger`.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn handle(&self, event: Event) {
        match event {
            Event::StateChanged { from, to } => {
                info!("session state changed: {} -> {}", from, to);
            }
            Event::ThreatDetected(threat) => {
                warn!(
                    "threat detected: {}:{} -> {}:{} probability={:.3}",
                    threat.src_ip, threat.src_port, threat.dst_ip, threat.dst_port, threat.probability
                );
            }
            Event::StatisticsSnapshot(snapshot) => {
                info!(
                    "stats: captured={} dropped={} extracted={} predictions={} threats={} errors={}",
                    snapshot.packets_captured,
                    snapshot.packets_dropped,
                    snapshot.features_extracted,
                    snapshot.predictions_made,
                    snapshot.threats_detected,
                    snapshot.processing_errors,
                );
            }
            Event::Error { kind, message } => {
                warn!("error event [{}]: {}", kind, message);
            }
        }
    }
}

/// Records every delivered event into a bounded channel a test can drain.
pub struct ChannelEventSink {
    sender: Sender<Event>,
}

impl ChannelEventSink {
    /// Returns the sink half and a receiver the test keeps to drain events.
    pub fn new(capacity: usize) -> (Self, Receiver<Event>) {
        let (sender, receiver) = bounded(capacity);
        (ChannelEventSink { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn handle(&self, event: Event) {
        let _ = self.sender.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PacketRecord;

    #[test]
    fn channel_sink_records_delivered_events() {
        let (sink, rx) = ChannelEventSink::new(8);
        sink.handle(Event::StateChanged {
            from: SessionState::Idle,
            to: SessionState::Starting,
        });
        let record = PacketRecord {
            timestamp: 0.0,
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 1,
            dst_port: 80,
            flags: crate::data::FLAG_SYN,
            packet_size: 64,
        };
        let features = [0.0; crate::features::FEATURE_COUNT];
        sink.handle(Event::ThreatDetected(ThreatEvent::new(&record, 0.9, &features)));

        let first = rx.try_recv().expect("state change delivered");
        matches!(first, Event::StateChanged { .. });
        let second = rx.try_recv().expect("threat delivered");
        matches!(second, Event::ThreatDetected(_));
    }

    #[test]
    fn logging_sink_never_panics_on_any_variant() {
        let sink = LoggingEventSink;
        sink.handle(Event::StateChanged {
            from: SessionState::Running,
            to: SessionState::Stopping,
        });
        sink.handle(Event::Error {
            kind: "HighErrorRate".to_string(),
            message: "10% over window".to_string(),
        });
    }
}
