//! `CaptureSource` boundary and its `pnet`-datalink-backed implementation.
//!
//! Uses `datalink::interfaces()` for enumeration, `datalink::channel(interface,
//! config)` returning an `Ethernet(_, rx)` pair, and `Ipv4Packet`/`TcpPacket::new`
//! for header parsing: a single cross-platform datalink capture path rather
//! than a platform-specific raw-socket backend, consistent with the boundary
//! being an external, backend-agnostic capability.

use std::net::IpAddr;
use std::time::Duration;

use pnet::datalink::{self, Channel::Ethernet, DataLinkReceiver, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;

use crate::data::PacketRecord;
use crate::error::{Result, SynwatchError};

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub id: String,
    pub display_name: String,
}

pub enum NextOutcome {
    Record(PacketRecord),
    Timeout,
    Closed,
}

/// External, backend-agnostic packet capture capability.
pub trait CaptureSource: Send + Sync {
    fn list_interfaces(&self) -> Vec<InterfaceDescriptor>;
    fn open(
        &self,
        interface_id: &str,
        filter_expression: &str,
        promiscuous: bool,
        read_timeout: Duration,
    ) -> Result<Box<dyn CaptureHandle>>;
}

pub trait CaptureHandle: Send {
    fn next(&mut self, deadline: Duration) -> NextOutcome;
    fn close(&mut self);
}

/// Canonicalises a brace-wrapped GUID for equality comparison: `{ABC}`,
/// `{abc}`, and `abc` all refer to the same interface.
pub fn canonicalize_interface_id(id: &str) -> String {
    id.trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_lowercase()
}

/// Allow-listed filter-expression validation. This is not an exhaustive BPF
/// grammar; it only needs to reject obviously unsafe strings before handing
/// them to the capture backend, since the backend itself interprets the
/// expression.
pub fn validate_filter_expression(expr: &str) -> Result<()> {
    if expr.len() > 1_000 {
        return Err(SynwatchError::Configuration {
            option: "filter_expression".to_string(),
            reason: "filter expression longer than 1000 characters".to_string(),
        });
    }
    if expr.chars().any(|c| "|&;`".contains(c)) {
        return Err(SynwatchError::Configuration {
            option: "filter_expression".to_string(),
            reason: "filter expression contains a disallowed shell metacharacter".to_string(),
        });
    }
    Ok(())
}

/// Validates an interface identifier's grammar: 1-50 characters of
/// `[A-Za-z0-9_.{}-]+`.
pub fn validate_interface_id(id: &str) -> Result<()> {
    let len_ok = !id.is_empty() && id.len() <= 50;
    let chars_ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_.{}-".contains(c));
    if !len_ok || !chars_ok {
        return Err(SynwatchError::Configuration {
            option: "interface".to_string(),
            reason: format!("invalid interface identifier: {}", id),
        });
    }
    Ok(())
}

/// Reference `CaptureSource` backed by `pnet`'s datalink channel abstraction,
/// parsing Ethernet -> IPv4/IPv6 -> TCP headers per frame and discarding
/// anything that is not TCP-over-IP per the `PacketRecord` invariant.
pub struct PnetCaptureSource;

impl PnetCaptureSource {
    pub fn new() -> Self {
        PnetCaptureSource
    }
}

impl Default for PnetCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for PnetCaptureSource {
    fn list_interfaces(&self) -> Vec<InterfaceDescriptor> {
        datalink::interfaces()
            .into_iter()
            .map(|iface: NetworkInterface| {
                let ips: Vec<String> = iface
                    .ips
                    .iter()
                    .map(|ip_network| ip_network.ip().to_string())
                    .collect();
                let display_name = if ips.is_empty() {
                    iface.name.clone()
                } else {
                    format!("{} ({})", iface.name, ips.join(", "))
                };
                InterfaceDescriptor {
                    id: iface.name,
                    display_name,
                }
            })
            .collect()
    }

    fn open(
        &self,
        interface_id: &str,
        filter_expression: &str,
        promiscuous: bool,
        read_timeout: Duration,
    ) -> Result<Box<dyn CaptureHandle>> {
        validate_filter_expression(filter_expression)?;
        validate_interface_id(interface_id)?;

        let canonical_target = canonicalize_interface_id(interface_id);
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| canonicalize_interface_id(&iface.name) == canonical_target)
            .ok_or_else(|| SynwatchError::UnknownInterface(interface_id.to_string()))?;

        let mut config = datalink::Config::default();
        config.promiscuous = promiscuous;
        config.read_timeout = Some(read_timeout);

        match datalink::channel(&interface, config) {
            Ok(Ethernet(_tx, rx)) => Ok(Box::new(PnetCaptureHandle {
                receiver: rx,
                start: std::time::Instant::now(),
                closed: false,
            })),
            Ok(_) => Err(SynwatchError::CaptureOpenFailed {
                cause: "unsupported channel type".to_string(),
            }),
            Err(e) => Err(SynwatchError::CaptureOpenFailed {
                cause: e.to_string(),
            }),
        }
    }
}

struct PnetCaptureHandle {
    receiver: Box<dyn DataLinkReceiver>,
    start: std::time::Instant,
    closed: bool,
}

impl CaptureHandle for PnetCaptureHandle {
    fn next(&mut self, deadline: Duration) -> NextOutcome {
        if self.closed {
            return NextOutcome::Closed;
        }
        let call_start = std::time::Instant::now();
        loop {
            match self.receiver.next() {
                Ok(frame) => {
                    if let Some(record) = parse_tcp_over_ip(frame, self.start.elapsed().as_secs_f64()) {
                        return NextOutcome::Record(record);
                    }
                    // Non-TCP/IP frame: keep reading until the deadline elapses.
                    if call_start.elapsed() >= deadline {
                        return NextOutcome::Timeout;
                    }
                }
                Err(_) => return NextOutcome::Timeout,
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Parses an Ethernet frame down to a `PacketRecord`, returning `None` for
/// anything that is not TCP over IPv4/IPv6: records enter the queue only if
/// they parsed as TCP over IP.
fn parse_tcp_over_ip(frame: &[u8], timestamp: f64) -> Option<PacketRecord> {
    let ethernet = EthernetPacket::new(frame)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet.payload())?;
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let tcp = TcpPacket::new(ipv4.payload())?;
            Some(build_record(
                timestamp,
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                &tcp,
                ipv4.get_total_length() as u32,
            ))
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet.payload())?;
            if ipv6.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let tcp = TcpPacket::new(ipv6.payload())?;
            Some(build_record(
                timestamp,
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                &tcp,
                ipv6.get_payload_length() as u32 + 40,
            ))
        }
        _ => None,
    }
}

fn build_record(
    timestamp: f64,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    tcp: &TcpPacket,
    packet_size: u32,
) -> PacketRecord {
    // pnet's TCP flags already pack FIN/SYN/RST/.../ACK into the control-bits
    // octet at the wire-layout bit positions `data::FLAG_*` expects, so the
    // byte is carried through unchanged.
    PacketRecord {
        timestamp,
        src_ip: src_ip.to_string(),
        dst_ip: dst_ip.to_string(),
        src_port: tcp.get_source(),
        dst_port: tcp.get_destination(),
        flags: tcp.get_flags(),
        packet_size,
    }
}
