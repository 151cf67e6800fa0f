//! Parsed packet model.
//!
//! Extracts the layer fields the detection pipeline and the presentation
//! side need from a raw Ethernet frame: addresses, protocol numbers, ports,
//! TCP flags, ICMP type/code, and ARP sender/target. Parsing is total -
//! a frame that cannot be sliced degrades to a raw record with defaulted
//! fields rather than an error, so a malformed packet can never abort the
//! capture loop.

use std::net::{IpAddr, Ipv4Addr};

use etherparse::{LinkSlice, NetSlice, SlicedPacket, TransportSlice};
use serde::Serialize;

/// Top-level protocol classification used for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolKind {
    Tcp,
    Udp,
    Icmp,
    Arp,
    Other,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Icmp => write!(f, "ICMP"),
            Self::Arp => write!(f, "ARP"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// TCP header fields retained for rule checks and packet detail display.
#[derive(Debug, Clone, Serialize)]
pub struct TcpInfo {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub sequence: u32,
    pub window: u16,
}

impl TcpInfo {
    /// Renders the set flags as a comma-separated list, e.g. "SYN,ACK".
    pub fn flags_string(&self) -> String {
        let mut flags = Vec::new();
        if self.syn {
            flags.push("SYN");
        }
        if self.ack {
            flags.push("ACK");
        }
        if self.fin {
            flags.push("FIN");
        }
        if self.rst {
            flags.push("RST");
        }
        if self.psh {
            flags.push("PSH");
        }
        if self.urg {
            flags.push("URG");
        }
        flags.join(",")
    }
}

/// ICMP type and code (v4 or v6).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

/// Fields of an ARP message (request or reply).
#[derive(Debug, Clone, Serialize)]
pub struct ArpInfo {
    /// ARP operation: 1 = request, 2 = reply.
    pub operation: u16,
    pub sender_mac: String,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

/// Everything the pipeline knows about a single captured frame.
#[derive(Debug, Clone, Serialize)]
pub struct PacketMeta {
    /// Total frame length on the wire in bytes.
    pub length: u32,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    /// Present only when an IPv4/IPv6 layer was parsed.
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    /// IP protocol number (next header for IPv6); 0 when there is no IP layer.
    pub protocol: u8,
    pub kind: ProtocolKind,
    /// TTL (IPv4) or hop limit (IPv6).
    pub ttl: Option<u8>,
    /// 0 when the transport has no port concept (ICMP, ARP).
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp: Option<TcpInfo>,
    pub icmp: Option<IcmpInfo>,
    pub arp: Option<ArpInfo>,
}

impl PacketMeta {
    /// A record for a frame that could not be parsed: only the length is known.
    pub fn raw(length: u32) -> Self {
        Self {
            length,
            src_mac: None,
            dst_mac: None,
            src_ip: None,
            dst_ip: None,
            protocol: 0,
            kind: ProtocolKind::Other,
            ttl: None,
            src_port: 0,
            dst_port: 0,
            tcp: None,
            icmp: None,
            arp: None,
        }
    }

    /// Parses a raw Ethernet frame. Never fails; unknown or truncated layers
    /// leave the corresponding fields at their defaults.
    pub fn parse(data: &[u8]) -> Self {
        let mut meta = Self::raw(data.len() as u32);

        let sliced = match SlicedPacket::from_ethernet(data) {
            Ok(s) => s,
            Err(_) => return meta,
        };

        if let Some(LinkSlice::Ethernet2(eth)) = &sliced.link {
            meta.src_mac = Some(format_mac(&eth.source()));
            meta.dst_mac = Some(format_mac(&eth.destination()));
            // etherparse does not slice ARP; the fixed 28-byte body follows
            // the 14-byte Ethernet header.
            if eth.ether_type().0 == 0x0806 {
                meta.arp = parse_arp_body(&data[14..]);
                if meta.arp.is_some() {
                    meta.kind = ProtocolKind::Arp;
                }
            }
        }

        match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                meta.src_ip = Some(IpAddr::from(header.source()));
                meta.dst_ip = Some(IpAddr::from(header.destination()));
                meta.protocol = header.protocol().0;
                meta.ttl = Some(header.ttl());
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                meta.src_ip = Some(IpAddr::from(header.source()));
                meta.dst_ip = Some(IpAddr::from(header.destination()));
                meta.protocol = header.next_header().0;
                meta.ttl = Some(header.hop_limit());
            }
            _ => {}
        }

        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                meta.kind = ProtocolKind::Tcp;
                meta.src_port = tcp.source_port();
                meta.dst_port = tcp.destination_port();
                meta.tcp = Some(TcpInfo {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    urg: tcp.urg(),
                    sequence: tcp.sequence_number(),
                    window: tcp.window_size(),
                });
            }
            Some(TransportSlice::Udp(udp)) => {
                meta.kind = ProtocolKind::Udp;
                meta.src_port = udp.source_port();
                meta.dst_port = udp.destination_port();
            }
            Some(TransportSlice::Icmpv4(icmp)) => {
                meta.kind = ProtocolKind::Icmp;
                meta.icmp = Some(IcmpInfo {
                    icmp_type: icmp.type_u8(),
                    icmp_code: icmp.code_u8(),
                });
            }
            Some(TransportSlice::Icmpv6(icmp)) => {
                meta.kind = ProtocolKind::Icmp;
                meta.icmp = Some(IcmpInfo {
                    icmp_type: icmp.type_u8(),
                    icmp_code: icmp.code_u8(),
                });
            }
            _ => {}
        }

        meta
    }

    /// One-line human-readable summary, in rough wireshark style.
    pub fn summary(&self) -> String {
        match (&self.arp, self.src_ip, self.dst_ip) {
            (Some(arp), _, _) => {
                if arp.operation == 1 {
                    format!(
                        "ARP who-has {} tell {} len={}",
                        arp.target_ip, arp.sender_ip, self.length
                    )
                } else {
                    format!(
                        "ARP reply {} is-at {} len={}",
                        arp.sender_ip, arp.sender_mac, self.length
                    )
                }
            }
            (None, Some(src), Some(dst)) => match self.kind {
                ProtocolKind::Tcp => {
                    let flags = self
                        .tcp
                        .as_ref()
                        .map(|t| t.flags_string())
                        .unwrap_or_default();
                    format!(
                        "TCP {}:{} -> {}:{} [{}] len={}",
                        src, self.src_port, dst, self.dst_port, flags, self.length
                    )
                }
                ProtocolKind::Udp => format!(
                    "UDP {}:{} -> {}:{} len={}",
                    src, self.src_port, dst, self.dst_port, self.length
                ),
                ProtocolKind::Icmp => {
                    let (t, c) = self
                        .icmp
                        .map(|i| (i.icmp_type, i.icmp_code))
                        .unwrap_or((0, 0));
                    format!(
                        "ICMP {} -> {} type={} code={} len={}",
                        src, dst, t, c, self.length
                    )
                }
                _ => format!(
                    "IP {} -> {} proto={} len={}",
                    src, dst, self.protocol, self.length
                ),
            },
            _ => format!("frame len={}", self.length),
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parses the fixed-size body of an Ethernet/IPv4 ARP message.
fn parse_arp_body(body: &[u8]) -> Option<ArpInfo> {
    if body.len() < 28 {
        return None;
    }
    // Only Ethernet (hw type 1) + IPv4 (proto 0x0800) ARP is interesting.
    let hw_type = u16::from_be_bytes([body[0], body[1]]);
    let proto_type = u16::from_be_bytes([body[2], body[3]]);
    if hw_type != 1 || proto_type != 0x0800 {
        return None;
    }
    let operation = u16::from_be_bytes([body[6], body[7]]);
    let sender_mac = format_mac(&[body[8], body[9], body[10], body[11], body[12], body[13]]);
    let sender_ip = Ipv4Addr::new(body[14], body[15], body[16], body[17]);
    let target_ip = Ipv4Addr::new(body[24], body[25], body[26], body[27]);
    Some(ArpInfo {
        operation,
        sender_mac,
        sender_ip,
        target_ip,
    })
}
