//! Packet handling module
//!
//! This module defines the decoded packet record and the layered field
//! access used by the rewrite engine, the stream processor, and the
//! analyzer.

use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::util::MacAddr;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// EtherType of an 802.1Q VLAN tag
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// EtherType of IPv4
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType of IPv6
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Length of an untagged Ethernet header
pub const ETHERNET_HEADER_LEN: usize = 14;
/// Length of one 802.1Q tag (TPID + TCI)
pub const VLAN_TAG_LEN: usize = 4;

/// Transport protocols recognized by caprel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    TCP,
    UDP,
    ICMP,
    ICMPv6,
    Unknown(u8),
}

impl From<IpNextHeaderProtocol> for Protocol {
    fn from(protocol: IpNextHeaderProtocol) -> Self {
        match protocol {
            IpNextHeaderProtocols::Tcp => Protocol::TCP,
            IpNextHeaderProtocols::Udp => Protocol::UDP,
            IpNextHeaderProtocols::Icmp => Protocol::ICMP,
            IpNextHeaderProtocols::Icmpv6 => Protocol::ICMPv6,
            _ => Protocol::Unknown(protocol.0),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
            Protocol::ICMP => write!(f, "ICMP"),
            Protocol::ICMPv6 => write!(f, "ICMPv6"),
            Protocol::Unknown(p) => write!(f, "proto-{}", p),
        }
    }
}

/// Location of the network layer within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLayer {
    /// IPv4 header at `offset`, `header_len` bytes long
    Ipv4 { offset: usize, header_len: usize },
    /// IPv6 fixed header at `offset`
    Ipv6 { offset: usize },
}

/// Location of the transport layer within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLayer {
    /// TCP header at `offset`, `header_len` bytes long
    Tcp { offset: usize, header_len: usize },
    /// UDP header at `offset`
    Udp { offset: usize },
    /// ICMP header at `offset`
    Icmp { offset: usize },
    /// ICMPv6 header at `offset`
    Icmpv6 { offset: usize },
}

/// Byte offsets of the protocol layers within a frame.
///
/// Produced by [`parse_layers`]. All offsets are validated against the
/// frame length before being recorded.
#[derive(Debug, Clone, Copy)]
pub struct LayerOffsets {
    /// Offset of the first 802.1Q tag (its TPID bytes), if present
    pub vlan: Option<usize>,
    /// EtherType seen after any VLAN tags
    pub ethertype: u16,
    /// Offset where the network layer begins
    pub network_offset: usize,
    /// Parsed network layer, if recognized and complete
    pub network: Option<NetworkLayer>,
    /// Parsed transport layer, if recognized and complete
    pub transport: Option<TransportLayer>,
    /// Offset of the innermost raw payload, if any bytes follow the
    /// recognized headers
    pub payload: Option<usize>,
}

/// Parse the layer structure of an Ethernet frame.
///
/// Returns `None` for frames too short to carry an Ethernet header.
/// Truncated or unrecognized inner layers leave the corresponding
/// fields unset; parsing itself never fails beyond that.
pub fn parse_layers(data: &[u8]) -> Option<LayerOffsets> {
    if data.len() < ETHERNET_HEADER_LEN {
        return None;
    }

    // Walk the EtherType chain past any stacked 802.1Q tags.
    let mut cursor: usize = 12;
    let mut vlan: Option<usize> = None;
    let mut ethertype: u16 = u16::from_be_bytes([data[cursor], data[cursor + 1]]);
    while ethertype == ETHERTYPE_VLAN {
        if vlan.is_none() {
            vlan = Some(cursor);
        }
        if data.len() < cursor + VLAN_TAG_LEN + 2 {
            // Tag present but the frame ends before the inner EtherType.
            return Some(LayerOffsets {
                vlan,
                ethertype,
                network_offset: data.len(),
                network: None,
                transport: None,
                payload: None,
            });
        }
        cursor += VLAN_TAG_LEN;
        ethertype = u16::from_be_bytes([data[cursor], data[cursor + 1]]);
    }
    let network_offset: usize = cursor + 2;

    let mut layers = LayerOffsets {
        vlan,
        ethertype,
        network_offset,
        network: None,
        transport: None,
        payload: None,
    };

    let (transport_offset, next_proto) = match ethertype {
        ETHERTYPE_IPV4 => {
            if data.len() < network_offset + 20 {
                return Some(layers);
            }
            let header_len: usize = ((data[network_offset] & 0x0F) as usize) * 4;
            if header_len < 20 || data.len() < network_offset + header_len {
                return Some(layers);
            }
            layers.network = Some(NetworkLayer::Ipv4 {
                offset: network_offset,
                header_len,
            });
            (
                network_offset + header_len,
                IpNextHeaderProtocol(data[network_offset + 9]),
            )
        }
        ETHERTYPE_IPV6 => {
            if data.len() < network_offset + 40 {
                return Some(layers);
            }
            layers.network = Some(NetworkLayer::Ipv6 {
                offset: network_offset,
            });
            // Extension headers are not walked; the next-header field is
            // taken as the transport protocol directly.
            (
                network_offset + 40,
                IpNextHeaderProtocol(data[network_offset + 6]),
            )
        }
        _ => return Some(layers),
    };

    match Protocol::from(next_proto) {
        Protocol::TCP => {
            if data.len() >= transport_offset + 20 {
                let header_len: usize =
                    (((data[transport_offset + 12] >> 4) & 0x0F) as usize) * 4;
                if header_len >= 20 && data.len() >= transport_offset + header_len {
                    layers.transport = Some(TransportLayer::Tcp {
                        offset: transport_offset,
                        header_len,
                    });
                    if data.len() > transport_offset + header_len {
                        layers.payload = Some(transport_offset + header_len);
                    }
                }
            }
        }
        Protocol::UDP => {
            if data.len() >= transport_offset + 8 {
                layers.transport = Some(TransportLayer::Udp {
                    offset: transport_offset,
                });
                if data.len() > transport_offset + 8 {
                    layers.payload = Some(transport_offset + 8);
                }
            }
        }
        Protocol::ICMP => {
            if data.len() >= transport_offset + 8 {
                layers.transport = Some(TransportLayer::Icmp {
                    offset: transport_offset,
                });
                if data.len() > transport_offset + 8 {
                    layers.payload = Some(transport_offset + 8);
                }
            }
        }
        Protocol::ICMPv6 => {
            if data.len() >= transport_offset + 8 {
                layers.transport = Some(TransportLayer::Icmpv6 {
                    offset: transport_offset,
                });
                if data.len() > transport_offset + 8 {
                    layers.payload = Some(transport_offset + 8);
                }
            }
        }
        Protocol::Unknown(_) => {
            // Unrecognized IP payload: everything after the network
            // header is raw payload.
            if data.len() > transport_offset {
                layers.payload = Some(transport_offset);
            }
        }
    }

    Some(layers)
}

/// A decoded packet record: raw frame bytes plus the capture timestamp.
///
/// Owned exclusively by one rewrite call at a time; never retained
/// across packets.
#[derive(Debug, Clone)]
pub struct CaprelPacket {
    /// Raw frame bytes as captured
    pub data: Vec<u8>,
    /// Capture timestamp, whole seconds since the epoch
    pub ts_sec: i64,
    /// Microsecond remainder of the capture timestamp
    pub ts_usec: u32,
    /// Original wire length (may exceed the captured bytes)
    pub orig_len: u32,
}

impl CaprelPacket {
    /// Create a packet record from a pcap capture record
    pub fn from_capture(packet: &pcap::Packet) -> Self {
        Self {
            data: packet.data.to_vec(),
            ts_sec: packet.header.ts.tv_sec as i64,
            ts_usec: packet.header.ts.tv_usec as u32,
            orig_len: packet.header.len,
        }
    }

    /// Parse the layer structure of this packet
    pub fn layers(&self) -> Option<LayerOffsets> {
        parse_layers(&self.data)
    }

    /// Source and destination link addresses, if the frame carries them
    pub fn link_addrs(&self) -> Option<(MacAddr, MacAddr)> {
        if self.data.len() < ETHERNET_HEADER_LEN {
            return None;
        }
        let d: &[u8] = &self.data;
        let dst: MacAddr = MacAddr::new(d[0], d[1], d[2], d[3], d[4], d[5]);
        let src: MacAddr = MacAddr::new(d[6], d[7], d[8], d[9], d[10], d[11]);
        Some((src, dst))
    }

    /// Source and destination network addresses, if an IP layer is present
    pub fn network_addrs(&self) -> Option<(IpAddr, IpAddr)> {
        let layers: LayerOffsets = self.layers()?;
        match layers.network? {
            NetworkLayer::Ipv4 { offset, .. } => {
                let d: &[u8] = &self.data;
                let src =
                    Ipv4Addr::new(d[offset + 12], d[offset + 13], d[offset + 14], d[offset + 15]);
                let dst =
                    Ipv4Addr::new(d[offset + 16], d[offset + 17], d[offset + 18], d[offset + 19]);
                Some((IpAddr::V4(src), IpAddr::V4(dst)))
            }
            NetworkLayer::Ipv6 { offset } => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&self.data[offset + 8..offset + 24]);
                dst.copy_from_slice(&self.data[offset + 24..offset + 40]);
                Some((
                    IpAddr::V6(Ipv6Addr::from(src)),
                    IpAddr::V6(Ipv6Addr::from(dst)),
                ))
            }
        }
    }

    /// Source and destination transport ports, for TCP and UDP
    pub fn transport_ports(&self) -> Option<(u16, u16)> {
        let layers: LayerOffsets = self.layers()?;
        let offset: usize = match layers.transport? {
            TransportLayer::Tcp { offset, .. } => offset,
            TransportLayer::Udp { offset } => offset,
            _ => return None,
        };
        let d: &[u8] = &self.data;
        let src: u16 = u16::from_be_bytes([d[offset], d[offset + 1]]);
        let dst: u16 = u16::from_be_bytes([d[offset + 2], d[offset + 3]]);
        Some((src, dst))
    }

    /// Transport protocol carried by the packet, if an IP layer is present
    pub fn protocol(&self) -> Option<Protocol> {
        let layers: LayerOffsets = self.layers()?;
        match layers.transport {
            Some(TransportLayer::Tcp { .. }) => Some(Protocol::TCP),
            Some(TransportLayer::Udp { .. }) => Some(Protocol::UDP),
            Some(TransportLayer::Icmp { .. }) => Some(Protocol::ICMP),
            Some(TransportLayer::Icmpv6 { .. }) => Some(Protocol::ICMPv6),
            None => match layers.network? {
                NetworkLayer::Ipv4 { offset, .. } => Some(Protocol::from(IpNextHeaderProtocol(
                    self.data[offset + 9],
                ))),
                NetworkLayer::Ipv6 { offset } => Some(Protocol::from(IpNextHeaderProtocol(
                    self.data[offset + 6],
                ))),
            },
        }
    }

    /// Identifier of the first 802.1Q tag, if present
    pub fn vlan_id(&self) -> Option<u16> {
        let layers: LayerOffsets = self.layers()?;
        let offset: usize = layers.vlan?;
        let tci: u16 = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
        Some(tci & 0x0FFF)
    }

    /// The innermost raw payload bytes, if any
    pub fn payload(&self) -> Option<&[u8]> {
        let layers: LayerOffsets = self.layers()?;
        layers.payload.map(|offset: usize| &self.data[offset..])
    }

    /// Build the pcap record header for writing this packet back out
    pub fn capture_header(&self) -> pcap::PacketHeader {
        pcap::PacketHeader {
            ts: libc::timeval {
                tv_sec: self.ts_sec as libc::time_t,
                tv_usec: self.ts_usec as libc::suseconds_t,
            },
            caplen: self.data.len() as u32,
            len: self.orig_len,
        }
    }

    /// One-line human-readable summary of the packet
    pub fn summary(&self) -> String {
        let vlan: String = match self.vlan_id() {
            Some(id) => format!(" vlan {}", id),
            None => String::new(),
        };

        if let Some((src, dst)) = self.network_addrs() {
            let version: &str = if src.is_ipv4() { "IPv4" } else { "IPv6" };
            let proto: String = self
                .protocol()
                .map(|p: Protocol| p.to_string())
                .unwrap_or_else(|| "?".to_string());
            match self.transport_ports() {
                Some((sport, dport)) => format!(
                    "{}{} {} {}:{} > {}:{} len={}",
                    version,
                    vlan,
                    proto,
                    src,
                    sport,
                    dst,
                    dport,
                    self.data.len()
                ),
                None => format!(
                    "{}{} {} {} > {} len={}",
                    version,
                    vlan,
                    proto,
                    src,
                    dst,
                    self.data.len()
                ),
            }
        } else if let Some((src, dst)) = self.link_addrs() {
            let ethertype: u16 = self
                .layers()
                .map(|l: LayerOffsets| l.ethertype)
                .unwrap_or(0);
            format!(
                "ether{} {} > {} type=0x{:04x} len={}",
                vlan,
                src,
                dst,
                ethertype,
                self.data.len()
            )
        } else {
            format!("frame len={}", self.data.len())
        }
    }

    /// Hexadecimal dump of the first bytes of the frame, truncated with
    /// an ellipsis when the frame is longer
    pub fn hex_prefix(&self, max_chars: usize) -> String {
        let hex: String = self.data.iter().map(|b: &u8| format!("{:02x}", b)).collect();
        if hex.len() > max_chars {
            format!("{}...", &hex[..max_chars])
        } else {
            hex
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::{ipv4_tcp_packet, ipv4_udp_packet, vlan_tagged_packet};

    #[test]
    fn test_parse_ipv4_tcp_layers() {
        let packet: CaprelPacket =
            ipv4_tcp_packet("192.168.1.100", "10.0.0.1", 1234, 80, b"hello");
        let layers: LayerOffsets = packet.layers().unwrap();

        assert_eq!(layers.ethertype, ETHERTYPE_IPV4);
        assert!(layers.vlan.is_none());
        assert!(matches!(
            layers.network,
            Some(NetworkLayer::Ipv4 {
                offset: 14,
                header_len: 20
            })
        ));
        assert!(matches!(
            layers.transport,
            Some(TransportLayer::Tcp {
                offset: 34,
                header_len: 20
            })
        ));
        assert_eq!(layers.payload, Some(54));
        assert_eq!(packet.payload().unwrap(), b"hello");
    }

    #[test]
    fn test_field_accessors() {
        let packet: CaprelPacket = ipv4_udp_packet("172.16.0.5", "172.16.0.9", 5353, 53, b"query");

        let (src, dst) = packet.network_addrs().unwrap();
        assert_eq!(src.to_string(), "172.16.0.5");
        assert_eq!(dst.to_string(), "172.16.0.9");
        assert_eq!(packet.transport_ports(), Some((5353, 53)));
        assert_eq!(packet.protocol(), Some(Protocol::UDP));
        assert_eq!(packet.vlan_id(), None);
    }

    #[test]
    fn test_vlan_tag_offsets() {
        let packet: CaprelPacket =
            vlan_tagged_packet(42, "192.168.1.1", "192.168.1.2", 1000, 2000);
        let layers: LayerOffsets = packet.layers().unwrap();

        assert_eq!(layers.vlan, Some(12));
        assert_eq!(packet.vlan_id(), Some(42));
        assert!(matches!(
            layers.network,
            Some(NetworkLayer::Ipv4 { offset: 18, .. })
        ));
    }

    #[test]
    fn test_runt_frame() {
        let packet = CaprelPacket {
            data: vec![0u8; 10],
            ts_sec: 0,
            ts_usec: 0,
            orig_len: 10,
        };
        assert!(packet.layers().is_none());
        assert!(packet.network_addrs().is_none());
        assert_eq!(packet.summary(), "frame len=10");
    }

    #[test]
    fn test_summary_contains_endpoints() {
        let packet: CaprelPacket = ipv4_tcp_packet("192.168.1.100", "10.0.0.1", 1234, 80, b"");
        let summary: String = packet.summary();
        assert!(summary.contains("192.168.1.100:1234"));
        assert!(summary.contains("10.0.0.1:80"));
        assert!(summary.contains("TCP"));
    }
}
