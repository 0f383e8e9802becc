//! Packet rewrite engine
//!
//! This module applies a validated rule set to one decoded packet at a
//! time: address, MAC and port mappings, VLAN operations, timestamp
//! shifts, and payload substitutions, with checksums recomputed where
//! the rewritten fields participate in them.

use crate::core::packet::{
    CaprelPacket, LayerOffsets, NetworkLayer, TransportLayer, ETHERNET_HEADER_LEN, ETHERTYPE_VLAN,
    VLAN_TAG_LEN,
};
use crate::rules::{PayloadReplacement, RuleSet, VlanOperation};
use aho_corasick::AhoCorasick;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::util::MacAddr;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
enum StageError {
    #[error("frame too short for {0} rewrite")]
    Truncated(&'static str),

    #[error("malformed {0} header")]
    Malformed(&'static str),
}

/// Result of applying a rule set to one packet
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    /// The rewritten packet, or the unmodified original on failure
    pub packet: CaprelPacket,
    /// Whether the serialized bytes differ from the input
    pub modified: bool,
    /// Set when rule application failed and the original was kept
    pub warning: Option<String>,
}

/// Applies validated rule sets to decoded packets.
///
/// Stateless; one engine can serve any number of sequential rewrite
/// runs. A failure while rewriting a single packet is contained: the
/// original packet is returned and the run continues.
pub struct RewriteEngine;

impl RewriteEngine {
    /// Create a new rewrite engine
    pub fn new() -> Self {
        Self
    }

    /// Apply `rules` to `packet`.
    ///
    /// Transform stages run in fixed order (addresses, MACs, ports,
    /// VLAN, timestamp, payload), each over the output of the previous
    /// stage. A stage whose layer is absent is a no-op for that packet.
    pub fn apply(&self, packet: &CaprelPacket, rules: &RuleSet) -> RewriteOutcome {
        let mut working: CaprelPacket = packet.clone();

        match apply_stages(&mut working, rules) {
            Ok(()) => {
                let modified: bool = working.data != packet.data;
                if working.data.len() != packet.data.len() {
                    // Keep the record's wire length consistent with the
                    // length change introduced by the rewrite.
                    let delta: i64 = working.data.len() as i64 - packet.data.len() as i64;
                    let adjusted: i64 = packet.orig_len as i64 + delta;
                    working.orig_len = adjusted.max(working.data.len() as i64) as u32;
                }
                RewriteOutcome {
                    packet: working,
                    modified,
                    warning: None,
                }
            }
            Err(e) => {
                warn!("error applying rules to packet: {}", e);
                RewriteOutcome {
                    packet: packet.clone(),
                    modified: false,
                    warning: Some(e.to_string()),
                }
            }
        }
    }
}

impl Default for RewriteEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_stages(packet: &mut CaprelPacket, rules: &RuleSet) -> Result<(), StageError> {
    if !rules.ip_mapping.is_empty() {
        apply_ip_mapping(packet, &rules.ip_mapping)?;
    }
    if !rules.mac_mapping.is_empty() {
        apply_mac_mapping(packet, &rules.mac_mapping);
    }
    if !rules.port_mapping.is_empty() {
        apply_port_mapping(packet, &rules.port_mapping)?;
    }
    if let Some(op) = rules.vlan {
        apply_vlan_operation(packet, op);
    }
    if let Some(shift) = rules.timestamp_shift {
        packet.ts_sec = packet.ts_sec.saturating_add(shift);
    }
    if !rules.payload_replacements.is_empty() {
        apply_payload_replacement(packet, &rules.payload_replacements)?;
    }
    Ok(())
}

fn apply_ip_mapping(
    packet: &mut CaprelPacket,
    mapping: &HashMap<IpAddr, IpAddr>,
) -> Result<(), StageError> {
    let Some(layers) = packet.layers() else {
        return Ok(());
    };

    match layers.network {
        Some(NetworkLayer::Ipv4 { offset, .. }) => {
            let d: &mut [u8] = &mut packet.data;
            let src = Ipv4Addr::new(d[offset + 12], d[offset + 13], d[offset + 14], d[offset + 15]);
            let dst = Ipv4Addr::new(d[offset + 16], d[offset + 17], d[offset + 18], d[offset + 19]);

            let mut changed: bool = false;
            if let Some(IpAddr::V4(new)) = mapping.get(&IpAddr::V4(src)) {
                d[offset + 12..offset + 16].copy_from_slice(&new.octets());
                changed = true;
            }
            if let Some(IpAddr::V4(new)) = mapping.get(&IpAddr::V4(dst)) {
                d[offset + 16..offset + 20].copy_from_slice(&new.octets());
                changed = true;
            }

            if changed {
                // The rewritten addresses participate in both the IPv4
                // header checksum and the transport pseudo-header.
                refresh_ipv4_header_checksum(&mut packet.data, &layers)?;
                refresh_transport_checksum(&mut packet.data, &layers)?;
            }
        }
        Some(NetworkLayer::Ipv6 { offset }) => {
            let d: &mut [u8] = &mut packet.data;
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&d[offset + 8..offset + 24]);
            dst.copy_from_slice(&d[offset + 24..offset + 40]);

            if let Some(IpAddr::V6(new)) = mapping.get(&IpAddr::V6(Ipv6Addr::from(src))) {
                d[offset + 8..offset + 24].copy_from_slice(&new.octets());
            }
            if let Some(IpAddr::V6(new)) = mapping.get(&IpAddr::V6(Ipv6Addr::from(dst))) {
                d[offset + 24..offset + 40].copy_from_slice(&new.octets());
            }
            // IPv6 has no header checksum to refresh.
        }
        None => {}
    }
    Ok(())
}

fn apply_mac_mapping(packet: &mut CaprelPacket, mapping: &HashMap<MacAddr, MacAddr>) {
    if packet.data.len() < ETHERNET_HEADER_LEN {
        return;
    }
    let Some((src, dst)) = packet.link_addrs() else {
        return;
    };

    if let Some(new) = mapping.get(&dst) {
        packet.data[0..6].copy_from_slice(&new.octets());
    }
    if let Some(new) = mapping.get(&src) {
        packet.data[6..12].copy_from_slice(&new.octets());
    }
}

fn apply_port_mapping(
    packet: &mut CaprelPacket,
    mapping: &HashMap<u16, u16>,
) -> Result<(), StageError> {
    let Some(layers) = packet.layers() else {
        return Ok(());
    };
    let offset: usize = match layers.transport {
        Some(TransportLayer::Tcp { offset, .. }) => offset,
        Some(TransportLayer::Udp { offset }) => offset,
        _ => return Ok(()),
    };

    let d: &mut [u8] = &mut packet.data;
    let sport: u16 = u16::from_be_bytes([d[offset], d[offset + 1]]);
    let dport: u16 = u16::from_be_bytes([d[offset + 2], d[offset + 3]]);

    let mut changed: bool = false;
    if let Some(new) = mapping.get(&sport) {
        d[offset..offset + 2].copy_from_slice(&new.to_be_bytes());
        changed = true;
    }
    if let Some(new) = mapping.get(&dport) {
        d[offset + 2..offset + 4].copy_from_slice(&new.to_be_bytes());
        changed = true;
    }

    if changed {
        refresh_transport_checksum(&mut packet.data, &layers)?;
    }
    Ok(())
}

fn apply_vlan_operation(packet: &mut CaprelPacket, op: VlanOperation) {
    let Some(layers) = packet.layers() else {
        return;
    };

    match op {
        VlanOperation::Add(id) => {
            // Only untagged frames gain a tag; a new frame is built so
            // the wrapping layer never aliases the original buffer.
            if layers.vlan.is_none() && packet.data.len() >= ETHERNET_HEADER_LEN {
                let mut tagged: Vec<u8> = Vec::with_capacity(packet.data.len() + VLAN_TAG_LEN);
                tagged.extend_from_slice(&packet.data[..12]);
                tagged.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
                tagged.extend_from_slice(&(id & 0x0FFF).to_be_bytes());
                tagged.extend_from_slice(&packet.data[12..]);
                packet.data = tagged;
            }
        }
        VlanOperation::Remove => {
            // Strip exactly the first tag; the link addresses stay in
            // place around the tag's payload.
            if let Some(offset) = layers.vlan {
                let mut stripped: Vec<u8> = Vec::with_capacity(packet.data.len() - VLAN_TAG_LEN);
                stripped.extend_from_slice(&packet.data[..offset]);
                stripped.extend_from_slice(&packet.data[offset + VLAN_TAG_LEN..]);
                packet.data = stripped;
            }
        }
        VlanOperation::Modify(id) => {
            if let Some(offset) = layers.vlan {
                let tci: u16 =
                    u16::from_be_bytes([packet.data[offset + 2], packet.data[offset + 3]]);
                let new_tci: u16 = (tci & 0xF000) | (id & 0x0FFF);
                packet.data[offset + 2..offset + 4].copy_from_slice(&new_tci.to_be_bytes());
            }
        }
    }
}

fn apply_payload_replacement(
    packet: &mut CaprelPacket,
    replacements: &[PayloadReplacement],
) -> Result<(), StageError> {
    let Some(layers) = packet.layers() else {
        return Ok(());
    };
    let Some(start) = layers.payload else {
        return Ok(());
    };
    let end: usize = ip_payload_end(&packet.data, &layers).max(start);

    let original: Vec<u8> = packet.data[start..end].to_vec();
    let mut payload: Vec<u8> = original.clone();
    for rule in replacements {
        let matcher: AhoCorasick = AhoCorasick::new([rule.search.as_slice()])
            .map_err(|_| StageError::Malformed("payload pattern"))?;
        payload = matcher.replace_all_bytes(&payload, &[rule.replace.as_slice()]);
    }
    if payload == original {
        return Ok(());
    }

    let delta: i64 = payload.len() as i64 - original.len() as i64;
    let mut rebuilt: Vec<u8> = Vec::with_capacity(packet.data.len() - original.len() + payload.len());
    rebuilt.extend_from_slice(&packet.data[..start]);
    rebuilt.extend_from_slice(&payload);
    rebuilt.extend_from_slice(&packet.data[end..]);
    packet.data = rebuilt;

    if delta != 0 {
        adjust_length_fields(&mut packet.data, &layers, delta)?;
        refresh_ipv4_header_checksum(&mut packet.data, &layers)?;
    }
    refresh_transport_checksum(&mut packet.data, &layers)?;
    Ok(())
}

/// End of the network-layer payload, bounded by the IP length field so
/// Ethernet trailer padding is never treated as payload.
fn ip_payload_end(data: &[u8], layers: &LayerOffsets) -> usize {
    match layers.network {
        Some(NetworkLayer::Ipv4 { offset, .. }) => {
            let total: usize = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            data.len().min(offset + total)
        }
        Some(NetworkLayer::Ipv6 { offset }) => {
            let payload_len: usize =
                u16::from_be_bytes([data[offset + 4], data[offset + 5]]) as usize;
            data.len().min(offset + 40 + payload_len)
        }
        None => data.len(),
    }
}

fn adjust_length_fields(
    data: &mut [u8],
    layers: &LayerOffsets,
    delta: i64,
) -> Result<(), StageError> {
    match layers.network {
        Some(NetworkLayer::Ipv4 { offset, .. }) => {
            let total: i64 = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as i64;
            let new_total: i64 = total + delta;
            if !(0..=65535).contains(&new_total) {
                return Err(StageError::Malformed("IPv4 total length"));
            }
            data[offset + 2..offset + 4].copy_from_slice(&(new_total as u16).to_be_bytes());
        }
        Some(NetworkLayer::Ipv6 { offset }) => {
            let len: i64 = u16::from_be_bytes([data[offset + 4], data[offset + 5]]) as i64;
            let new_len: i64 = len + delta;
            if !(0..=65535).contains(&new_len) {
                return Err(StageError::Malformed("IPv6 payload length"));
            }
            data[offset + 4..offset + 6].copy_from_slice(&(new_len as u16).to_be_bytes());
        }
        None => {}
    }

    if let Some(TransportLayer::Udp { offset }) = layers.transport {
        let len: i64 = u16::from_be_bytes([data[offset + 4], data[offset + 5]]) as i64;
        let new_len: i64 = len + delta;
        if !(0..=65535).contains(&new_len) {
            return Err(StageError::Malformed("UDP length"));
        }
        data[offset + 4..offset + 6].copy_from_slice(&(new_len as u16).to_be_bytes());
    }
    Ok(())
}

fn refresh_ipv4_header_checksum(data: &mut [u8], layers: &LayerOffsets) -> Result<(), StageError> {
    let Some(NetworkLayer::Ipv4 { offset, header_len }) = layers.network else {
        return Ok(());
    };
    if data.len() < offset + header_len {
        return Err(StageError::Truncated("IPv4"));
    }
    let checksum: u16 = {
        let view: Ipv4Packet<'_> = Ipv4Packet::new(&data[offset..offset + header_len])
            .ok_or(StageError::Malformed("IPv4"))?;
        ipv4::checksum(&view)
    };
    let mut view: MutableIpv4Packet<'_> = MutableIpv4Packet::new(&mut data[offset..offset + header_len])
        .ok_or(StageError::Malformed("IPv4"))?;
    view.set_checksum(checksum);
    Ok(())
}

/// Recompute the TCP or UDP checksum against the current addresses and
/// segment bytes. Other transports carry no pseudo-header checksum that
/// the rewrite stages maintain.
fn refresh_transport_checksum(data: &mut [u8], layers: &LayerOffsets) -> Result<(), StageError> {
    let Some(network) = layers.network else {
        return Ok(());
    };
    let transport = match layers.transport {
        Some(t @ (TransportLayer::Tcp { .. } | TransportLayer::Udp { .. })) => t,
        _ => return Ok(()),
    };
    let segment_end: usize = ip_payload_end(data, layers);

    match network {
        NetworkLayer::Ipv4 { offset, .. } => {
            let src = Ipv4Addr::new(data[offset + 12], data[offset + 13], data[offset + 14], data[offset + 15]);
            let dst = Ipv4Addr::new(data[offset + 16], data[offset + 17], data[offset + 18], data[offset + 19]);
            match transport {
                TransportLayer::Tcp { offset: toff, .. } => {
                    let checksum: u16 = {
                        let view: TcpPacket<'_> = TcpPacket::new(&data[toff..segment_end])
                            .ok_or(StageError::Truncated("TCP"))?;
                        tcp::ipv4_checksum(&view, &src, &dst)
                    };
                    let mut view: MutableTcpPacket<'_> =
                        MutableTcpPacket::new(&mut data[toff..segment_end])
                            .ok_or(StageError::Truncated("TCP"))?;
                    view.set_checksum(checksum);
                }
                TransportLayer::Udp { offset: toff } => {
                    let checksum: u16 = {
                        let view: UdpPacket<'_> = UdpPacket::new(&data[toff..segment_end])
                            .ok_or(StageError::Truncated("UDP"))?;
                        udp::ipv4_checksum(&view, &src, &dst)
                    };
                    let mut view: MutableUdpPacket<'_> =
                        MutableUdpPacket::new(&mut data[toff..segment_end])
                            .ok_or(StageError::Truncated("UDP"))?;
                    view.set_checksum(checksum);
                }
                _ => {}
            }
        }
        NetworkLayer::Ipv6 { offset } => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&data[offset + 8..offset + 24]);
            dst.copy_from_slice(&data[offset + 24..offset + 40]);
            let src: Ipv6Addr = Ipv6Addr::from(src);
            let dst: Ipv6Addr = Ipv6Addr::from(dst);
            match transport {
                TransportLayer::Tcp { offset: toff, .. } => {
                    let checksum: u16 = {
                        let view: TcpPacket<'_> = TcpPacket::new(&data[toff..segment_end])
                            .ok_or(StageError::Truncated("TCP"))?;
                        tcp::ipv6_checksum(&view, &src, &dst)
                    };
                    let mut view: MutableTcpPacket<'_> =
                        MutableTcpPacket::new(&mut data[toff..segment_end])
                            .ok_or(StageError::Truncated("TCP"))?;
                    view.set_checksum(checksum);
                }
                TransportLayer::Udp { offset: toff } => {
                    let checksum: u16 = {
                        let view: UdpPacket<'_> = UdpPacket::new(&data[toff..segment_end])
                            .ok_or(StageError::Truncated("UDP"))?;
                        udp::ipv6_checksum(&view, &src, &dst)
                    };
                    let mut view: MutableUdpPacket<'_> =
                        MutableUdpPacket::new(&mut data[toff..segment_end])
                            .ok_or(StageError::Truncated("UDP"))?;
                    view.set_checksum(checksum);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::{
        ipv4_tcp_packet, ipv4_udp_packet, ipv6_udp_packet, vlan_tagged_packet,
    };
    use crate::rules::RuleSpec;

    fn rules_from_json(json: &str) -> RuleSet {
        RuleSpec::from_json(json).unwrap().validate().unwrap()
    }

    fn tcp_checksum_bytes(packet: &CaprelPacket) -> [u8; 2] {
        let layers: LayerOffsets = packet.layers().unwrap();
        match layers.transport.unwrap() {
            TransportLayer::Tcp { offset, .. } => {
                [packet.data[offset + 16], packet.data[offset + 17]]
            }
            _ => panic!("not a TCP packet"),
        }
    }

    fn udp_checksum_bytes(packet: &CaprelPacket) -> [u8; 2] {
        let layers: LayerOffsets = packet.layers().unwrap();
        match layers.transport.unwrap() {
            TransportLayer::Udp { offset } => [packet.data[offset + 6], packet.data[offset + 7]],
            _ => panic!("not a UDP packet"),
        }
    }

    #[test]
    fn test_ip_mapping_rewrites_source_and_checksums() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("192.168.1.100", "10.0.0.1", 1234, 80, b"data");
        let rules: RuleSet = rules_from_json(r#"{"ip_mapping": {"192.168.1.100": "10.0.0.100"}}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert!(outcome.modified);
        assert!(outcome.warning.is_none());

        let (src, dst) = outcome.packet.network_addrs().unwrap();
        assert_eq!(src.to_string(), "10.0.0.100");
        assert_eq!(dst.to_string(), "10.0.0.1");
        assert_ne!(
            tcp_checksum_bytes(&packet),
            tcp_checksum_bytes(&outcome.packet)
        );
    }

    #[test]
    fn test_ip_mapping_rewrites_both_directions_independently() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_udp_packet("10.1.1.1", "10.2.2.2", 1000, 2000, b"x");
        let rules: RuleSet =
            rules_from_json(r#"{"ip_mapping": {"10.1.1.1": "10.9.9.9", "10.2.2.2": "10.8.8.8"}}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        let (src, dst) = outcome.packet.network_addrs().unwrap();
        assert_eq!(src.to_string(), "10.9.9.9");
        assert_eq!(dst.to_string(), "10.8.8.8");
    }

    #[test]
    fn test_ipv6_mapping_leaves_transport_checksum_alone() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv6_udp_packet("2001:db8::1", "2001:db8::2", 40000, 53, b"q");
        let rules: RuleSet = rules_from_json(r#"{"ip_mapping": {"2001:db8::1": "2001:db8::aa"}}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        let (src, _) = outcome.packet.network_addrs().unwrap();
        assert_eq!(src.to_string(), "2001:db8::aa");
        // Only the IPv4 path recomputes transport checksums.
        assert_eq!(
            udp_checksum_bytes(&packet),
            udp_checksum_bytes(&outcome.packet)
        );
    }

    #[test]
    fn test_mac_mapping() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 10, 20, b"");
        let rules: RuleSet = rules_from_json(
            r#"{"mac_mapping": {"66:77:88:99:aa:bb": "de:ad:be:ef:00:01"}}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        let (src, dst) = outcome.packet.link_addrs().unwrap();
        assert_eq!(src.to_string(), "de:ad:be:ef:00:01");
        assert_eq!(dst.to_string(), "00:11:22:33:44:55");
        assert!(outcome.modified);
    }

    #[test]
    fn test_port_mapping_destination() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 50000, 8080, b"req");
        let rules: RuleSet = rules_from_json(r#"{"port_mapping": {"8080": 80}}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.transport_ports(), Some((50000, 80)));
        assert_ne!(
            tcp_checksum_bytes(&packet),
            tcp_checksum_bytes(&outcome.packet)
        );
    }

    #[test]
    fn test_port_mapping_applies_to_udp_too() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_udp_packet("1.1.1.1", "2.2.2.2", 8080, 53, b"");
        let rules: RuleSet = rules_from_json(r#"{"port_mapping": {"8080": 80}}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.transport_ports(), Some((80, 53)));
    }

    #[test]
    fn test_noop_when_nothing_matches() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 10, 20, b"payload");
        let rules: RuleSet = rules_from_json(
            r#"{
                "ip_mapping": {"9.9.9.9": "8.8.8.8"},
                "mac_mapping": {"02:00:00:00:00:01": "02:00:00:00:00:02"},
                "port_mapping": {"12345": 54321}
            }"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert!(!outcome.modified);
        assert_eq!(outcome.packet.data, packet.data);
    }

    #[test]
    fn test_apply_is_deterministic() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("192.168.1.100", "10.0.0.1", 1234, 8080, b"abc");
        let rules: RuleSet = rules_from_json(
            r#"{
                "ip_mapping": {"192.168.1.100": "10.0.0.100"},
                "port_mapping": {"8080": 80},
                "vlan_operations": {"add_vlan": 7}
            }"#,
        );

        let first: RewriteOutcome = engine.apply(&packet, &rules);
        let second: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(first.packet.data, second.packet.data);
    }

    #[test]
    fn test_vlan_add_only_when_untagged() {
        let engine = RewriteEngine::new();
        let rules: RuleSet = rules_from_json(r#"{"vlan_operations": {"add_vlan": 100}}"#);

        let untagged: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 1, 2, b"p");
        let outcome: RewriteOutcome = engine.apply(&untagged, &rules);
        assert_eq!(outcome.packet.vlan_id(), Some(100));
        assert_eq!(outcome.packet.data.len(), untagged.data.len() + VLAN_TAG_LEN);
        // Link addresses survive the re-framing.
        assert_eq!(outcome.packet.link_addrs(), untagged.link_addrs());

        let tagged: CaprelPacket = vlan_tagged_packet(55, "1.1.1.1", "2.2.2.2", 1, 2);
        let outcome: RewriteOutcome = engine.apply(&tagged, &rules);
        assert_eq!(outcome.packet.vlan_id(), Some(55));
        assert!(!outcome.modified);
    }

    #[test]
    fn test_vlan_remove_after_add_roundtrips() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("192.168.1.1", "192.168.1.2", 1111, 2222, b"rt");

        let add: RuleSet = rules_from_json(r#"{"vlan_operations": {"add_vlan": 300}}"#);
        let remove: RuleSet = rules_from_json(r#"{"vlan_operations": {"remove_vlan": true}}"#);

        let tagged: RewriteOutcome = engine.apply(&packet, &add);
        let restored: RewriteOutcome = engine.apply(&tagged.packet, &remove);
        assert_eq!(restored.packet.data, packet.data);
    }

    #[test]
    fn test_vlan_modify_keeps_priority_bits() {
        let engine = RewriteEngine::new();
        let mut packet: CaprelPacket = vlan_tagged_packet(100, "1.1.1.1", "2.2.2.2", 1, 2);
        // Set PCP 5 on the existing tag.
        packet.data[14] |= 0xA0;

        let rules: RuleSet = rules_from_json(r#"{"vlan_operations": {"modify_vlan": 200}}"#);
        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.vlan_id(), Some(200));
        assert_eq!(outcome.packet.data[14] & 0xF0, 0xA0);
    }

    #[test]
    fn test_timestamp_shift_does_not_count_as_modified() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 1, 2, b"t");
        let rules: RuleSet = rules_from_json(r#"{"timestamp_shift": -7200}"#);

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.ts_sec, packet.ts_sec - 7200);
        assert!(!outcome.modified);
        assert_eq!(outcome.packet.data, packet.data);
    }

    #[test]
    fn test_payload_replacement_same_length() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket =
            ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 1, 2, b"GET /old HTTP/1.1");
        let rules: RuleSet = rules_from_json(
            r#"{"payload_replacement": [{"search": "/old", "replace": "/new"}]}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert!(outcome.modified);
        assert_eq!(outcome.packet.payload().unwrap(), b"GET /new HTTP/1.1");
        assert_ne!(
            tcp_checksum_bytes(&packet),
            tcp_checksum_bytes(&outcome.packet)
        );
    }

    #[test]
    fn test_payload_replacement_length_change_fixes_lengths() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_udp_packet("1.1.1.1", "2.2.2.2", 1, 2, b"host=alpha");
        let rules: RuleSet = rules_from_json(
            r#"{"payload_replacement": [{"search": "alpha", "replace": "omega-prime"}]}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.payload().unwrap(), b"host=omega-prime");

        let layers: LayerOffsets = outcome.packet.layers().unwrap();
        let Some(NetworkLayer::Ipv4 { offset, .. }) = layers.network else {
            panic!("expected IPv4");
        };
        let total: u16 =
            u16::from_be_bytes([outcome.packet.data[offset + 2], outcome.packet.data[offset + 3]]);
        assert_eq!(total as usize, outcome.packet.data.len() - 14);
        let Some(TransportLayer::Udp { offset: toff }) = layers.transport else {
            panic!("expected UDP");
        };
        let udp_len: u16 =
            u16::from_be_bytes([outcome.packet.data[toff + 4], outcome.packet.data[toff + 5]]);
        assert_eq!(udp_len as usize, 8 + b"host=omega-prime".len());
        assert_eq!(outcome.packet.orig_len as usize, outcome.packet.data.len());
    }

    #[test]
    fn test_payload_replacements_apply_in_order() {
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("1.1.1.1", "2.2.2.2", 1, 2, b"aaa");
        let rules: RuleSet = rules_from_json(
            r#"{"payload_replacement": [
                {"search": "aaa", "replace": "bbb"},
                {"search": "bbb", "replace": "ccc"}
            ]}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert_eq!(outcome.packet.payload().unwrap(), b"ccc");
    }

    #[test]
    fn test_stage_ordering_port_map_sees_mapped_address() {
        // The port stage runs after the address stage: the checksum it
        // writes must be valid for the rewritten addresses.
        let engine = RewriteEngine::new();
        let packet: CaprelPacket = ipv4_tcp_packet("192.168.1.100", "10.0.0.1", 1234, 8080, b"d");
        let rules: RuleSet = rules_from_json(
            r#"{"ip_mapping": {"192.168.1.100": "172.16.0.1"}, "port_mapping": {"8080": 80}}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        let expected: CaprelPacket =
            ipv4_tcp_packet("172.16.0.1", "10.0.0.1", 1234, 80, b"d");
        assert_eq!(outcome.packet.data, expected.data);
    }

    #[test]
    fn test_transform_on_absent_layer_is_noop() {
        let engine = RewriteEngine::new();
        // ARP-sized frame: Ethernet header with a non-IP EtherType.
        let mut data: Vec<u8> = vec![0u8; 42];
        data[12] = 0x08;
        data[13] = 0x06;
        let packet = CaprelPacket {
            data,
            ts_sec: 0,
            ts_usec: 0,
            orig_len: 42,
        };
        let rules: RuleSet = rules_from_json(
            r#"{"ip_mapping": {"1.1.1.1": "2.2.2.2"}, "port_mapping": {"80": 81}}"#,
        );

        let outcome: RewriteOutcome = engine.apply(&packet, &rules);
        assert!(!outcome.modified);
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.packet.data, packet.data);
    }
}
