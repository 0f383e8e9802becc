//! Synthetic packet builders shared by the core unit tests.

use crate::core::packet::{CaprelPacket, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_VLAN};
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use std::net::{Ipv4Addr, Ipv6Addr};

const TEST_TS_SEC: i64 = 1_700_000_000;

fn ethernet_header(ethertype: u16) -> Vec<u8> {
    let mut data: Vec<u8> = Vec::new();
    data.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // dst
    data.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]); // src
    data.extend_from_slice(&ethertype.to_be_bytes());
    data
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let total_len: u16 = (20 + payload_len) as u16;
    let mut data: Vec<u8> = Vec::new();
    data.push(0x45);
    data.push(0x00);
    data.extend_from_slice(&total_len.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]); // id, flags/frag
    data.push(64); // ttl
    data.push(protocol);
    data.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
    data
}

fn finalize_ipv4(data: &mut [u8], ip_offset: usize) {
    let checksum: u16 = {
        let view: Ipv4Packet<'_> = Ipv4Packet::new(&data[ip_offset..]).unwrap();
        ipv4::checksum(&view)
    };
    let mut view: MutableIpv4Packet<'_> = MutableIpv4Packet::new(&mut data[ip_offset..]).unwrap();
    view.set_checksum(checksum);
}

/// Ethernet + IPv4 + TCP packet with valid checksums.
pub fn ipv4_tcp_packet(
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> CaprelPacket {
    let src: Ipv4Addr = src.parse().unwrap();
    let dst: Ipv4Addr = dst.parse().unwrap();

    let mut data: Vec<u8> = ethernet_header(ETHERTYPE_IPV4);
    data.extend_from_slice(&ipv4_header(src, dst, 6, 20 + payload.len()));
    data.extend_from_slice(&sport.to_be_bytes());
    data.extend_from_slice(&dport.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]); // seq, ack
    data.push(0x50); // data offset
    data.push(0x18); // PSH|ACK
    data.extend_from_slice(&0x0200u16.to_be_bytes()); // window
    data.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
    data.extend_from_slice(&[0x00, 0x00]); // urgent
    data.extend_from_slice(payload);

    finalize_ipv4(&mut data, 14);
    let checksum: u16 = {
        let view: TcpPacket<'_> = TcpPacket::new(&data[34..]).unwrap();
        tcp::ipv4_checksum(&view, &src, &dst)
    };
    let mut view: MutableTcpPacket<'_> = MutableTcpPacket::new(&mut data[34..]).unwrap();
    view.set_checksum(checksum);

    let len: u32 = data.len() as u32;
    CaprelPacket {
        data,
        ts_sec: TEST_TS_SEC,
        ts_usec: 0,
        orig_len: len,
    }
}

/// Ethernet + IPv4 + UDP packet with valid checksums.
pub fn ipv4_udp_packet(
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> CaprelPacket {
    let src: Ipv4Addr = src.parse().unwrap();
    let dst: Ipv4Addr = dst.parse().unwrap();

    let udp_len: u16 = (8 + payload.len()) as u16;
    let mut data: Vec<u8> = ethernet_header(ETHERTYPE_IPV4);
    data.extend_from_slice(&ipv4_header(src, dst, 17, 8 + payload.len()));
    data.extend_from_slice(&sport.to_be_bytes());
    data.extend_from_slice(&dport.to_be_bytes());
    data.extend_from_slice(&udp_len.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
    data.extend_from_slice(payload);

    finalize_ipv4(&mut data, 14);
    let checksum: u16 = {
        let view: UdpPacket<'_> = UdpPacket::new(&data[34..]).unwrap();
        udp::ipv4_checksum(&view, &src, &dst)
    };
    let mut view: MutableUdpPacket<'_> = MutableUdpPacket::new(&mut data[34..]).unwrap();
    view.set_checksum(checksum);

    let len: u32 = data.len() as u32;
    CaprelPacket {
        data,
        ts_sec: TEST_TS_SEC,
        ts_usec: 0,
        orig_len: len,
    }
}

/// Ethernet + IPv6 + UDP packet with a valid UDP checksum.
pub fn ipv6_udp_packet(
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> CaprelPacket {
    let src: Ipv6Addr = src.parse().unwrap();
    let dst: Ipv6Addr = dst.parse().unwrap();

    let udp_len: u16 = (8 + payload.len()) as u16;
    let mut data: Vec<u8> = ethernet_header(ETHERTYPE_IPV6);
    data.push(0x60);
    data.extend_from_slice(&[0x00, 0x00, 0x00]); // traffic class / flow label
    data.extend_from_slice(&udp_len.to_be_bytes());
    data.push(17); // next header: UDP
    data.push(64); // hop limit
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
    data.extend_from_slice(&sport.to_be_bytes());
    data.extend_from_slice(&dport.to_be_bytes());
    data.extend_from_slice(&udp_len.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
    data.extend_from_slice(payload);

    let checksum: u16 = {
        let view: UdpPacket<'_> = UdpPacket::new(&data[54..]).unwrap();
        udp::ipv6_checksum(&view, &src, &dst)
    };
    let mut view: MutableUdpPacket<'_> = MutableUdpPacket::new(&mut data[54..]).unwrap();
    view.set_checksum(checksum);

    let len: u32 = data.len() as u32;
    CaprelPacket {
        data,
        ts_sec: TEST_TS_SEC,
        ts_usec: 0,
        orig_len: len,
    }
}

/// IPv4 + TCP packet wrapped in a single 802.1Q tag.
pub fn vlan_tagged_packet(
    vlan_id: u16,
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
) -> CaprelPacket {
    let inner: CaprelPacket = ipv4_tcp_packet(src, dst, sport, dport, b"tagged");
    let mut data: Vec<u8> = Vec::with_capacity(inner.data.len() + 4);
    data.extend_from_slice(&inner.data[..12]);
    data.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    data.extend_from_slice(&(vlan_id & 0x0FFF).to_be_bytes());
    data.extend_from_slice(&inner.data[12..]);

    let len: u32 = data.len() as u32;
    CaprelPacket {
        data,
        ts_sec: TEST_TS_SEC,
        ts_usec: 0,
        orig_len: len,
    }
}
