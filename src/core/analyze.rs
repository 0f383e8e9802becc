//! Capture analyzer
//!
//! Single forward pass over a capture file collecting the distinct
//! endpoints, ports, protocols, and VLAN identifiers present, plus the
//! timing extent. Used for rule-authoring feedback; the input file is
//! never modified.

use crate::capture::io::CaptureReader;
use crate::capture::{detect_format, CaptureError, CaptureFormat};
use crate::core::packet::{CaprelPacket, LayerOffsets, Protocol};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Packet ceilings for one analysis pass
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerLimits {
    /// Hard ceiling on packets examined
    pub max_packets: u64,
    /// Stricter ceiling that short-circuits with an explicit
    /// "analysis limited" flag
    pub performance_limit: u64,
}

impl Default for AnalyzerLimits {
    fn default() -> Self {
        Self {
            max_packets: 1_000_000,
            performance_limit: 100_000,
        }
    }
}

/// De-duplicated, sorted findings from one analysis pass
#[derive(Debug, Clone)]
pub struct CaptureAnalysis {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub file_format: CaptureFormat,
    pub packet_count: u64,
    pub network_addrs: Vec<String>,
    pub link_addrs: Vec<String>,
    pub ports: Vec<u16>,
    pub protocols: Vec<String>,
    pub vlan_ids: Vec<u16>,
    pub has_timestamps: bool,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Capture duration in seconds, from the timestamp extent
    pub duration_secs: f64,
    /// Mean captured data rate in bytes per second
    pub data_rate: f64,
    pub limited: bool,
    pub limit_reason: Option<String>,
}

/// Analyze a capture file in a single bounded pass
pub fn analyze(path: &Path, limits: &AnalyzerLimits) -> Result<CaptureAnalysis, CaptureError> {
    let file_format: CaptureFormat = detect_format(path)?;
    let file_size: u64 = std::fs::metadata(path)?.len();
    let mut reader: CaptureReader = CaptureReader::open(path)?;

    info!("starting capture analysis for {}", path.display());

    let mut network_addrs: BTreeSet<String> = BTreeSet::new();
    let mut link_addrs: BTreeSet<String> = BTreeSet::new();
    let mut ports: BTreeSet<u16> = BTreeSet::new();
    let mut protocols: BTreeSet<&'static str> = BTreeSet::new();
    let mut vlan_ids: BTreeSet<u16> = BTreeSet::new();

    let mut packet_count: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut first_ts: Option<(i64, u32)> = None;
    let mut last_ts: Option<(i64, u32)> = None;
    let mut limited: bool = false;
    let mut limit_reason: Option<String> = None;

    while let Some(item) = reader.next_packet() {
        let packet: CaprelPacket = match item {
            Ok(packet) => packet,
            Err(e) => return Err(e),
        };

        packet_count += 1;
        total_bytes += packet.data.len() as u64;
        if first_ts.is_none() {
            first_ts = Some((packet.ts_sec, packet.ts_usec));
        }
        last_ts = Some((packet.ts_sec, packet.ts_usec));

        if let Some((src, dst)) = packet.link_addrs() {
            link_addrs.insert(src.to_string());
            link_addrs.insert(dst.to_string());
        }
        if let Some(id) = packet.vlan_id() {
            vlan_ids.insert(id);
        }
        if let Some(layers) = packet.layers() {
            collect_protocols(&packet, &layers, &mut protocols);
        }
        if let Some((src, dst)) = packet.network_addrs() {
            network_addrs.insert(src.to_string());
            network_addrs.insert(dst.to_string());
        }
        if let Some((sport, dport)) = packet.transport_ports() {
            ports.insert(sport);
            ports.insert(dport);
        }

        if packet_count >= limits.performance_limit {
            warn!(
                "large capture detected, stopping analysis at {} packets",
                packet_count
            );
            limited = true;
            limit_reason = Some(format!(
                "analysis stopped at {} packets for performance reasons; the full file can still be rewritten and replayed",
                packet_count
            ));
            break;
        }
        if packet_count >= limits.max_packets {
            break;
        }
    }

    let (first_timestamp, last_timestamp) = (
        first_ts.map(|(s, us)| to_datetime(s, us)),
        last_ts.map(|(s, us)| to_datetime(s, us)),
    );
    let duration_secs: f64 = match (first_ts, last_ts) {
        (Some((fs, fu)), Some((ls, lu))) => {
            ((ls - fs) as f64) + (lu as f64 - fu as f64) / 1_000_000.0
        }
        _ => 0.0,
    };
    let data_rate: f64 = if duration_secs > 0.0 {
        total_bytes as f64 / duration_secs
    } else {
        0.0
    };

    info!(
        "capture analysis complete: {} packets, {:.2} seconds",
        packet_count, duration_secs
    );

    Ok(CaptureAnalysis {
        file_path: path.to_path_buf(),
        file_size,
        file_format,
        packet_count,
        network_addrs: network_addrs.into_iter().collect(),
        link_addrs: link_addrs.into_iter().collect(),
        ports: ports.into_iter().collect(),
        protocols: protocols.into_iter().map(str::to_string).collect(),
        vlan_ids: vlan_ids.into_iter().collect(),
        has_timestamps: packet_count > 0,
        first_timestamp,
        last_timestamp,
        duration_secs,
        data_rate,
        limited,
        limit_reason,
    })
}

fn collect_protocols(
    packet: &CaprelPacket,
    layers: &LayerOffsets,
    protocols: &mut BTreeSet<&'static str>,
) {
    use crate::core::packet::NetworkLayer;

    match layers.network {
        Some(NetworkLayer::Ipv4 { .. }) => {
            protocols.insert("IPv4");
        }
        Some(NetworkLayer::Ipv6 { .. }) => {
            protocols.insert("IPv6");
        }
        None => return,
    }
    match packet.protocol() {
        Some(Protocol::TCP) => {
            protocols.insert("TCP");
        }
        Some(Protocol::UDP) => {
            protocols.insert("UDP");
        }
        Some(Protocol::ICMP) => {
            protocols.insert("ICMP");
        }
        Some(Protocol::ICMPv6) => {
            protocols.insert("ICMPv6");
        }
        _ => {}
    }
}

fn to_datetime(sec: i64, usec: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, usec * 1000)
        .single()
        .unwrap_or_else(Utc::now)
}
