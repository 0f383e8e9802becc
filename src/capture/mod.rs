//! Capture file access module
//!
//! This module handles capture file admission (format detection by
//! magic bytes, basic replay suitability checks) and network interface
//! enumeration. The actual record decoding is delegated to libpcap via
//! the `pcap` crate; see [`io`].

pub mod io;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("unreadable capture: {0}")]
    UnreadableCapture(String),

    #[error("pcap error: {0}")]
    Pcap(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk capture container formats recognized by caprel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Legacy libpcap format (either byte order)
    Pcap,
    /// Next-generation capture format
    PcapNg,
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureFormat::Pcap => write!(f, "pcap"),
            CaptureFormat::PcapNg => write!(f, "pcapng"),
        }
    }
}

const PCAP_MAGIC_LE: [u8; 4] = [0xD4, 0xC3, 0xB2, 0xA1];
const PCAP_MAGIC_BE: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];
const PCAPNG_MAGIC: [u8; 4] = [0x0A, 0x0D, 0x0D, 0x0A];

/// Detect the capture container format from the file's magic bytes
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<CaptureFormat, CaptureError> {
    let path: &Path = path.as_ref();
    if !path.exists() {
        return Err(CaptureError::FileNotFound(path.to_path_buf()));
    }

    let mut magic = [0u8; 4];
    let mut file: File = File::open(path)?;
    file.read_exact(&mut magic).map_err(|_| {
        CaptureError::UnreadableCapture("file too short to carry a capture header".to_string())
    })?;

    match magic {
        PCAP_MAGIC_LE | PCAP_MAGIC_BE => Ok(CaptureFormat::Pcap),
        PCAPNG_MAGIC => Ok(CaptureFormat::PcapNg),
        _ => Err(CaptureError::UnreadableCapture(format!(
            "unrecognized magic bytes {:02x}{:02x}{:02x}{:02x}",
            magic[0], magic[1], magic[2], magic[3]
        ))),
    }
}

/// Threshold above which a capture is flagged as large for replay.
const LARGE_FILE_BYTES: u64 = 1024 * 1024 * 1024;

/// Check that a capture file is suitable for replay.
///
/// Hard failures (missing, empty, unrecognized, no readable packets)
/// are errors; soft concerns come back as warning strings.
pub fn validate_for_replay<P: AsRef<Path>>(path: P) -> Result<Vec<String>, CaptureError> {
    let path: &Path = path.as_ref();
    let mut warnings: Vec<String> = Vec::new();

    if !path.exists() {
        return Err(CaptureError::FileNotFound(path.to_path_buf()));
    }
    let size: u64 = std::fs::metadata(path)?.len();
    if size == 0 {
        return Err(CaptureError::UnreadableCapture("file is empty".to_string()));
    }
    if size > LARGE_FILE_BYTES {
        warnings.push("large file size may impact replay performance".to_string());
    }

    detect_format(path)?;

    let mut reader: io::CaptureReader = io::CaptureReader::open(path)?;
    let mut readable: usize = 0;
    while readable < 10 {
        match reader.next_packet() {
            Some(Ok(_)) => readable += 1,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    if readable == 0 {
        return Err(CaptureError::UnreadableCapture(
            "no readable packets found".to_string(),
        ));
    }

    Ok(warnings)
}

/// List the names of capture-capable network interfaces
pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    match pcap::Device::list() {
        Ok(devices) => Ok(devices.into_iter().map(|d: pcap::Device| d.name).collect()),
        Err(e) => Err(CaptureError::Interface(e.to_string())),
    }
}
