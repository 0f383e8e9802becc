//! Capture record reading and writing
//!
//! Thin wrappers around libpcap's offline capture and savefile handles,
//! converting records to and from [`CaprelPacket`]. Readers and writers
//! close their underlying handles on drop, so every exit path of a
//! streaming run releases the files.

use crate::capture::CaptureError;
use crate::core::packet::CaprelPacket;
use pcap::{Capture, Linktype, Offline, Savefile};
use std::path::Path;

/// Streaming reader over an on-disk capture file
pub struct CaptureReader {
    capture: Capture<Offline>,
}

impl CaptureReader {
    /// Open a capture file for reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path: &Path = path.as_ref();
        if !path.exists() {
            return Err(CaptureError::FileNotFound(path.to_path_buf()));
        }
        let capture: Capture<Offline> = Capture::from_file(path)
            .map_err(|e: pcap::Error| CaptureError::UnreadableCapture(e.to_string()))?;
        Ok(Self { capture })
    }

    /// Read the next packet record.
    ///
    /// Returns `None` at end of file; a decode failure mid-stream is
    /// surfaced as an error.
    pub fn next_packet(&mut self) -> Option<Result<CaprelPacket, CaptureError>> {
        match self.capture.next_packet() {
            Ok(packet) => Some(Ok(CaprelPacket::from_capture(&packet))),
            Err(pcap::Error::NoMorePackets) => None,
            Err(e) => Some(Err(CaptureError::UnreadableCapture(e.to_string()))),
        }
    }
}

/// Streaming writer producing a legacy-format capture file
pub struct CaptureWriter {
    savefile: Savefile,
}

impl CaptureWriter {
    /// Create (or truncate) a capture file for writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let capture = Capture::dead(Linktype::ETHERNET)
            .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;
        let savefile: Savefile = capture
            .savefile(path)
            .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;
        Ok(Self { savefile })
    }

    /// Append one packet record
    pub fn write(&mut self, packet: &CaprelPacket) {
        let header: pcap::PacketHeader = packet.capture_header();
        self.savefile.write(&pcap::Packet::new(&header, &packet.data));
    }

    /// Flush buffered records to disk
    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.savefile
            .flush()
            .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))
    }
}
