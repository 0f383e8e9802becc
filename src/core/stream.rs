//! Capture stream processor
//!
//! This module drives the rewrite engine over a whole capture file in
//! constant memory, producing a rewritten capture plus aggregate
//! statistics, or a bounded preview of the transformation.

use crate::capture::io::{CaptureReader, CaptureWriter};
use crate::capture::CaptureError;
use crate::core::packet::CaprelPacket;
use crate::core::rewrite::{RewriteEngine, RewriteOutcome};
use crate::rules::RuleSet;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{info, warn};

/// Packets between coarse progress log lines
const PROGRESS_LOG_INTERVAL: u64 = 10_000;

/// Aggregate result of one streaming rewrite run
#[derive(Debug, Clone)]
pub struct ManipulationResult {
    pub packets_processed: u64,
    pub packets_modified: u64,
    /// Per-packet error strings, capped at the configured bound
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
}

impl ManipulationResult {
    fn begin() -> Self {
        Self {
            packets_processed: 0,
            packets_modified: 0,
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            success: false,
        }
    }

    fn push_error(&mut self, max_errors: usize, message: String) {
        if self.errors.len() < max_errors {
            self.errors.push(message);
        }
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.success = true;
    }
}

/// Before/after view of one previewed packet
#[derive(Debug, Clone)]
pub struct PreviewSample {
    pub packet_number: usize,
    pub original_summary: String,
    pub modified_summary: String,
    pub was_modified: bool,
    pub original_hex: String,
    pub modified_hex: String,
}

/// Hex characters shown per packet in a preview
const PREVIEW_HEX_CHARS: usize = 100;

/// Streams capture files through the rewrite engine
pub struct StreamProcessor {
    engine: RewriteEngine,
    max_errors: usize,
}

impl StreamProcessor {
    /// Create a stream processor with the given per-run error bound
    pub fn new(engine: RewriteEngine, max_errors: usize) -> Self {
        Self { engine, max_errors }
    }

    /// Rewrite `input` into `output`, applying `rules` to every packet.
    ///
    /// Packets stream one at a time; memory use is independent of the
    /// capture size. A packet that fails to rewrite is written
    /// unmodified and recorded in the error list; only an unreadable
    /// input stream aborts the run. The output file is flushed and
    /// closed on every exit path.
    pub fn rewrite_to_file(
        &self,
        input: &Path,
        output: &Path,
        rules: &RuleSet,
    ) -> Result<ManipulationResult, CaptureError> {
        let mut reader: CaptureReader = CaptureReader::open(input)?;
        let mut writer: CaptureWriter = CaptureWriter::create(output)?;
        let mut result: ManipulationResult = ManipulationResult::begin();

        info!(
            "starting capture rewrite: {} -> {}",
            input.display(),
            output.display()
        );

        while let Some(item) = reader.next_packet() {
            let packet: CaprelPacket = match item {
                Ok(packet) => packet,
                Err(e) => {
                    // The record stream itself is broken; the writer is
                    // flushed so everything processed so far survives.
                    let _ = writer.flush();
                    warn!("aborting rewrite after {} packets: {}", result.packets_processed, e);
                    return Err(e);
                }
            };

            let outcome: RewriteOutcome = self.engine.apply(&packet, rules);
            if let Some(warning) = &outcome.warning {
                result.push_error(
                    self.max_errors,
                    format!("packet {}: {}", result.packets_processed, warning),
                );
            }
            writer.write(&outcome.packet);
            result.packets_processed += 1;
            if outcome.modified {
                result.packets_modified += 1;
            }

            if result.packets_processed % PROGRESS_LOG_INTERVAL == 0 {
                info!("processed {} packets", result.packets_processed);
            }
        }

        writer.flush()?;
        result.finish();
        info!(
            "rewrite completed: {} packets processed, {} modified, {} errors",
            result.packets_processed,
            result.packets_modified,
            result.errors.len()
        );
        Ok(result)
    }

    /// Preview the transformation over at most `sample_size` packets.
    ///
    /// Reads the input only; no output file is produced.
    pub fn preview(
        &self,
        input: &Path,
        rules: &RuleSet,
        sample_size: usize,
    ) -> Result<Vec<PreviewSample>, CaptureError> {
        let mut reader: CaptureReader = CaptureReader::open(input)?;
        let mut samples: Vec<PreviewSample> = Vec::new();

        while samples.len() < sample_size {
            let packet: CaprelPacket = match reader.next_packet() {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => return Err(e),
                None => break,
            };

            let outcome: RewriteOutcome = self.engine.apply(&packet, rules);
            samples.push(PreviewSample {
                packet_number: samples.len() + 1,
                original_summary: packet.summary(),
                modified_summary: outcome.packet.summary(),
                was_modified: outcome.modified,
                original_hex: packet.hex_prefix(PREVIEW_HEX_CHARS),
                modified_hex: outcome.packet.hex_prefix(PREVIEW_HEX_CHARS),
            });
        }

        Ok(samples)
    }
}
