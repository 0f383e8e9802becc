//! tcpreplay output parsing
//!
//! Best-effort extraction of progress figures from tcpreplay's text
//! output. The format is not a stable contract, so everything parsed
//! here is telemetry only; the child's exit code remains the
//! authoritative signal.

use regex::Regex;

/// Assumed replay duration used for the pre-summary progress estimate.
const ASSUMED_DURATION_SECS: f64 = 10.0;
/// The estimate never claims more than this before a summary arrives.
const ESTIMATE_CAP_PERCENT: f64 = 90.0;

/// Figures extracted from one line of utility output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub packets_sent: Option<u64>,
    pub bytes_sent: Option<u64>,
    pub elapsed_secs: Option<f64>,
    pub packets_per_second: Option<f64>,
    /// True when the line was the final summary
    pub is_summary: bool,
}

/// Parses the two recognized tcpreplay output line shapes
pub struct OutputParser {
    re_packets: Regex,
    re_bytes: Regex,
    re_elapsed: Regex,
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            re_packets: Regex::new(r"(\d+)\s+packets").unwrap(),
            re_bytes: Regex::new(r"\((\d+)\s+bytes\)").unwrap(),
            re_elapsed: Regex::new(r"sent in\s+([\d.]+)\s+seconds").unwrap(),
        }
    }

    /// Parse one output line.
    ///
    /// `Actual: N packets (M bytes) sent in S seconds` carries the
    /// final counters; `Rated: ... Bps, ..., P pps` carries a rate.
    /// Anything else yields `None`.
    pub fn parse_line(&self, line: &str) -> Option<ProgressSample> {
        if line.contains("Actual:")
            && line.contains("packets")
            && line.contains("bytes")
            && line.contains("sent in")
        {
            let mut sample = ProgressSample {
                is_summary: true,
                ..Default::default()
            };
            if let Some(captures) = self.re_packets.captures(line) {
                sample.packets_sent = captures[1].parse().ok();
            }
            if let Some(captures) = self.re_bytes.captures(line) {
                sample.bytes_sent = captures[1].parse().ok();
            }
            if let Some(captures) = self.re_elapsed.captures(line) {
                sample.elapsed_secs = captures[1].parse().ok();
            }
            return Some(sample);
        }

        if line.contains("Rated:") && line.contains("Bps") && line.contains("pps") {
            // The pps figure trails the comma-separated rate list.
            for part in line.split(',') {
                if part.contains("pps") {
                    if let Some(token) = part.trim().split_whitespace().next() {
                        if let Ok(pps) = token.parse::<f64>() {
                            return Some(ProgressSample {
                                packets_per_second: Some(pps),
                                ..Default::default()
                            });
                        }
                    }
                }
            }
        }

        None
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Heuristic progress estimate used before any summary line arrives.
///
/// A rough wall-clock guess against an assumed ceiling, capped so it
/// never reads as complete; a UI hint only, never a state input.
pub fn estimate_progress(elapsed_secs: f64) -> f64 {
    ((elapsed_secs / ASSUMED_DURATION_SECS) * 100.0).min(ESTIMATE_CAP_PERCENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary_line() {
        let parser = OutputParser::new();
        let sample: ProgressSample = parser
            .parse_line("Actual: 2809 packets (1588752 bytes) sent in 20.47 seconds")
            .unwrap();

        assert!(sample.is_summary);
        assert_eq!(sample.packets_sent, Some(2809));
        assert_eq!(sample.bytes_sent, Some(1588752));
        assert_eq!(sample.elapsed_secs, Some(20.47));
    }

    #[test]
    fn test_parse_rate_line() {
        let parser = OutputParser::new();
        let sample: ProgressSample = parser
            .parse_line("Rated: 77648.8 Bps, 0.62 Mbps, 137.25 pps")
            .unwrap();

        assert!(!sample.is_summary);
        assert_eq!(sample.packets_per_second, Some(137.25));
        assert_eq!(sample.packets_sent, None);
    }

    #[test]
    fn test_unrelated_lines_yield_nothing() {
        let parser = OutputParser::new();
        assert_eq!(parser.parse_line(""), None);
        assert_eq!(
            parser.parse_line("Statistics for network device: ens224"),
            None
        );
        assert_eq!(parser.parse_line("sending packets via eth0"), None);
        // A summary line missing one of its markers is not a summary.
        assert_eq!(parser.parse_line("Actual: 78 packets"), None);
    }

    #[test]
    fn test_estimate_capped_at_ninety() {
        assert!(estimate_progress(0.0) < 1.0);
        assert!((estimate_progress(5.0) - 50.0).abs() < f64::EPSILON);
        assert_eq!(estimate_progress(60.0), 90.0);
    }
}
