//! tcpreplay invocation building and request validation

use crate::replay::{ReplayError, ReplayRequest, SpeedUnit};

/// Operator-configurable bounds on replay speed
#[derive(Debug, Clone, Copy)]
pub struct ReplayLimits {
    /// Upper bound for `multiplier` speeds
    pub max_multiplier: f64,
    /// Upper bound for `pps` speeds
    pub max_pps: f64,
}

impl Default for ReplayLimits {
    fn default() -> Self {
        Self {
            max_multiplier: 100.0,
            max_pps: 1_000_000.0,
        }
    }
}

/// Validate a replay request against the configured limits.
///
/// Nothing is spawned on failure; the request is rejected whole.
pub fn validate_request(request: &ReplayRequest, limits: &ReplayLimits) -> Result<(), ReplayError> {
    if !request.speed.is_finite() || request.speed <= 0.0 {
        return Err(ReplayError::InvalidConfig(
            "speed must be greater than 0".to_string(),
        ));
    }
    match request.speed_unit {
        SpeedUnit::Pps => {
            if request.speed > limits.max_pps {
                return Err(ReplayError::InvalidConfig(format!(
                    "pps cannot exceed {}",
                    limits.max_pps as u64
                )));
            }
        }
        SpeedUnit::Multiplier => {
            if request.speed > limits.max_multiplier {
                return Err(ReplayError::InvalidConfig(format!(
                    "speed multiplier cannot exceed {}x",
                    limits.max_multiplier
                )));
            }
        }
    }

    let interface: &str = request.interface.trim();
    if interface.is_empty() {
        return Err(ReplayError::InvalidConfig(
            "network interface is required".to_string(),
        ));
    }
    if !interface
        .chars()
        .all(|c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ReplayError::InvalidConfig(format!(
            "invalid interface name: {}",
            interface
        )));
    }

    Ok(())
}

/// Build the tcpreplay argument vector for a request.
///
/// The two rate-control flags are mutually exclusive: `--pps` for
/// packet-rate mode, `--multiplier` (two decimals) for timing-multiple
/// mode. `--timer select` and `--quiet` are always passed, and the
/// capture file comes last.
pub fn build_args(request: &ReplayRequest) -> Vec<String> {
    let mut args: Vec<String> = vec!["-i".to_string(), request.interface.clone()];

    match request.speed_unit {
        SpeedUnit::Pps => {
            args.push("--pps".to_string());
            args.push(format!("{}", request.speed as u64));
        }
        SpeedUnit::Multiplier => {
            args.push("--multiplier".to_string());
            args.push(format!("{:.2}", request.speed));
        }
    }

    args.push("--timer".to_string());
    args.push("select".to_string());
    args.push("--quiet".to_string());
    args.push(request.file.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(speed: f64, unit: SpeedUnit, interface: &str) -> ReplayRequest {
        ReplayRequest {
            file: PathBuf::from("/data/session.pcap"),
            interface: interface.to_string(),
            speed,
            speed_unit: unit,
            continuous: false,
        }
    }

    #[test]
    fn test_multiplier_args() {
        let args: Vec<String> = build_args(&request(2.0, SpeedUnit::Multiplier, "eth0"));
        assert_eq!(
            args,
            vec![
                "-i",
                "eth0",
                "--multiplier",
                "2.00",
                "--timer",
                "select",
                "--quiet",
                "/data/session.pcap"
            ]
        );
    }

    #[test]
    fn test_pps_args() {
        let args: Vec<String> = build_args(&request(1500.0, SpeedUnit::Pps, "ens224"));
        assert_eq!(args[2], "--pps");
        assert_eq!(args[3], "1500");
        assert!(!args.contains(&"--multiplier".to_string()));
    }

    #[test]
    fn test_speed_bounds_per_unit() {
        let limits = ReplayLimits::default();
        assert!(validate_request(&request(0.0, SpeedUnit::Multiplier, "eth0"), &limits).is_err());
        assert!(validate_request(&request(101.0, SpeedUnit::Multiplier, "eth0"), &limits).is_err());
        assert!(validate_request(&request(101.0, SpeedUnit::Pps, "eth0"), &limits).is_ok());
        assert!(
            validate_request(&request(1_000_001.0, SpeedUnit::Pps, "eth0"), &limits).is_err()
        );
    }

    #[test]
    fn test_interface_name_charset() {
        let limits = ReplayLimits::default();
        assert!(validate_request(&request(1.0, SpeedUnit::Multiplier, "ens224"), &limits).is_ok());
        assert!(
            validate_request(&request(1.0, SpeedUnit::Multiplier, "vlan.100"), &limits).is_ok()
        );
        assert!(validate_request(&request(1.0, SpeedUnit::Multiplier, ""), &limits).is_err());
        assert!(
            validate_request(&request(1.0, SpeedUnit::Multiplier, "eth0; rm -rf"), &limits)
                .is_err()
        );
    }
}
