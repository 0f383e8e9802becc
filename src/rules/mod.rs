//! Rules module for caprel
//!
//! This module handles validation of untrusted rewrite rule
//! specifications into the immutable rule set applied by the rewrite
//! engine.

use pnet::util::MacAddr;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid {kind} rule: {value}")]
    InvalidRule { kind: &'static str, value: String },

    #[error("failed to parse rule file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("failed to read rule file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Untrusted rule specification as submitted by the operator.
///
/// Deserialized from JSON; unknown top-level keys are ignored so newer
/// rule kinds do not break older builds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub ip_mapping: HashMap<String, String>,
    #[serde(default)]
    pub mac_mapping: HashMap<String, String>,
    #[serde(default)]
    pub port_mapping: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub vlan_operations: Option<VlanSpec>,
    #[serde(default)]
    pub timestamp_shift: Option<i64>,
    #[serde(default)]
    pub payload_replacement: Vec<PayloadRuleSpec>,
}

/// Requested VLAN manipulation; at most one of the three takes effect,
/// in add / remove / modify priority order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VlanSpec {
    #[serde(default)]
    pub add_vlan: Option<u16>,
    #[serde(default)]
    pub remove_vlan: Option<bool>,
    #[serde(default)]
    pub modify_vlan: Option<u16>,
}

/// One payload substitution; search and replace are UTF-8 byte strings.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadRuleSpec {
    pub search: String,
    pub replace: String,
}

/// A single VLAN operation, already validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanOperation {
    /// Insert a tag with this identifier if the frame is untagged
    Add(u16),
    /// Strip the first tag if one is present
    Remove,
    /// Rewrite the identifier of the first tag in place
    Modify(u16),
}

/// One validated payload substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadReplacement {
    pub search: Vec<u8>,
    pub replace: Vec<u8>,
}

/// Validated, immutable description of the requested transformations.
///
/// Only obtainable through [`RuleSpec::validate`], which accepts or
/// rejects the whole specification atomically.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub ip_mapping: HashMap<IpAddr, IpAddr>,
    pub mac_mapping: HashMap<MacAddr, MacAddr>,
    pub port_mapping: HashMap<u16, u16>,
    pub vlan: Option<VlanOperation>,
    pub timestamp_shift: Option<i64>,
    pub payload_replacements: Vec<PayloadReplacement>,
}

impl RuleSet {
    /// True when no transformation is requested at all
    pub fn is_empty(&self) -> bool {
        self.ip_mapping.is_empty()
            && self.mac_mapping.is_empty()
            && self.port_mapping.is_empty()
            && self.vlan.is_none()
            && self.timestamp_shift.is_none()
            && self.payload_replacements.is_empty()
    }
}

impl RuleSpec {
    /// Load a rule specification from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RuleError> {
        let content: String = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a rule specification from a JSON string
    pub fn from_json(content: &str) -> Result<Self, RuleError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate the whole specification into an immutable [`RuleSet`].
    ///
    /// Validation is total and side-effect-free: either every rule is
    /// accepted, or the first offending kind/value is reported and
    /// nothing is applied.
    pub fn validate(&self) -> Result<RuleSet, RuleError> {
        let mut rule_set = RuleSet::default();

        for (from, to) in &self.ip_mapping {
            let from_addr: IpAddr = parse_ip("ip_mapping", from)?;
            let to_addr: IpAddr = parse_ip("ip_mapping", to)?;
            if from_addr.is_ipv4() != to_addr.is_ipv4() {
                return Err(RuleError::InvalidRule {
                    kind: "ip_mapping",
                    value: format!("{} -> {} (address family mismatch)", from, to),
                });
            }
            rule_set.ip_mapping.insert(from_addr, to_addr);
        }

        let mac_form: Regex =
            Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").unwrap();
        for (from, to) in &self.mac_mapping {
            let from_addr: MacAddr = parse_mac(&mac_form, from)?;
            let to_addr: MacAddr = parse_mac(&mac_form, to)?;
            rule_set.mac_mapping.insert(from_addr, to_addr);
        }

        for (from, to) in &self.port_mapping {
            let from_port: u16 = parse_port(from)?;
            let to_port: u16 = parse_port_value(to)?;
            rule_set.port_mapping.insert(from_port, to_port);
        }

        if let Some(vlan) = &self.vlan_operations {
            rule_set.vlan = validate_vlan(vlan)?;
        }

        rule_set.timestamp_shift = self.timestamp_shift;

        for rule in &self.payload_replacement {
            if rule.search.is_empty() {
                return Err(RuleError::InvalidRule {
                    kind: "payload_replacement",
                    value: "empty search pattern".to_string(),
                });
            }
            rule_set.payload_replacements.push(PayloadReplacement {
                search: rule.search.as_bytes().to_vec(),
                replace: rule.replace.as_bytes().to_vec(),
            });
        }

        Ok(rule_set)
    }
}

fn parse_ip(kind: &'static str, value: &str) -> Result<IpAddr, RuleError> {
    value.parse().map_err(|_| RuleError::InvalidRule {
        kind,
        value: value.to_string(),
    })
}

fn parse_mac(form: &Regex, value: &str) -> Result<MacAddr, RuleError> {
    if !form.is_match(value) {
        return Err(RuleError::InvalidRule {
            kind: "mac_mapping",
            value: value.to_string(),
        });
    }
    // Hyphen-separated form is normalized; MacAddr only parses colons.
    value
        .replace('-', ":")
        .parse()
        .map_err(|_| RuleError::InvalidRule {
            kind: "mac_mapping",
            value: value.to_string(),
        })
}

fn parse_port(value: &str) -> Result<u16, RuleError> {
    match value.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(RuleError::InvalidRule {
            kind: "port_mapping",
            value: value.to_string(),
        }),
    }
}

fn parse_port_value(value: &serde_json::Value) -> Result<u16, RuleError> {
    match value {
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(port) if (1..=65535).contains(&port) => Ok(port as u16),
            _ => Err(RuleError::InvalidRule {
                kind: "port_mapping",
                value: n.to_string(),
            }),
        },
        serde_json::Value::String(s) => parse_port(s),
        other => Err(RuleError::InvalidRule {
            kind: "port_mapping",
            value: other.to_string(),
        }),
    }
}

fn validate_vlan(spec: &VlanSpec) -> Result<Option<VlanOperation>, RuleError> {
    // Add wins over remove wins over modify when several are present.
    if let Some(id) = spec.add_vlan {
        return Ok(Some(VlanOperation::Add(check_vlan_id(id)?)));
    }
    if spec.remove_vlan.unwrap_or(false) {
        return Ok(Some(VlanOperation::Remove));
    }
    if let Some(id) = spec.modify_vlan {
        return Ok(Some(VlanOperation::Modify(check_vlan_id(id)?)));
    }
    Ok(None)
}

fn check_vlan_id(id: u16) -> Result<u16, RuleError> {
    // VID 0 and 4095 are reserved by 802.1Q.
    if (1..=4094).contains(&id) {
        Ok(id)
    } else {
        Err(RuleError::InvalidRule {
            kind: "vlan_operations",
            value: id.to_string(),
        })
    }
}
