//! Typed view over a task's `type` + `parameters`.
//!
//! Tasks travel and persist as a type label plus a string map. Executors
//! decode them into a [`TaskKind`] so each kind gets typed parameters, while
//! unknown types still round-trip through [`TaskKind::Generic`].

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;

/// Parameter keys understood by port-forward tasks.
pub mod params {
    pub const DPORT: &str = "dport";
    pub const TO_DESTINATION_IP: &str = "to-destination-ip";
    pub const TO_DESTINATION_PORT: &str = "to-destination-port";
    pub const EXTERNAL_INTERFACE: &str = "external-interface";
    pub const SCRIPT: &str = "script";
}

/// Task type labels.
pub mod kinds {
    pub const PORT_FORWARD: &str = "port_forward";
    /// Older labels accepted for port-forward tasks.
    pub const PORT_FORWARD_ALIASES: &[&str] = &["iptables", "nat"];
    pub const SHELL: &str = "shell";
}

/// Interface used for MASQUERADE/FORWARD rules when a task does not name one.
pub const DEFAULT_EXTERNAL_INTERFACE: &str = "eth0";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskKindError {
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid value for '{key}': {value}")]
    InvalidParameter { key: &'static str, value: String },
}

/// Forward an external port to an internal host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardParams {
    pub dport: u16,
    pub to_destination_ip: IpAddr,
    pub to_destination_port: u16,
    pub external_interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    PortForward(PortForwardParams),
    Shell { script: String },
    /// Any type this build does not know how to execute.
    Generic {
        task_type: String,
        parameters: HashMap<String, String>,
    },
}

impl TaskKind {
    /// Decode a task's type label and parameter map.
    ///
    /// # Errors
    ///
    /// Returns [`TaskKindError`] when a known type is missing a required
    /// parameter or carries one that does not parse.
    pub fn decode(
        task_type: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<Self, TaskKindError> {
        let normalized = task_type.trim().to_ascii_lowercase();
        if normalized == kinds::PORT_FORWARD
            || kinds::PORT_FORWARD_ALIASES.contains(&normalized.as_str())
        {
            return PortForwardParams::from_parameters(parameters).map(TaskKind::PortForward);
        }
        if normalized == kinds::SHELL {
            let script = required(parameters, params::SCRIPT)?;
            return Ok(TaskKind::Shell {
                script: script.to_string(),
            });
        }
        Ok(TaskKind::Generic {
            task_type: task_type.to_string(),
            parameters: parameters.clone(),
        })
    }
}

impl PortForwardParams {
    /// # Errors
    ///
    /// Returns [`TaskKindError`] for missing keys, non-numeric ports, an
    /// unparseable destination address or a malformed interface name.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self, TaskKindError> {
        let dport = parse_port(parameters, params::DPORT)?;
        let to_destination_port = parse_port(parameters, params::TO_DESTINATION_PORT)?;
        let raw_ip = required(parameters, params::TO_DESTINATION_IP)?;
        let to_destination_ip =
            raw_ip
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| TaskKindError::InvalidParameter {
                    key: params::TO_DESTINATION_IP,
                    value: raw_ip.to_string(),
                })?;
        let external_interface = match parameters
            .get(params::EXTERNAL_INTERFACE)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
        {
            None => DEFAULT_EXTERNAL_INTERFACE.to_string(),
            Some(name) if is_interface_name(name) => name.to_string(),
            Some(name) => {
                return Err(TaskKindError::InvalidParameter {
                    key: params::EXTERNAL_INTERFACE,
                    value: name.to_string(),
                });
            }
        };

        Ok(Self {
            dport,
            to_destination_ip,
            to_destination_port,
            external_interface,
        })
    }
}

/// Linux interface names: at most 15 bytes, no whitespace or shell syntax.
#[must_use]
pub fn is_interface_name(name: &str) -> bool {
    (1..=15).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

fn required<'a>(
    parameters: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, TaskKindError> {
    parameters
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or(TaskKindError::MissingParameter(key))
}

fn parse_port(
    parameters: &HashMap<String, String>,
    key: &'static str,
) -> Result<u16, TaskKindError> {
    let raw = required(parameters, key)?;
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(TaskKindError::InvalidParameter {
            key,
            value: raw.to_string(),
        }),
    }
}
