// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device identity types
//!
//! `VmName` and `PortId` are validated newtypes: constructing one from raw
//! bytes is the single place where untrusted identifiers from the backend's
//! key-value store are checked. Code holding a value of these types may rely
//! on the syntax invariant.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced when parsing identifiers from untrusted input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("VM name is empty")]
    EmptyVmName,
    #[error("VM name contains invalid characters")]
    InvalidVmName,
    #[error("port identifier does not match the USB topology syntax")]
    InvalidPort,
    #[error("identifier is not ASCII")]
    NotAscii,
}

/// A validated virtual machine name
///
/// Syntax: a letter followed by letters, digits, `_`, `.` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmName(String);

impl VmName {
    /// Validate a name read from a trusted configuration source.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        let mut chars = name.chars();
        match chars.next() {
            None => return Err(NameError::EmptyVmName),
            Some(c) if !c.is_ascii_alphabetic() => return Err(NameError::InvalidVmName),
            Some(_) => {}
        }
        if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            Ok(Self(name))
        } else {
            Err(NameError::InvalidVmName)
        }
    }

    /// Validate raw bytes read from an untrusted source (e.g. the
    /// `connected-to` field published by a backend VM).
    pub fn parse_untrusted(untrusted: &[u8]) -> Result<Self, NameError> {
        if !untrusted.is_ascii() {
            return Err(NameError::NotAscii);
        }
        let text = std::str::from_utf8(untrusted).map_err(|_| NameError::NotAscii)?;
        Self::new(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VmName> for String {
    fn from(value: VmName) -> Self {
        value.0
    }
}

/// A validated USB topology position on a backend VM
///
/// Canonical syntax is the key-value-store path segment itself:
/// digits, `-`, digits, optionally followed by `_`-separated digit groups
/// (e.g. `2-1_4`). The legacy `0x####_0x####` device-name form that older
/// backends publish is also accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortId(String);

impl PortId {
    pub fn new(port: impl Into<String>) -> Result<Self, NameError> {
        let port = port.into();
        if is_topology_path(&port) || is_legacy_device_name(&port) {
            Ok(Self(port))
        } else {
            Err(NameError::InvalidPort)
        }
    }

    /// Validate a path segment listed from an untrusted source.
    pub fn parse_untrusted(untrusted: &str) -> Result<Self, NameError> {
        Self::new(untrusted)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path segment under which the backend publishes this port.
    pub fn qdb_segment(&self) -> &str {
        &self.0
    }
}

/// `[0-9]+-[0-9]+(_[0-9]+)*`
fn is_topology_path(s: &str) -> bool {
    let Some((hub, rest)) = s.split_once('-') else {
        return false;
    };
    if hub.is_empty() || !hub.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let mut groups = rest.split('_');
    groups.all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()))
}

/// `0x\w{4}_0x\w{4}`
fn is_legacy_device_name(s: &str) -> bool {
    let Some((vendor, product)) = s.split_once('_') else {
        return false;
    };
    for part in [vendor, product] {
        let Some(hex) = part.strip_prefix("0x") else {
            return false;
        };
        if hex.len() != 4 || !hex.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return false;
        }
    }
    true
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PortId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PortId {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PortId> for String {
    fn from(value: PortId) -> Self {
        value.0
    }
}

/// Opaque device-content identifier (vendor/product/interface digest)
///
/// Only ever compared for equality against selector patterns; an unknown
/// identifier is represented as the absence of a `DeviceId`, which matches
/// wildcard selectors only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device's stable identity: the backend VM exposing it plus the port
///
/// A `Device` is a view over external state, not owned persistent state;
/// everything mutable about it (holder, description) is read fresh from the
/// backend's key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    backend: VmName,
    port: PortId,
}

impl Device {
    pub fn new(backend: VmName, port: PortId) -> Self {
        Self { backend, port }
    }

    pub fn backend(&self) -> &VmName {
        &self.backend
    }

    pub fn port(&self) -> &PortId {
        &self.port
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.port)
    }
}

/// Point-in-time mapping of one backend's ports to their holder VMs
///
/// Produced fresh on every reconciliation pass; never persisted. Entry
/// ordering is irrelevant.
pub type DeviceSnapshot = HashMap<PortId, Option<VmName>>;
