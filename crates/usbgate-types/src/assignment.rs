// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entitlement rules declared by frontend VMs
//!
//! An [`Assignment`] selects devices by backend, port and device-content
//! identifier, and carries the automation mode that decides what happens
//! when a matching device appears. Assignments are created and destroyed by
//! each frontend's own device management; the engine only reads them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, PortId, VmName};

/// What the engine may do on behalf of a matching rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentMode {
    /// The rule permits attachment but never triggers it.
    #[serde(rename = "manual")]
    Manual,
    /// Attach automatically when a matching device appears.
    #[serde(rename = "auto-attach")]
    AutoAttach,
    /// Ask for confirmation before every attachment, even without
    /// competing rules.
    #[serde(rename = "ask-to-attach")]
    AskToAttach,
}

/// One component of a device selector: an exact value or the `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Pattern {
    Any,
    Exact(String),
}

impl Pattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(expected) => expected == value,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Pattern::Exact(_))
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        if value == "*" {
            Pattern::Any
        } else {
            Pattern::Exact(value)
        }
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        match value {
            Pattern::Any => "*".to_string(),
            Pattern::Exact(s) => s,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(s) => f.write_str(s),
        }
    }
}

/// How specific a selector is; more specific rules shadow less specific ones
///
/// Ordering is derived from the tuple `(port_exact, id_exact)`, so
/// exact/exact > exact/any > any/exact > any/any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    pub port_exact: bool,
    pub id_exact: bool,
}

/// Selects the devices an assignment applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceSelector {
    /// Backend VM exposing the device.
    pub backend: Pattern,
    /// USB topology port on that backend.
    pub port: Pattern,
    /// Device-content identifier; `*` matches devices whose identifier
    /// could not be determined.
    pub device_id: Pattern,
}

impl DeviceSelector {
    pub fn matches(&self, backend: &VmName, port: &PortId, device_id: Option<&DeviceId>) -> bool {
        if !self.backend.matches(backend.as_str()) {
            return false;
        }
        if !self.port.matches(port.as_str()) {
            return false;
        }
        match (&self.device_id, device_id) {
            (Pattern::Any, _) => true,
            // an unknown identifier only matches the wildcard
            (Pattern::Exact(_), None) => false,
            (Pattern::Exact(expected), Some(id)) => expected == id.as_str(),
        }
    }

    pub fn matches_backend(&self, backend: &VmName) -> bool {
        self.backend.matches(backend.as_str())
    }

    pub fn specificity(&self) -> Specificity {
        Specificity {
            port_exact: self.port.is_exact(),
            id_exact: self.device_id.is_exact(),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.backend, self.port, self.device_id)
    }
}

/// An entitlement rule: frontend + selector + mode + opaque options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// The frontend VM that declared the rule.
    pub frontend: VmName,
    pub selector: DeviceSelector,
    pub mode: AssignmentMode,
    /// Per-attach options, opaque to the engine.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Assignment {
    /// Of two rules belonging to the same frontend, the one that should
    /// govern a device both of them match. Higher specificity wins; an
    /// equal-specificity tie is broken by selector order so the outcome is
    /// deterministic.
    pub fn shadows(&self, other: &Assignment) -> bool {
        match self.selector.specificity().cmp(&other.selector.specificity()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                (&self.selector.port, &self.selector.device_id)
                    < (&other.selector.port, &other.selector.device_id)
            }
        }
    }
}
