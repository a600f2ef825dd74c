// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Snapshot diffing
//!
//! [`SnapshotDelta::between`] is a pure function of two snapshots; the
//! reconciliation pass feeds it the cached and the freshly read snapshot
//! and dispatches events from the result.

use std::collections::{BTreeMap, BTreeSet};

use usbgate_types::{DeviceSnapshot, PortId, VmName};

/// What changed between two snapshots of the same backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    /// Ports that appeared.
    pub added: BTreeSet<PortId>,
    /// Ports that disappeared.
    pub removed: BTreeSet<PortId>,
    /// Ports whose holder appeared or changed, with the new holder.
    pub attached: BTreeMap<PortId, VmName>,
    /// Ports whose holder vanished or changed, with the old holder.
    pub detached: BTreeMap<PortId, VmName>,
}

impl SnapshotDelta {
    pub fn between(previous: &DeviceSnapshot, current: &DeviceSnapshot) -> Self {
        let mut delta = Self::default();

        for (port, holder) in current {
            match previous.get(port) {
                None => {
                    delta.added.insert(port.clone());
                    // a device can appear already held
                    if let Some(front) = holder {
                        delta.attached.insert(port.clone(), front.clone());
                    }
                }
                Some(cached) if cached != holder => {
                    if let Some(old) = cached {
                        delta.detached.insert(port.clone(), old.clone());
                    }
                    if let Some(new) = holder {
                        delta.attached.insert(port.clone(), new.clone());
                    }
                }
                Some(_) => {}
            }
        }

        for (port, cached) in previous {
            if !current.contains_key(port) {
                delta.removed.insert(port.clone());
                // pulling out an attached device detaches it
                if let Some(old) = cached {
                    delta.detached.insert(port.clone(), old.clone());
                }
            }
        }

        delta
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.attached.is_empty()
            && self.detached.is_empty()
    }
}
