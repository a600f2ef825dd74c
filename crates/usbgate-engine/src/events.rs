// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed engine messages
//!
//! [`EngineNotification`] is what drives the engine (delivered by whatever
//! owns the watch registrations and the domain lifecycle hooks);
//! [`DeviceEvent`] is what the engine publishes to downstream listeners.
//! Each variant carries exactly the payload its handler needs.

use serde::{Deserialize, Serialize};

use usbgate_types::{Device, VmName};

/// Inbound notifications the engine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    /// A backend VM is being defined/initialized but is not running yet;
    /// start tracking it with an empty snapshot.
    BackendInitializing { backend: VmName },
    /// A backend VM (re)started; seed its snapshot from current state
    /// without emitting change events.
    BackendStarted { backend: VmName },
    /// A backend VM was torn down; drop its snapshot.
    BackendRemoved { backend: VmName },
    /// The backend's device namespace changed; run a reconciliation pass.
    DeviceStateChanged { backend: VmName },
    /// A frontend VM started; evaluate its entitlement rules against
    /// devices that were already present.
    FrontendStarted { frontend: VmName },
    /// The whole system is shutting down.
    Shutdown,
}

/// Outbound device lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Something in the backend's device namespace changed.
    ListChanged { backend: VmName },
    /// A device appeared on the backend.
    Added { device: Device },
    /// A device disappeared from the backend.
    Removed { device: Device },
    /// A device gained a holder (possibly attached outside the engine).
    Attached { device: Device, frontend: VmName },
    /// A device lost its holder.
    Detached { device: Device, frontend: VmName },
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbgate_types::PortId;

    #[test]
    fn test_device_event_wire_shape() {
        let event = DeviceEvent::Attached {
            device: Device::new(
                VmName::new("sys-usb").unwrap(),
                PortId::new("1-1").unwrap(),
            ),
            frontend: VmName::new("work").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "attached");
        assert_eq!(json["device"]["backend"], "sys-usb");
        assert_eq!(json["device"]["port"], "1-1");
        assert_eq!(json["frontend"], "work");

        let back: DeviceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
