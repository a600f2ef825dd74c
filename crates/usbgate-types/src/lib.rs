// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Domain types shared across the USB Gate system
//!
//! These types model the identities the engine reasons about: VM names,
//! USB topology ports, devices exposed by backend VMs, point-in-time
//! device snapshots, and the entitlement rules frontends declare.
//!
//! Everything here is passive data; the reconciliation and attachment
//! logic lives in `usbgate-engine`.

pub mod assignment;
pub mod device;

pub use assignment::{Assignment, AssignmentMode, DeviceSelector, Pattern, Specificity};
pub use device::{Device, DeviceId, DeviceSnapshot, NameError, PortId, VmName};
