// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine error types
//!
//! Only the privileged attach/detach path raises errors; anything that
//! originates from the untrusted state store is logged and treated as
//! absent instead. The variants are structured so callers can tell "not
//! installed" from "failed" from "already in the requested state", which
//! need different remedies.

use usbgate_policy::PolicyError;

#[derive(Debug, thiserror::Error)]
pub enum UsbGateError {
    #[error("device {device} already attached to {holder}")]
    AlreadyAttached { device: String, holder: String },

    #[error("device {device} not attached to {frontend}")]
    NotAttached { device: String, frontend: String },

    #[error("usb proxy service not installed in {vm}")]
    ProxyNotInstalled { vm: String },

    #[error("device attach failed: {detail}")]
    AttachFailed { detail: String },

    #[error("device detach failed: {detail}")]
    DetachFailed { detail: String },

    #[error("usb device attach does not support options")]
    UnsupportedOptions,

    #[error("policy update failed: {0}")]
    Policy(#[from] PolicyError),

    #[error("remote execution channel failed: {0}")]
    Exec(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsbGateError>;
