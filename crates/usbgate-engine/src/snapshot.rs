// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reads over the untrusted device namespace of a backend VM
//!
//! Every function here treats the state store as adversarial: identifiers
//! and fields that fail validation are logged as warnings and reported as
//! absent, never raised as errors. A backend VM must not be able to crash
//! the engine by publishing garbage.

use std::collections::BTreeSet;

use tracing::warn;

use crate::engine::EngineConfig;
use crate::io::{DomainRegistry, VmStateStore};
use crate::sanitize::sanitize_untrusted;
use usbgate_types::{DeviceId, DeviceSnapshot, PortId, VmName};

/// List the ports on which `backend` currently exposes devices.
///
/// Empty when the backend is not running, or is the root domain without the
/// proxy service installed. Raw path segments that fail port validation are
/// skipped and logged.
pub async fn list_ports(
    store: &dyn VmStateStore,
    registry: &dyn DomainRegistry,
    config: &EngineConfig,
    backend: &VmName,
) -> Vec<PortId> {
    if !registry.is_running(backend) {
        return Vec::new();
    }
    if registry.is_admin(backend) && !registry.admin_proxy_installed() {
        return Vec::new();
    }

    let prefix = format!("{}/", config.qdb_prefix);
    let mut ports = BTreeSet::new();
    for untrusted_path in store.list(backend, &prefix).await {
        let Some(segment) = untrusted_path
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
        else {
            continue;
        };
        match PortId::parse_untrusted(segment) {
            Ok(port) => {
                ports.insert(port);
            }
            Err(_) => {
                // don't echo the raw segment into logs
                warn!(operation = "list_ports", backend = %backend, "Invalid USB device name detected");
            }
        }
    }
    ports.into_iter().collect()
}

/// The VM currently holding the device on `port`, if any.
///
/// Returns `None` when the backend is not running, the `connected-to` field
/// is absent, the bytes fail the VM-name syntax, or the named VM does not
/// exist in the registry. Each anomaly is a warning, not an error.
pub async fn current_holder(
    store: &dyn VmStateStore,
    registry: &dyn DomainRegistry,
    config: &EngineConfig,
    backend: &VmName,
    port: &PortId,
) -> Option<VmName> {
    if !registry.is_running(backend) {
        return None;
    }
    let untrusted = store
        .read(backend, &format!("{}/connected-to", config.device_path(port)))
        .await?;
    if untrusted.is_empty() {
        return None;
    }
    let holder = match VmName::parse_untrusted(&untrusted) {
        Ok(holder) => holder,
        Err(_) => {
            warn!(
                operation = "current_holder",
                backend = %backend,
                port = %port,
                "Device has invalid chars in connected-to property"
            );
            return None;
        }
    };
    if !registry.exists(&holder) {
        warn!(
            operation = "current_holder",
            backend = %backend,
            port = %port,
            holder = %holder,
            "Device has unknown VM name in connected-to property"
        );
        return None;
    }
    Some(holder)
}

/// Produce a fresh snapshot of `backend`'s devices and holders.
pub async fn snapshot(
    store: &dyn VmStateStore,
    registry: &dyn DomainRegistry,
    config: &EngineConfig,
    backend: &VmName,
) -> DeviceSnapshot {
    let mut snapshot = DeviceSnapshot::new();
    for port in list_ports(store, registry, config, backend).await {
        let holder = current_holder(store, registry, config, backend, &port).await;
        snapshot.insert(port, holder);
    }
    snapshot
}

/// Derive the device-content identifier for selector matching.
///
/// Built from the `hhhh:hhhh` hardware ident leading the description plus
/// the published interface list; `None` when the description is missing or
/// carries no ident, so such devices only match wildcard selectors.
pub async fn device_id(
    store: &dyn VmStateStore,
    config: &EngineConfig,
    backend: &VmName,
    port: &PortId,
) -> Option<DeviceId> {
    let untrusted_desc = store
        .read(backend, &format!("{}/desc", config.device_path(port)))
        .await?;
    let desc = sanitize_untrusted(&untrusted_desc);
    let ident = hardware_ident(&desc)?;

    let interfaces = match store
        .read(backend, &format!("{}/interfaces", config.device_path(port)))
        .await
    {
        Some(untrusted) => sanitize_untrusted(&untrusted)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.'))
            .collect::<String>(),
        None => String::new(),
    };

    Some(DeviceId(format!("{ident}:{interfaces}")))
}

/// Sanitized human-readable description for prompts and diagnostics.
pub async fn describe(
    store: &dyn VmStateStore,
    registry: &dyn DomainRegistry,
    config: &EngineConfig,
    backend: &VmName,
    port: &PortId,
) -> String {
    if !registry.is_running(backend) {
        return "unknown - domain not running".to_string();
    }
    let Some(untrusted) = store
        .read(backend, &format!("{}/desc", config.device_path(port)))
        .await
        .filter(|raw| !raw.is_empty())
    else {
        return "unknown".to_string();
    };
    let desc = sanitize_untrusted(&untrusted);
    // strip the "hhhh:hhhh " ident prefix from the displayed name
    match hardware_ident(&desc).map(str::len) {
        Some(ident_len) => {
            let name = desc[ident_len..].trim_start_matches(' ');
            if name.is_empty() {
                "unknown".to_string()
            } else {
                name.to_string()
            }
        }
        None => desc,
    }
}

/// The `hhhh:hhhh` vendor/product ident at the start of a description,
/// if present (it must be followed by a space or end the string).
fn hardware_ident(desc: &str) -> Option<&str> {
    let bytes = desc.as_bytes();
    if bytes.len() < 9 {
        return None;
    }
    let ident = &bytes[..9];
    let well_formed = ident[..4].iter().all(u8::is_ascii_hexdigit)
        && ident[4] == b':'
        && ident[5..].iter().all(u8::is_ascii_hexdigit)
        && (bytes.len() == 9 || bytes[9] == b' ');
    well_formed.then(|| &desc[..9])
}
