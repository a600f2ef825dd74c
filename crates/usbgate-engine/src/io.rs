// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! External collaborator traits
//!
//! The engine never talks to the key-value transport, the domain model, the
//! remote execution channel or the confirmation UI directly; it goes through
//! these seams. Production adapters live outside this crate,
//! [`crate::testing`] has in-memory implementations.

use std::io;

use async_trait::async_trait;

use usbgate_types::{Assignment, PortId, VmName};

/// Exit code the remote execution channel reserves for "service not
/// installed in the target VM".
pub const NOT_INSTALLED_EXIT_CODE: i32 = 127;

/// Read access to the per-VM key-value store published by backend VMs.
///
/// Everything read through this trait is adversarial: the backend VM
/// controls the bytes. Callers must validate before use and must never let
/// malformed data escalate into an error.
#[async_trait]
pub trait VmStateStore: Send + Sync {
    /// List the paths below `prefix` in `vm`'s namespace. Empty when the VM
    /// is not running or offers no store.
    async fn list(&self, vm: &VmName, prefix: &str) -> Vec<String>;

    /// Read the raw bytes at `path`, or `None` when absent/unreadable.
    async fn read(&self, vm: &VmName, path: &str) -> Option<Vec<u8>>;
}

/// Trusted view of the domain (VM) registry.
pub trait DomainRegistry: Send + Sync {
    /// Whether a VM of this name exists at all.
    fn exists(&self, vm: &VmName) -> bool;

    fn is_running(&self, vm: &VmName) -> bool;

    /// Whether `vm` is the privileged root domain. The root domain is never
    /// an attachment target.
    fn is_admin(&self, vm: &VmName) -> bool;

    fn running_domains(&self) -> Vec<VmName>;

    /// The entitlement rules declared by `vm`'s own device management.
    fn assignments(&self, vm: &VmName) -> Vec<Assignment>;

    /// The auxiliary execution context a frontend routes privileged calls
    /// through, if any; its name goes on the policy line instead of the
    /// frontend's own.
    fn exec_delegate(&self, vm: &VmName) -> Option<VmName>;

    /// Whether the proxy service is installed in the root domain. Root
    /// domain devices are listed only when it is.
    fn admin_proxy_installed(&self) -> bool {
        false
    }
}

/// Outcome of a remote service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub exit_code: i32,
    pub stderr: Vec<u8>,
}

impl ServiceOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            stderr: Vec::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
        }
    }
}

/// The remote command execution channel.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `service` in `target` as root with `input` on stdin. `Err` means
    /// the channel itself failed; a service that ran and exited non-zero is
    /// an `Ok` outcome with a non-zero exit code.
    async fn run_service(
        &self,
        target: &VmName,
        service: &str,
        input: &[u8],
    ) -> io::Result<ServiceOutcome>;
}

/// A request to confirm which frontend should receive a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub backend: VmName,
    pub port: PortId,
    /// Sanitized human-readable device description.
    pub description: String,
    /// Candidate frontends, most preferred first.
    pub candidates: Vec<VmName>,
    pub default_target: Option<VmName>,
}

/// The interactive confirmation service.
#[async_trait]
pub trait AttachmentPrompt: Send + Sync {
    /// Ask which of `request.candidates` should receive the device.
    /// `None` means "none of them"; implementations downgrade their own
    /// failures to `None`.
    async fn confirm(&self, request: ConfirmRequest) -> Option<VmName>;
}
