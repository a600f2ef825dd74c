// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory stand-ins for the external collaborators
//!
//! Used by this crate's own tests and available to adapter crates that want
//! to exercise engine behavior without a real key-value store, domain
//! registry, execution channel or confirmation UI.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::io::{AttachmentPrompt, ConfirmRequest, DomainRegistry, RemoteExec, ServiceOutcome, VmStateStore};
use usbgate_types::{Assignment, VmName};

/// Key-value store backed by a map of `(vm, path) -> bytes`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<(VmName, String), Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, vm: &VmName, path: &str, value: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert((vm.clone(), path.to_string()), value.to_vec());
    }

    pub fn remove(&self, vm: &VmName, path: &str) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(vm.clone(), path.to_string()));
    }

    /// Publish a device under the default namespace, the way a backend's
    /// exporter does: `desc` and `interfaces`, no holder.
    pub fn publish_device(&self, backend: &VmName, port: &str, desc: &str, interfaces: &str) {
        self.write(backend, &format!("/usb-devices/{port}/desc"), desc.as_bytes());
        self.write(
            backend,
            &format!("/usb-devices/{port}/interfaces"),
            interfaces.as_bytes(),
        );
    }

    pub fn set_holder(&self, backend: &VmName, port: &str, holder: Option<&VmName>) {
        let path = format!("/usb-devices/{port}/connected-to");
        match holder {
            Some(vm) => self.write(backend, &path, vm.as_str().as_bytes()),
            None => self.remove(backend, &path),
        }
    }

    pub fn unplug_device(&self, backend: &VmName, port: &str) {
        let prefix = format!("/usb-devices/{port}/");
        self.entries
            .lock()
            .unwrap()
            .retain(|(vm, path), _| vm != backend || !path.starts_with(&prefix));
    }
}

#[async_trait]
impl VmStateStore for MemoryStateStore {
    async fn list(&self, vm: &VmName, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .keys()
            .filter(|(owner, path)| owner == vm && path.starts_with(prefix))
            .map(|(_, path)| path.clone())
            .collect()
    }

    async fn read(&self, vm: &VmName, path: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(&(vm.clone(), path.to_string()))
            .cloned()
    }
}

/// Domain registry with explicitly managed membership.
#[derive(Debug)]
pub struct StaticRegistry {
    admin: VmName,
    running: Mutex<BTreeSet<VmName>>,
    defined: Mutex<BTreeSet<VmName>>,
    assignments: Mutex<BTreeMap<VmName, Vec<Assignment>>>,
    delegates: Mutex<BTreeMap<VmName, VmName>>,
    admin_proxy: Mutex<bool>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        let admin = VmName::new("dom0").expect("valid admin name");
        Self {
            defined: Mutex::new(BTreeSet::from([admin.clone()])),
            admin,
            running: Mutex::new(BTreeSet::new()),
            assignments: Mutex::new(BTreeMap::new()),
            delegates: Mutex::new(BTreeMap::new()),
            admin_proxy: Mutex::new(false),
        }
    }

    pub fn admin(&self) -> &VmName {
        &self.admin
    }

    /// Define a VM without starting it.
    pub fn add_defined(&self, vm: VmName) {
        self.defined.lock().unwrap().insert(vm);
    }

    pub fn add_running(&self, vm: VmName) {
        self.defined.lock().unwrap().insert(vm.clone());
        self.running.lock().unwrap().insert(vm);
    }

    pub fn stop(&self, vm: &VmName) {
        self.running.lock().unwrap().remove(vm);
    }

    pub fn set_assignments(&self, vm: &VmName, rules: Vec<Assignment>) {
        self.assignments.lock().unwrap().insert(vm.clone(), rules);
    }

    pub fn set_delegate(&self, vm: &VmName, delegate: VmName) {
        self.defined.lock().unwrap().insert(delegate.clone());
        self.delegates.lock().unwrap().insert(vm.clone(), delegate);
    }

    pub fn set_admin_proxy(&self, installed: bool) {
        *self.admin_proxy.lock().unwrap() = installed;
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry for StaticRegistry {
    fn exists(&self, vm: &VmName) -> bool {
        self.defined.lock().unwrap().contains(vm)
    }

    fn is_running(&self, vm: &VmName) -> bool {
        self.running.lock().unwrap().contains(vm)
    }

    fn is_admin(&self, vm: &VmName) -> bool {
        *vm == self.admin
    }

    fn running_domains(&self) -> Vec<VmName> {
        self.running.lock().unwrap().iter().cloned().collect()
    }

    fn assignments(&self, vm: &VmName) -> Vec<Assignment> {
        self.assignments
            .lock()
            .unwrap()
            .get(vm)
            .cloned()
            .unwrap_or_default()
    }

    fn exec_delegate(&self, vm: &VmName) -> Option<VmName> {
        self.delegates.lock().unwrap().get(vm).cloned()
    }

    fn admin_proxy_installed(&self) -> bool {
        *self.admin_proxy.lock().unwrap()
    }
}

/// One recorded remote execution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub target: VmName,
    pub service: String,
    pub input: Vec<u8>,
}

/// Remote execution channel that records calls and replays scripted
/// outcomes; defaults to success when the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedExec {
    calls: Mutex<Vec<ExecCall>>,
    script: Mutex<VecDeque<io::Result<ServiceOutcome>>>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: ServiceOutcome) {
        self.script.lock().unwrap().push_back(Ok(outcome));
    }

    pub fn push_error(&self, error: io::Error) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn run_service(
        &self,
        target: &VmName,
        service: &str,
        input: &[u8],
    ) -> io::Result<ServiceOutcome> {
        self.calls.lock().unwrap().push(ExecCall {
            target: target.clone(),
            service: service.to_string(),
            input: input.to_vec(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ServiceOutcome::success()))
    }
}

/// Confirmation service replaying scripted responses; defaults to "none".
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    requests: Mutex<Vec<ConfirmRequest>>,
    responses: Mutex<VecDeque<Option<VmName>>>,
}

impl ScriptedPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Option<VmName>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<ConfirmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttachmentPrompt for ScriptedPrompt {
    async fn confirm(&self, request: ConfirmRequest) -> Option<VmName> {
        self.requests.lock().unwrap().push(request);
        self.responses.lock().unwrap().pop_front().flatten()
    }
}
