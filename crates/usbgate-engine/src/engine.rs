// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The reconciliation engine and attachment protocol
//!
//! [`Engine`] owns the per-backend snapshot cache and the set of in-flight
//! auto-attach tasks. The cache is the engine's view of ground truth; it is
//! allowed to differ from it only between an external change and the next
//! reconciliation pass, or while an attach/detach is in flight (the
//! optimistic update precedes remote confirmation).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::diff::SnapshotDelta;
use crate::error::{Result, UsbGateError};
use crate::events::{DeviceEvent, EngineNotification};
use crate::io::{
    AttachmentPrompt, DomainRegistry, RemoteExec, VmStateStore, NOT_INSTALLED_EXIT_CODE,
};
use crate::resolver;
use crate::sanitize::printable_excerpt;
use crate::snapshot;
use usbgate_policy::PolicyDir;
use usbgate_types::{Assignment, Device, DeviceId, DeviceSnapshot, PortId, VmName};

/// Longest remote error excerpt carried in an error variant.
const MAX_ERROR_EXCERPT: usize = 256;

/// Engine tunables; the defaults match the production layout.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Key-value namespace backends publish devices under.
    pub qdb_prefix: String,
    /// Directory holding per-service policy files.
    pub policy_dir: PathBuf,
    /// Policy service prefix; the per-device service is
    /// `<prefix>+<port>`.
    pub policy_service_prefix: String,
    /// Remote service performing the attach in the backend.
    pub attach_service: String,
    /// Remote service performing the detach in the backend.
    pub detach_service: String,
    /// Shared group given access to policy files, when present on the
    /// system.
    pub shared_group: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qdb_prefix: "/usb-devices".to_string(),
            policy_dir: PathBuf::from("/etc/usbgate/policy"),
            policy_service_prefix: "usbgate.USB".to_string(),
            attach_service: "usbgate.Attach".to_string(),
            detach_service: "usbgate.Detach".to_string(),
            shared_group: Some("usbgate".to_string()),
        }
    }
}

impl EngineConfig {
    /// Namespace path of one device.
    pub fn device_path(&self, port: &PortId) -> String {
        format!("{}/{}", self.qdb_prefix, port.qdb_segment())
    }

    /// Policy service name keyed to one device.
    pub fn policy_service(&self, port: &PortId) -> String {
        format!("{}+{}", self.policy_service_prefix, port.qdb_segment())
    }
}

/// Point-in-time information about one device, read fresh from the
/// backend's namespace. What management tools query for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device: Device,
    /// Sanitized human-readable description.
    pub description: String,
    /// Content identifier, when the backend published one.
    pub device_id: Option<DeviceId>,
    /// The VM currently holding the device, if any.
    pub holder: Option<VmName>,
}

/// The device reconciliation and attachment-orchestration engine
///
/// Cheap to clone; clones share the cache, the collaborator handles and the
/// pending task set.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn VmStateStore>,
    registry: Arc<dyn DomainRegistry>,
    exec: Arc<dyn RemoteExec>,
    prompt: Arc<dyn AttachmentPrompt>,
    policy: PolicyDir,
    config: Arc<EngineConfig>,
    /// backend -> last published snapshot
    cache: Arc<Mutex<HashMap<VmName, DeviceSnapshot>>>,
    events: UnboundedSender<DeviceEvent>,
    pending: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn VmStateStore>,
        registry: Arc<dyn DomainRegistry>,
        exec: Arc<dyn RemoteExec>,
        prompt: Arc<dyn AttachmentPrompt>,
        config: EngineConfig,
    ) -> (Self, UnboundedReceiver<DeviceEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let policy =
            PolicyDir::new(&config.policy_dir).with_shared_group(config.shared_group.clone());
        let engine = Self {
            store,
            registry,
            exec,
            prompt,
            policy,
            config: Arc::new(config),
            cache: Arc::new(Mutex::new(HashMap::new())),
            events,
            pending: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
        };
        (engine, receiver)
    }

    /// Typed dispatch for inbound notifications.
    pub async fn handle(&self, notification: EngineNotification) {
        match notification {
            EngineNotification::BackendInitializing { backend } => {
                self.backend_initializing(&backend);
            }
            EngineNotification::BackendStarted { backend } => {
                self.backend_started(&backend).await;
            }
            EngineNotification::BackendRemoved { backend } => {
                self.backend_removed(&backend);
            }
            EngineNotification::DeviceStateChanged { backend } => {
                self.reconcile(&backend).await;
            }
            EngineNotification::FrontendStarted { frontend } => {
                self.frontend_started(&frontend).await;
            }
            EngineNotification::Shutdown => self.shutdown(),
        }
    }

    /// Start tracking a backend that is defined but not yet running.
    pub fn backend_initializing(&self, backend: &VmName) {
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(backend.clone(), DeviceSnapshot::new());
    }

    /// Seed the cache from the backend's current state. No events are
    /// emitted; nothing has changed yet from the engine's point of view.
    pub async fn backend_started(&self, backend: &VmName) {
        let seeded =
            snapshot::snapshot(&*self.store, &*self.registry, &self.config, backend).await;
        debug!(operation = "backend_started", backend = %backend, devices = seeded.len(), "Seeded device snapshot");
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(backend.clone(), seeded);
    }

    /// Drop a torn-down backend. Everything it exposed is gone: emit
    /// `Removed` for each device and `Detached` for each held one.
    pub fn backend_removed(&self, backend: &VmName) {
        let Some(last) = self
            .cache
            .lock()
            .expect("cache mutex poisoned")
            .remove(backend)
        else {
            return;
        };
        self.publish(DeviceEvent::ListChanged {
            backend: backend.clone(),
        });
        for (port, holder) in last {
            let device = Device::new(backend.clone(), port);
            if let Some(frontend) = holder {
                self.publish(DeviceEvent::Detached {
                    device: device.clone(),
                    frontend,
                });
            }
            self.publish(DeviceEvent::Removed { device });
        }
    }

    /// Forget all backends.
    pub fn shutdown(&self) {
        self.cache.lock().expect("cache mutex poisoned").clear();
    }

    /// One reconciliation pass over `backend`'s device namespace.
    ///
    /// Diffing and the cache update run without suspension; auto-attach
    /// attempts for newly appeared devices are spawned as independent tasks
    /// and do not block the pass or each other.
    pub async fn reconcile(&self, backend: &VmName) {
        let current =
            snapshot::snapshot(&*self.store, &*self.registry, &self.config, backend).await;

        let delta = {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            let previous = cache.get(backend).cloned().unwrap_or_default();
            let delta = SnapshotDelta::between(&previous, &current);
            cache.insert(backend.clone(), current);
            delta
        };

        self.publish(DeviceEvent::ListChanged {
            backend: backend.clone(),
        });
        if delta.is_empty() {
            return;
        }
        debug!(
            operation = "reconcile",
            backend = %backend,
            added = delta.added.len(),
            removed = delta.removed.len(),
            attached = delta.attached.len(),
            detached = delta.detached.len(),
            "Device snapshot changed"
        );

        for (port, frontend) in &delta.detached {
            self.publish(DeviceEvent::Detached {
                device: Device::new(backend.clone(), port.clone()),
                frontend: frontend.clone(),
            });
        }
        for port in &delta.removed {
            self.publish(DeviceEvent::Removed {
                device: Device::new(backend.clone(), port.clone()),
            });
        }
        for port in &delta.added {
            self.publish(DeviceEvent::Added {
                device: Device::new(backend.clone(), port.clone()),
            });
        }
        for (port, frontend) in &delta.attached {
            self.publish(DeviceEvent::Attached {
                device: Device::new(backend.clone(), port.clone()),
                frontend: frontend.clone(),
            });
        }

        // auto-attach: newly appeared devices that nobody holds yet
        for port in delta.added {
            if delta.attached.contains_key(&port) {
                continue;
            }
            let device_id =
                snapshot::device_id(&*self.store, &self.config, backend, &port).await;
            let candidates = resolver::collect_candidates(
                &*self.registry,
                backend,
                &port,
                device_id.as_ref(),
            );
            if candidates.is_empty() {
                continue;
            }
            let description = snapshot::describe(
                &*self.store,
                &*self.registry,
                &self.config,
                backend,
                &port,
            )
            .await;
            let device = Device::new(backend.clone(), port);
            self.spawn_resolution(device, description, candidates).await;
        }
    }

    /// Evaluate a freshly started frontend's rules against devices that
    /// were already present before it came up. Held devices are skipped.
    pub async fn frontend_started(&self, frontend: &VmName) {
        if !self.registry.is_running(frontend) {
            return;
        }
        let assignments = self.registry.assignments(frontend);
        if assignments.is_empty() {
            return;
        }
        for backend in self.registry.running_domains() {
            if !assignments
                .iter()
                .any(|rule| rule.selector.matches_backend(&backend))
            {
                continue;
            }
            let devices =
                snapshot::snapshot(&*self.store, &*self.registry, &self.config, &backend).await;
            for (port, holder) in devices {
                if holder.is_some() {
                    continue;
                }
                let device_id =
                    snapshot::device_id(&*self.store, &self.config, &backend, &port).await;
                let Some(rule) = resolver::best_match(
                    &assignments,
                    &backend,
                    &port,
                    device_id.as_ref(),
                ) else {
                    continue;
                };
                let description = snapshot::describe(
                    &*self.store,
                    &*self.registry,
                    &self.config,
                    &backend,
                    &port,
                )
                .await;
                let device = Device::new(backend.clone(), port);
                let candidates =
                    BTreeMap::from([(frontend.clone(), rule.clone())]);
                self.spawn_resolution(device, description, candidates).await;
            }
        }
    }

    async fn spawn_resolution(
        &self,
        device: Device,
        description: String,
        candidates: BTreeMap<VmName, Assignment>,
    ) {
        let engine = self.clone();
        self.pending.lock().await.spawn(async move {
            engine.resolve_and_attach(device, description, candidates).await;
        });
    }

    async fn resolve_and_attach(
        &self,
        device: Device,
        description: String,
        candidates: BTreeMap<VmName, Assignment>,
    ) {
        let Some(assignment) =
            resolver::resolve(&*self.prompt, &device, &description, candidates).await
        else {
            return;
        };
        let frontend = assignment.frontend.clone();
        match self.attach(&frontend, &device, &assignment.options).await {
            Ok(()) => {
                info!(operation = "auto_attach", device = %device, frontend = %frontend, "Device attached");
            }
            Err(err) => {
                warn!(operation = "auto_attach", device = %device, frontend = %frontend, error = %err, "Automatic attachment failed");
            }
        }
    }

    /// Await every spawned auto-attach attempt. The well-defined join point
    /// after dispatching a reconciliation pass.
    pub async fn join_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    warn!(operation = "join_pending", error = %err, "Auto-attach task panicked");
                }
            }
        }
    }

    /// Attach `device` to `frontend`.
    ///
    /// Grants the per-device policy line, requests the attach through the
    /// remote execution channel, and revokes the line on every exit path;
    /// the grant is single-use and must not outlive the call.
    pub async fn attach(
        &self,
        frontend: &VmName,
        device: &Device,
        options: &BTreeMap<String, String>,
    ) -> Result<()> {
        if !self.registry.is_running(frontend) || self.registry.is_admin(frontend) {
            debug!(operation = "attach", device = %device, frontend = %frontend, "Frontend not eligible, nothing to do");
            return Ok(());
        }
        if !options.is_empty() {
            return Err(UsbGateError::UnsupportedOptions);
        }
        if let Some(holder) = self.current_holder(device).await {
            return Err(UsbGateError::AlreadyAttached {
                device: device.to_string(),
                holder: holder.to_string(),
            });
        }

        // update the cache before the call, so a concurrent reconciliation
        // pass does not re-report our own pending attach
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .entry(device.backend().clone())
            .or_default()
            .insert(device.port().clone(), Some(frontend.clone()));

        let grantee = self
            .registry
            .exec_delegate(frontend)
            .unwrap_or_else(|| frontend.clone());
        let service = self.config.policy_service(device.port());
        let line = format!("{} {} allow,user=root\n", grantee, device.backend());
        self.policy.modify(&service, &line, true)?;
        info!(operation = "attach", device = %device, frontend = %frontend, "Policy granted, requesting attach");

        let input = format!("{} {}\n", device.backend(), device.port());
        let outcome = self
            .exec
            .run_service(device.backend(), &self.config.attach_service, input.as_bytes())
            .await;
        let revoked = self.policy.modify(&service, &line, false);

        let result = match outcome {
            Ok(out) if out.exit_code == 0 => Ok(()),
            Ok(out) if out.exit_code == NOT_INSTALLED_EXIT_CODE => {
                Err(UsbGateError::ProxyNotInstalled {
                    vm: device.backend().to_string(),
                })
            }
            Ok(out) => Err(UsbGateError::AttachFailed {
                detail: printable_excerpt(&out.stderr, MAX_ERROR_EXCERPT),
            }),
            Err(err) => Err(UsbGateError::Exec(err)),
        };

        if let Err(revoke_err) = revoked {
            match &result {
                // a lingering grant outranks a successful attach
                Ok(()) => return Err(UsbGateError::Policy(revoke_err)),
                Err(primary) => {
                    warn!(operation = "attach", device = %device, error = %revoke_err, primary = %primary, "Policy revoke failed after attach error");
                }
            }
        }
        result
    }

    /// Detach `device` from `frontend`.
    pub async fn detach(&self, frontend: &VmName, device: &Device) -> Result<()> {
        if !self.registry.is_running(frontend) || self.registry.is_admin(frontend) {
            debug!(operation = "detach", device = %device, frontend = %frontend, "Frontend not eligible, nothing to do");
            return Ok(());
        }

        // guard against the device having been moved or removed since the
        // caller decided to detach; a smaller race remains and is accepted
        match self.current_holder(device).await {
            Some(holder) if holder == *frontend => {}
            _ => {
                return Err(UsbGateError::NotAttached {
                    device: device.to_string(),
                    frontend: frontend.to_string(),
                });
            }
        }

        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .entry(device.backend().clone())
            .or_default()
            .insert(device.port().clone(), None);

        let input = format!("{}\n", device.port());
        let outcome = self
            .exec
            .run_service(device.backend(), &self.config.detach_service, input.as_bytes())
            .await?;
        if outcome.exit_code == 0 {
            info!(operation = "detach", device = %device, frontend = %frontend, "Device detached");
            Ok(())
        } else {
            Err(UsbGateError::DetachFailed {
                detail: printable_excerpt(&outcome.stderr, MAX_ERROR_EXCERPT),
            })
        }
    }

    /// Devices currently exposed by `backend` (fresh read, not the cache).
    pub async fn list_devices(&self, backend: &VmName) -> Vec<Device> {
        snapshot::list_ports(&*self.store, &*self.registry, &self.config, backend)
            .await
            .into_iter()
            .map(|port| Device::new(backend.clone(), port))
            .collect()
    }

    /// Description, content identifier and holder of `device` (fresh read).
    pub async fn device_info(&self, device: &Device) -> DeviceInfo {
        let description = snapshot::describe(
            &*self.store,
            &*self.registry,
            &self.config,
            device.backend(),
            device.port(),
        )
        .await;
        let device_id =
            snapshot::device_id(&*self.store, &self.config, device.backend(), device.port())
                .await;
        let holder = self.current_holder(device).await;
        DeviceInfo {
            device: device.clone(),
            description,
            device_id,
            holder,
        }
    }

    /// The VM currently holding `device`, read from ground truth.
    pub async fn current_holder(&self, device: &Device) -> Option<VmName> {
        snapshot::current_holder(
            &*self.store,
            &*self.registry,
            &self.config,
            device.backend(),
            device.port(),
        )
        .await
    }

    /// The cached snapshot for `backend`, if it is tracked.
    pub fn cached_snapshot(&self, backend: &VmName) -> Option<DeviceSnapshot> {
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .get(backend)
            .cloned()
    }

    fn publish(&self, event: DeviceEvent) {
        // a missing subscriber is fine; events are advisory
        let _ = self.events.send(event);
    }
}
