// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! USB Gate - device reconciliation and attachment orchestration
//!
//! The engine keeps a per-backend snapshot of which USB device is held by
//! which frontend VM, derived from an untrusted, watched key-value store.
//! On every change notification it re-reads the backend's device namespace,
//! diffs against the cached snapshot, publishes typed [`events::DeviceEvent`]s
//! for everything that changed, and for newly visible devices resolves which
//! entitled frontend (if any) should receive them. Winning resolutions are
//! driven through the attachment protocol: a transient policy grant, the
//! remote attach call, and a guaranteed revoke.
//!
//! External collaborators - the key-value store, the domain registry, the
//! remote execution channel and the interactive confirmation service - are
//! trait seams defined in [`io`]; `testing` provides in-memory stand-ins for
//! all of them.
//!
//! # Concurrency
//!
//! All engine entry points are async but suspend only at two boundaries:
//! the remote execution call and the confirmation call. Snapshot diffing and
//! cache updates run suspension-free under a plain mutex, so a concurrent
//! task never observes a torn cache. Auto-attach attempts spawned by a
//! reconciliation pass run as independent tasks in an engine-owned
//! [`tokio::task::JoinSet`]; [`engine::Engine::join_pending`] is the join
//! point.

pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod io;
pub mod resolver;
mod sanitize;
pub mod snapshot;
pub mod testing;

pub use engine::{DeviceInfo, Engine, EngineConfig};
pub use error::UsbGateError;
pub use events::{DeviceEvent, EngineNotification};
pub use io::{AttachmentPrompt, ConfirmRequest, DomainRegistry, RemoteExec, ServiceOutcome, VmStateStore};
