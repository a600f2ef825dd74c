// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lock-protected mutation of per-service policy files
//!
//! Each policy file holds one authorization line per allowed caller. Files
//! are shared with other processes that follow the same protocol, so every
//! mutation takes an exclusive advisory lock on the open descriptor and
//! re-verifies that the descriptor still refers to the file linked at the
//! path before touching anything; a peer may have unlinked or renamed the
//! file while we were waiting for the lock.
//!
//! Rewrites go through a temporary file in the same directory followed by an
//! atomic rename, so readers never observe a partially written policy. A
//! mutation that leaves the file empty removes it instead.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat::{fstat, stat};
use nix::unistd::{chown, Group};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Mode applied to policy files when the shared group is present.
const POLICY_FILE_MODE: u32 = 0o660;

/// Errors from policy-file mutation
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid policy service name: {0:?}")]
    InvalidService(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

/// A directory of per-service policy files
///
/// The conventional shared group (when it exists on the system) is given
/// group ownership of every file written, so unprivileged management tools
/// in that group can inspect the active grants.
#[derive(Debug, Clone)]
pub struct PolicyDir {
    dir: PathBuf,
    shared_group: Option<String>,
}

impl PolicyDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            shared_group: Some("usbgate".to_string()),
        }
    }

    /// Override (or disable, with `None`) the shared group applied to
    /// rewritten files.
    pub fn with_shared_group(mut self, group: Option<String>) -> Self {
        self.shared_group = group;
        self
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(service)
    }

    /// Add or remove `line` in the policy file of `service`.
    ///
    /// Adding prepends the line; removing deletes **all** occurrences, so a
    /// previously failed cleanup or a manual duplicate cannot leave a stale
    /// grant behind. Idempotent and safe under concurrent invocation from
    /// other processes on the same file.
    pub fn modify(&self, service: &str, line: &str, add: bool) -> Result<(), PolicyError> {
        validate_service_name(service)?;
        let path = self.path_for(service);
        let line = line.trim_end_matches('\n');

        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)?;
            flock(file.as_raw_fd(), FlockArg::LockExclusive)?;

            // While we were waiting for the lock, a peer could have
            // unlinked or renamed the file out from under the path. The
            // lock is only meaningful on the file currently linked there.
            let held = fstat(file.as_raw_fd())?;
            let linked = match stat(&path) {
                Ok(st) => st,
                // the unlink race: start over with a fresh open
                Err(Errno::ENOENT) => continue,
                Err(err) => return Err(err.into()),
            };
            if held.st_dev != linked.st_dev || held.st_ino != linked.st_ino {
                continue;
            }

            let mut content = String::new();
            file.read_to_string(&mut content)?;
            let mut rules: Vec<&str> = content.lines().collect();
            if add {
                rules.insert(0, line);
            } else {
                rules.retain(|rule| *rule != line);
            }

            if rules.is_empty() {
                debug!(operation = "policy_remove_file", path = %path.display(), "Policy file empty after mutation, removing");
                fs::remove_file(&path)?;
            } else {
                self.replace_file(&path, &rules)?;
            }
            // lock released when `file` is dropped
            return Ok(());
        }
    }

    fn replace_file(&self, path: &Path, rules: &[&str]) -> Result<(), PolicyError> {
        let dir = path.parent().unwrap_or(&self.dir);
        let mut replacement = NamedTempFile::new_in(dir)?;
        for rule in rules {
            replacement.write_all(rule.as_bytes())?;
            replacement.write_all(b"\n")?;
        }
        replacement.flush()?;
        self.apply_shared_group(replacement.path());
        replacement
            .persist(path)
            .map_err(|err| PolicyError::Io(err.error))?;
        debug!(operation = "policy_rewrite", path = %path.display(), rules = rules.len(), "Policy file rewritten");
        Ok(())
    }

    /// Give the shared group access to the file about to be renamed into
    /// place. Best-effort: a system without the group keeps default
    /// ownership and mode.
    fn apply_shared_group(&self, path: &Path) {
        let Some(name) = self.shared_group.as_deref() else {
            return;
        };
        let group = match Group::from_name(name) {
            Ok(Some(group)) => group,
            Ok(None) => return,
            Err(err) => {
                warn!(operation = "policy_group_lookup", group = name, error = %err, "Shared group lookup failed");
                return;
            }
        };
        if let Err(err) = chown(path, None, Some(group.gid)) {
            warn!(operation = "policy_chown", group = name, error = %err, "Could not set policy file group");
            return;
        }
        if let Err(err) = fs::set_permissions(path, Permissions::from_mode(POLICY_FILE_MODE)) {
            warn!(operation = "policy_chmod", error = %err, "Could not set policy file mode");
        }
    }
}

fn validate_service_name(service: &str) -> Result<(), PolicyError> {
    let valid = !service.is_empty()
        && service != "."
        && service != ".."
        && !service.contains('/')
        && !service.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(PolicyError::InvalidService(service.to_string()))
    }
}
