//! Memory-limit enforcement through Linux cgroups.
//!
//! Only effective when running as root on a Linux host with a usable memory
//! controller. Detection probes `cgroup.controllers` and
//! `cgroup.subtree_control` for unified (v2) support; a hybrid hierarchy
//! where the v2 files exist but v1 owns the memory controller falls through
//! to the legacy `memory/` hierarchy. Everywhere else this degrades to "no
//! enforcement" unless `strict` is set.

use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryController {
    V2,
    V1,
}

pub struct CgroupManager {
    root: Utf8PathBuf,
    /// When set, an unusable memory controller fails the spawn instead of
    /// degrading to unenforced.
    strict: bool,
}

impl CgroupManager {
    pub fn new(root: impl Into<Utf8PathBuf>, strict: bool) -> Self {
        CgroupManager {
            root: root.into(),
            strict,
        }
    }

    fn detect(&self) -> Option<MemoryController> {
        let controllers = self.root.join("cgroup.controllers");
        if controllers.as_std_path().exists() {
            let has = |path: &Utf8Path| {
                fs::read_to_string(path)
                    .map(|s| s.split_whitespace().any(|c| c == "memory"))
                    .unwrap_or(false)
            };
            if has(&controllers) && has(&self.root.join("cgroup.subtree_control")) {
                return Some(MemoryController::V2);
            }
            // Hybrid: v2 mounted but memory still owned by the v1 hierarchy.
        }
        if self.root.join("memory").as_std_path().is_dir() {
            return Some(MemoryController::V1);
        }
        None
    }

    /// Create `<root>/navigator/<sanitized-name>` with `memory.max` (v2) or
    /// `memory.limit_in_bytes` (v1) set to `limit_bytes`. Returns `None`
    /// when no controller is usable and `strict` is off.
    pub fn create(&self, name: &str, limit_bytes: u64) -> anyhow::Result<Option<Utf8PathBuf>> {
        let controller = match self.detect() {
            Some(c) => c,
            None => {
                if self.strict {
                    anyhow::bail!("no usable cgroup memory controller under {}", self.root);
                }
                warn!(
                    tenant = name,
                    "no usable cgroup memory controller, memory limit not enforced"
                );
                return Ok(None);
            }
        };

        let path = match controller {
            MemoryController::V2 => self.root.join("navigator").join(sanitize(name)),
            MemoryController::V1 => self.root.join("memory/navigator").join(sanitize(name)),
        };
        fs::create_dir_all(&path).with_context(|| format!("creating cgroup {path}"))?;

        match controller {
            MemoryController::V2 => {
                // Delegate the memory controller down to our subtree; failure
                // here leaves memory.max writes failing, which we surface.
                let subtree = self.root.join("navigator/cgroup.subtree_control");
                if let Err(e) = fs::write(&subtree, "+memory") {
                    debug!("could not enable memory in {subtree}: {e}");
                }
                fs::write(path.join("memory.max"), limit_bytes.to_string())
                    .with_context(|| format!("setting memory.max in {path}"))?;
            }
            MemoryController::V1 => {
                fs::write(path.join("memory.limit_in_bytes"), limit_bytes.to_string())
                    .with_context(|| format!("setting memory.limit_in_bytes in {path}"))?;
            }
        }
        debug!(tenant = name, %path, limit_bytes, "created memory cgroup");
        Ok(Some(path))
    }

    /// Move a process into the cgroup.
    pub fn attach(path: &Utf8Path, pid: u32) -> anyhow::Result<()> {
        // v1 accepts pids in `tasks` as well; cgroup.procs exists in both.
        fs::write(path.join("cgroup.procs"), pid.to_string())
            .with_context(|| format!("attaching pid {pid} to cgroup {path}"))
    }

    /// Number of OOM kills the kernel has performed in this cgroup.
    pub fn oom_kill_count(path: &Utf8Path) -> u64 {
        // v2 keeps counters in memory.events, v1 in memory.oom_control.
        for file in ["memory.events", "memory.oom_control"] {
            let Ok(contents) = fs::read_to_string(path.join(file)) else {
                continue;
            };
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("oom_kill ") {
                    return rest.trim().parse().unwrap_or(0);
                }
            }
        }
        0
    }

    /// Remove the cgroup directory; processes must already be gone.
    pub fn remove(path: &Utf8Path) {
        if let Err(e) = fs::remove_dir(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove cgroup {path}: {e}");
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
