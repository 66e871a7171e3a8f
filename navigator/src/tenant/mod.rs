//! The tenant model: the immutable per-app configuration ([`Tenant`]), the
//! live backend instance ([`WebApp`]), and path-scope resolution.

pub mod cgroup;
pub mod pool;
pub mod spawn;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::hooks::HookConfig;

/// One of the multiplexed web applications. Immutable within a config
/// snapshot; a reload produces a fresh set of `Tenant`s.
#[derive(Debug, Clone, Default)]
pub struct Tenant {
    pub name: String,
    /// URL scope prefix, always with a trailing slash.
    pub path: String,
    /// Working directory for the backend process.
    pub root: Utf8PathBuf,
    /// Backend invocation; `None` falls back to the framework default and
    /// then the hard default (`ruby` / `bin/rails` / rails server args).
    pub runtime: Option<String>,
    pub server: Option<String>,
    /// `{{port}}` is substituted anywhere in these.
    pub args: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    /// Readiness probe endpoint, default `/`.
    pub health_check: Option<String>,
    /// Memory limit in bytes; `None` or zero means no cgroup is created.
    pub memory_limit: Option<u64>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Tri-state: `None` defers to the global setting.
    pub track_websockets: Option<bool>,
    pub startup_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub hooks: TenantHooks,
}

#[derive(Debug, Clone, Default)]
pub struct TenantHooks {
    pub start: Vec<HookConfig>,
    pub stop: Vec<HookConfig>,
}

impl Tenant {
    pub fn health_check_path(&self) -> &str {
        self.health_check.as_deref().unwrap_or("/")
    }

    pub fn should_track_websockets(&self, global: bool) -> bool {
        self.track_websockets.unwrap_or(global)
    }
}

/// Normalize a tenant scope: anything non-empty gains a trailing slash.
/// Idempotent; `""` stays `""` and `"/"` stays `"/"`.
pub fn normalize_scope(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Longest-prefix match of `path` against tenant scopes; ties broken by
/// declaration order. Pure and reentrant.
pub fn resolve<'a>(tenants: &'a [Arc<Tenant>], path: &str) -> Option<&'a Arc<Tenant>> {
    let mut best: Option<&Arc<Tenant>> = None;
    for tenant in tenants {
        if !path.starts_with(tenant.path.as_str()) {
            continue;
        }
        match best {
            Some(b) if b.path.len() >= tenant.path.len() => {}
            _ => best = Some(tenant),
        }
    }
    best
}

/// A close-once latch: concurrent requests to a starting tenant all wait on
/// this instead of spawning a second backend.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Readiness {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Release all current and future waiters. Signalling twice is fine.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`signal`](Self::signal) has been called. Callers apply
    /// their own deadline.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by self; unreachable in practice.
                return;
            }
        }
    }
}

/// Mutable per-app fields, guarded by one mutex held only for field access.
#[derive(Debug)]
struct WebAppState {
    last_activity: Instant,
    starting: bool,
    stopping: bool,
}

/// The live backend instance of a tenant.
///
/// Exactly one `WebApp` per tenant name exists in the pool at any instant.
/// The port is allocated before registration and released only after the
/// process has exited and the registry entry is gone.
pub struct WebApp {
    pub tenant: Arc<Tenant>,
    pub port: u16,
    /// Cancelling kills the backend process (process group, then SIGKILL).
    pub process_cancel: CancellationToken,
    pub start_time: Instant,
    pub readiness: Readiness,
    state: Mutex<WebAppState>,
    active_websockets: Arc<AtomicI64>,
    pub cgroup_path: Mutex<Option<Utf8PathBuf>>,
    pub oom_kills: AtomicU64,
    pub pid: AtomicU64,
}

impl WebApp {
    pub fn new(tenant: Arc<Tenant>, port: u16) -> Self {
        WebApp {
            tenant,
            port,
            process_cancel: CancellationToken::new(),
            start_time: Instant::now(),
            readiness: Readiness::new(),
            state: Mutex::new(WebAppState {
                last_activity: Instant::now(),
                starting: true,
                stopping: false,
            }),
            active_websockets: Arc::new(AtomicI64::new(0)),
            cgroup_path: Mutex::new(None),
            oom_kills: AtomicU64::new(0),
            pid: AtomicU64::new(0),
        }
    }

    pub fn is_starting(&self) -> bool {
        self.state.lock().unwrap().starting
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().unwrap().stopping
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().unwrap().last_activity
    }

    /// Move `LastActivity` forward and rescue the app from an eviction that
    /// has begun but not finished. Returns true if a `Stopping` flag was
    /// cleared, i.e. an in-flight eviction must back off.
    pub fn touch(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        std::mem::take(&mut state.stopping)
    }

    /// Readiness probe finished (successfully or by deadline): the app is no
    /// longer `Starting` and waiters are released.
    pub fn mark_ready(&self) {
        self.state.lock().unwrap().starting = false;
        self.readiness.signal();
    }

    /// Begin idle eviction.
    pub fn begin_stopping(&self) {
        self.state.lock().unwrap().stopping = true;
    }

    /// Re-read `Stopping` after the stop hooks ran: a request that arrived
    /// mid-hook clears the flag and cancels the eviction.
    pub fn still_stopping(&self) -> bool {
        self.state.lock().unwrap().stopping
    }

    pub fn active_websockets(&self) -> i64 {
        self.active_websockets.load(Ordering::SeqCst)
    }

    /// Stable for the lifetime of the `WebApp`; WebSocket relay tasks hold a
    /// clone and decrement on close.
    pub fn websocket_counter(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.active_websockets)
    }
}

impl std::fmt::Debug for WebApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApp")
            .field("tenant", &self.tenant.name)
            .field("port", &self.port)
            .field("starting", &self.is_starting())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
