//! The registry of live tenant backends and its control loops.
//!
//! One [`WebApp`] per tenant name, at most. Startup is single-flight: the
//! first request registers the entry under the write lock and spawns the
//! process; concurrent requests observe the starting entry and wait on its
//! readiness latch. Each live app gets an eviction task that shuts it down
//! after the idle timeout, detects OOM kills, and can be cancelled by a
//! request arriving mid-eviction.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::hooks;
use crate::port::PortAllocator;
use crate::tenant::cgroup::CgroupManager;
use crate::tenant::spawn::{self, StarterConfig};
use crate::tenant::{Tenant, WebApp};

pub const EVICTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub start_port: u16,
    pub port_range: u16,
    /// Default idle timeout for tenants without their own; zero disables
    /// eviction entirely.
    pub idle_timeout: Duration,
    pub track_websockets: bool,
    pub starter: StarterConfig,
    pub eviction_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            start_port: 4000,
            port_range: 100,
            idle_timeout: Duration::from_secs(600),
            track_websockets: false,
            starter: StarterConfig::default(),
            eviction_check_interval: EVICTION_CHECK_INTERVAL,
        }
    }
}

pub struct AppPool {
    apps: RwLock<HashMap<String, Arc<WebApp>>>,
    ports: PortAllocator,
    settings: RwLock<Arc<PoolConfig>>,
    /// Per-tenant lifetime OOM kill counts, kept across restarts of the app.
    oom_totals: RwLock<HashMap<String, u64>>,
    /// Supervision tasks of all child processes; cleanup waits on this.
    children: TaskTracker,
    shutdown: CancellationToken,
}

impl AppPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(AppPool {
            apps: RwLock::new(HashMap::new()),
            ports: PortAllocator::new(config.start_port, config.port_range),
            settings: RwLock::new(Arc::new(config)),
            oom_totals: RwLock::new(HashMap::new()),
            children: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    fn settings(&self) -> Arc<PoolConfig> {
        Arc::clone(&self.settings.read().unwrap())
    }

    /// Look up a live app without counting it as activity.
    pub fn get(&self, tenant_name: &str) -> Option<Arc<WebApp>> {
        self.apps.read().unwrap().get(tenant_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.apps.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().unwrap().is_empty()
    }

    pub fn oom_kill_total(&self, tenant_name: &str) -> u64 {
        self.oom_totals
            .read()
            .unwrap()
            .get(tenant_name)
            .copied()
            .unwrap_or(0)
    }

    /// Return the tenant's live app, starting one if needed.
    ///
    /// Returns as soon as the entry is registered and the process spawn has
    /// been attempted; callers wait on the app's readiness latch with their
    /// own timeout. A hit moves `LastActivity` forward and rescues the app
    /// from an eviction that is mid-hook.
    pub async fn get_or_start(
        self: &Arc<Self>,
        tenant: &Arc<Tenant>,
    ) -> anyhow::Result<Arc<WebApp>> {
        if let Some(app) = self.get_and_touch(tenant) {
            return Ok(app);
        }

        let settings = self.settings();
        let app = {
            let mut apps = self.apps.write().unwrap();
            // Re-check: another request may have won the race for the lock.
            if let Some(app) = apps.get(&tenant.name) {
                let app = Arc::clone(app);
                drop(apps);
                if app.touch() {
                    info!(tenant = %tenant.name, "request rescued app from idle eviction");
                }
                return Ok(app);
            }
            let port = self
                .ports
                .allocate()
                .with_context(|| format!("starting tenant {:?}", tenant.name))?;
            let app = Arc::new(WebApp::new(Arc::clone(tenant), port));
            // Register before spawning so concurrent callers observe the
            // starting entry instead of racing a second backend.
            apps.insert(tenant.name.clone(), Arc::clone(&app));
            app
        };

        if let Err(e) = spawn::start_backend(&app, &settings.starter, &self.children).await {
            self.deregister(&tenant.name, &app);
            return Err(e);
        }
        self.launch_eviction_loop(&app, &settings);
        Ok(app)
    }

    fn get_and_touch(&self, tenant: &Arc<Tenant>) -> Option<Arc<WebApp>> {
        let app = self.apps.read().unwrap().get(&tenant.name).cloned()?;
        if app.touch() {
            info!(tenant = %tenant.name, "request rescued app from idle eviction");
        }
        Some(app)
    }

    /// Remove `app` from the registry if it is still the current entry for
    /// the name, and release its port. Returns whether it was removed.
    fn deregister(&self, name: &str, app: &Arc<WebApp>) -> bool {
        let removed = {
            let mut apps = self.apps.write().unwrap();
            match apps.get(name) {
                Some(current) if Arc::ptr_eq(current, app) => {
                    apps.remove(name);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.ports.release(app.port);
        }
        removed
    }

    /// Adopt a new configuration snapshot. Existing apps keep their current
    /// settings until they are evicted; new spawns use the new snapshot.
    pub fn update_config(&self, config: PoolConfig) {
        self.ports.update_range(config.start_port, config.port_range);
        *self.settings.write().unwrap() = Arc::new(config);
        info!("app pool adopted new configuration");
    }

    /// Stop everything: run stop hooks, kill processes, clean up files, and
    /// wait up to `grace` (default 500 ms) for the children to be reaped.
    pub async fn cleanup(&self, grace: Option<Duration>) {
        self.shutdown.cancel();
        let apps: Vec<Arc<WebApp>> = {
            let mut map = self.apps.write().unwrap();
            map.drain().map(|(_, app)| app).collect()
        };
        let settings = self.settings();
        for app in &apps {
            run_stop_hooks(app, &settings.starter).await;
            app.process_cancel.cancel();
            cleanup_files(app);
        }
        self.children.close();
        let grace = grace.unwrap_or(DEFAULT_CLEANUP_GRACE);
        if !apps.is_empty() {
            if tokio::time::timeout(grace, self.children.wait()).await.is_err() {
                warn!("timed out waiting for backends to exit");
            }
        }
        for app in &apps {
            self.ports.release(app.port);
        }
        info!(count = apps.len(), "app pool cleaned up");
    }

    fn launch_eviction_loop(self: &Arc<Self>, app: &Arc<WebApp>, settings: &Arc<PoolConfig>) {
        let idle_timeout = app.tenant.idle_timeout.unwrap_or(settings.idle_timeout);
        if idle_timeout.is_zero() {
            debug!(tenant = %app.tenant.name, "idle timeout is zero, no eviction loop");
            return;
        }
        let pool = Arc::downgrade(self);
        let app = Arc::clone(app);
        let settings = Arc::clone(settings);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            eviction_loop(pool, app, settings, idle_timeout, shutdown).await;
        });
    }
}

/// One loop per live app. Exits when the app is removed (by eviction or OOM)
/// or the pool shuts down.
async fn eviction_loop(
    pool: Weak<AppPool>,
    app: Arc<WebApp>,
    settings: Arc<PoolConfig>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let interval = settings.eviction_check_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let Some(pool) = pool.upgrade() else { return };

        // An OOM-killed backend is already dead; remove it without the
        // graceful stop so the next request starts fresh.
        let cgroup = app.cgroup_path.lock().unwrap().clone();
        if let Some(cgroup) = cgroup {
            let kills = CgroupManager::oom_kill_count(&cgroup);
            let seen = app.oom_kills.load(Ordering::SeqCst);
            if kills > seen {
                app.oom_kills.store(kills, Ordering::SeqCst);
                *pool
                    .oom_totals
                    .write()
                    .unwrap()
                    .entry(app.tenant.name.clone())
                    .or_default() += kills - seen;
                error!(
                    tenant = %app.tenant.name,
                    kills,
                    "backend was OOM-killed, removing from pool"
                );
                app.process_cancel.cancel();
                pool.deregister(&app.tenant.name, &app);
                cleanup_files(&app);
                return;
            }
        }

        if app.active_websockets() > 0 {
            continue;
        }
        if app.last_activity().elapsed() <= idle_timeout {
            continue;
        }

        app.begin_stopping();
        info!(tenant = %app.tenant.name, "idle timeout reached, stopping backend");
        run_stop_hooks(&app, &settings.starter).await;

        // A request that arrived while the stop hooks ran has cleared the
        // flag; restore normal state and keep monitoring.
        if !app.still_stopping() {
            info!(tenant = %app.tenant.name, "eviction cancelled by request, restarting hooks");
            spawn::run_start_hooks(&app, &settings.starter).await;
            continue;
        }

        app.process_cancel.cancel();
        pool.deregister(&app.tenant.name, &app);
        cleanup_files(&app);
        info!(tenant = %app.tenant.name, "backend evicted");
        return;
    }
}

/// Stop hooks: the fleet-wide defaults first, then the tenant's own.
/// Failures are logged and do not abort the eviction.
async fn run_stop_hooks(app: &Arc<WebApp>, starter: &StarterConfig) {
    let env = spawn::build_child_env(&app.tenant, app.port);
    for group in [&starter.default_tenant_hooks.stop, &app.tenant.hooks.stop] {
        if let Err(e) = hooks::execute(group, &env, "tenant-stop", None).await {
            warn!(tenant = %app.tenant.name, "stop hook failed: {e:#}");
        }
    }
}

fn cleanup_files(app: &Arc<WebApp>) {
    if let Some(pidfile) = app.tenant.env.get("PIDFILE") {
        if let Err(e) = std::fs::remove_file(pidfile) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove PID file {pidfile}: {e}");
            }
        }
    }
    if let Some(cgroup) = app.cgroup_path.lock().unwrap().clone() {
        CgroupManager::remove(&cgroup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookConfig;
    use std::time::Instant;

    fn sleeper_tenant(name: &str, f: impl FnOnce(&mut Tenant)) -> Arc<Tenant> {
        let mut t = Tenant {
            name: name.to_string(),
            path: format!("/{name}/"),
            runtime: Some("/bin/sh".to_string()),
            server: Some("-c".to_string()),
            args: Some(vec!["exec sleep 30".to_string()]),
            ..Tenant::default()
        };
        f(&mut t);
        Arc::new(t)
    }

    fn test_pool(start_port: u16, f: impl FnOnce(&mut PoolConfig)) -> Arc<AppPool> {
        let mut config = PoolConfig {
            start_port,
            port_range: 20,
            // No probe target in these tests; close the latch immediately.
            starter: StarterConfig {
                readiness_deadline: Duration::from_millis(0),
                ..StarterConfig::default()
            },
            ..PoolConfig::default()
        };
        f(&mut config);
        AppPool::new(config)
    }

    fn sh_hook(script: &str) -> HookConfig {
        HookConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            timeout: None,
            reload_config: None,
        }
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_backend() {
        let pool = test_pool(29600, |_| {});
        let tenant = sleeper_tenant("demo", |_| {});

        let (a, b) = tokio::join!(pool.get_or_start(&tenant), pool.get_or_start(&tenant));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.port, b.port);
        assert_eq!(pool.len(), 1);

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn spawn_failure_is_isolated_and_leaves_no_entry() {
        let pool = test_pool(29630, |_| {});
        let broken = sleeper_tenant("broken", |t| {
            t.runtime = Some("/nonexistent/interpreter".to_string());
        });
        let healthy = sleeper_tenant("healthy", |_| {});

        assert!(pool.get_or_start(&broken).await.is_err());
        assert!(pool.get(&broken.name).is_none());

        // The failure did not poison the pool for other tenants.
        let app = pool.get_or_start(&healthy).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&healthy.name).is_some());
        drop(app);

        pool.cleanup(None).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn idle_backend_is_evicted_and_port_released() {
        let pool = test_pool(29660, |c| {
            c.idle_timeout = Duration::from_millis(50);
            c.eviction_check_interval = Duration::from_millis(25);
        });
        let tenant = sleeper_tenant("sleepy", |_| {});
        let app = pool.get_or_start(&tenant).await.unwrap();
        let pid = app.pid.load(Ordering::SeqCst) as i32;
        assert!(pid > 0);

        let deadline = Instant::now() + Duration::from_secs(3);
        while pool.get(&tenant.name).is_some() {
            assert!(Instant::now() < deadline, "app was not evicted in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Port is reusable afterwards.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
        let again = pool.get_or_start(&tenant).await.unwrap();
        assert_eq!(again.port, app.port);

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn zero_idle_timeout_disables_eviction() {
        let pool = test_pool(29690, |c| {
            c.idle_timeout = Duration::from_millis(0);
            c.eviction_check_interval = Duration::from_millis(20);
        });
        let tenant = sleeper_tenant("immortal", |_| {});
        pool.get_or_start(&tenant).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.get(&tenant.name).is_some());

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn open_websockets_block_eviction() {
        let pool = test_pool(29720, |c| {
            c.idle_timeout = Duration::from_millis(50);
            c.eviction_check_interval = Duration::from_millis(25);
        });
        let tenant = sleeper_tenant("chat", |_| {});
        let app = pool.get_or_start(&tenant).await.unwrap();

        let counter = app.websocket_counter();
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pool.get(&tenant.name).is_some(), "live websocket must pin the app");

        counter.fetch_sub(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(3);
        while pool.get(&tenant.name).is_some() {
            assert!(Instant::now() < deadline, "app was not evicted after websocket closed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn request_mid_stop_hook_rescues_the_app() {
        let dir = camino_tempfile::tempdir().unwrap();
        let start_marker = dir.path().join("starts");

        let pool = test_pool(29750, |c| {
            c.idle_timeout = Duration::from_millis(100);
            c.eviction_check_interval = Duration::from_millis(50);
        });
        let tenant = sleeper_tenant("phoenix", |t| {
            t.hooks.start = vec![sh_hook(&format!("printf s >> {start_marker}"))];
            t.hooks.stop = vec![sh_hook("sleep 0.5")];
        });

        let app = pool.get_or_start(&tenant).await.unwrap();
        let ws_before = app.active_websockets();

        // Let the eviction begin and land inside the slow stop hook.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(app.is_stopping(), "eviction should be mid-stop-hook by now");

        let rescued = pool.get_or_start(&tenant).await.unwrap();
        assert!(Arc::ptr_eq(&app, &rescued));
        assert!(!app.is_stopping());

        // After the hook finishes the loop notices the rescue and re-runs
        // the start hooks instead of killing the backend.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let current = pool.get(&tenant.name).expect("app must survive the rescue");
        assert!(Arc::ptr_eq(&app, &current));
        assert_eq!(app.active_websockets(), ws_before);
        assert_eq!(
            std::fs::read_to_string(&start_marker).unwrap(),
            "ss",
            "start hooks must run once at spawn and once after the rescue"
        );

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn oom_killed_backend_is_removed_without_stop_hooks() {
        let dir = camino_tempfile::tempdir().unwrap();
        let stop_marker = dir.path().join("stopped");

        let pool = test_pool(29780, |c| {
            c.idle_timeout = Duration::from_secs(3600);
            c.eviction_check_interval = Duration::from_millis(25);
        });
        let tenant = sleeper_tenant("hungry", |t| {
            t.hooks.stop = vec![sh_hook(&format!("touch {stop_marker}"))];
        });
        let app = pool.get_or_start(&tenant).await.unwrap();

        // Simulate the kernel's view: a cgroup whose events file reports an
        // OOM kill.
        let cgroup = dir.path().join("cg");
        std::fs::create_dir_all(&cgroup).unwrap();
        std::fs::write(cgroup.join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        *app.cgroup_path.lock().unwrap() = Some(cgroup);

        let deadline = Instant::now() + Duration::from_secs(3);
        while pool.get(&tenant.name).is_some() {
            assert!(Instant::now() < deadline, "OOM-killed app was not removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.oom_kill_total(&tenant.name), 1);
        assert!(!stop_marker.as_std_path().exists(), "no graceful stop after OOM");

        pool.cleanup(None).await;
    }

    #[tokio::test]
    async fn cleanup_stops_all_backends() {
        let pool = test_pool(29810, |_| {});
        let a = pool
            .get_or_start(&sleeper_tenant("a", |_| {}))
            .await
            .unwrap();
        let b = pool
            .get_or_start(&sleeper_tenant("b", |_| {}))
            .await
            .unwrap();
        let pids: Vec<i32> = [&a, &b]
            .iter()
            .map(|app| app.pid.load(Ordering::SeqCst) as i32)
            .collect();

        pool.cleanup(Some(Duration::from_secs(2))).await;
        assert!(pool.is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        for pid in pids {
            assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
        }
    }
}
