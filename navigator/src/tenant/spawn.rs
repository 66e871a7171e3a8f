//! Spawning tenant backend processes.
//!
//! Builds the argv and environment, applies credentials and memory limits,
//! wires child output into our log stream, launches the process under a
//! cancellation token, runs start hooks, and probes the backend over HTTP
//! until it responds or the readiness deadline passes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use hyper::{Body, Request};
use tracing::{debug, info, warn};

use crate::child_logs;
use crate::hooks;
use crate::tenant::cgroup::CgroupManager;
use crate::tenant::{Tenant, TenantHooks, WebApp};

/// Hard defaults used when neither the tenant nor the framework section of
/// the config names an invocation.
pub const DEFAULT_RUNTIME: &str = "ruby";
pub const DEFAULT_SERVER: &str = "bin/rails";

pub const READINESS_PROBE_INTERVAL: Duration = Duration::from_millis(500);
pub const READINESS_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_READINESS_DEADLINE: Duration = Duration::from_secs(30);

/// Fleet-wide invocation defaults, between tenant overrides and the hard
/// defaults in precedence.
#[derive(Debug, Clone, Default)]
pub struct FrameworkDefaults {
    pub runtime: Option<String>,
    pub server: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StarterConfig {
    pub framework: FrameworkDefaults,
    /// Default tenant hooks run before each tenant's own hooks.
    pub default_tenant_hooks: TenantHooks,
    pub readiness_deadline: Duration,
    pub cgroup_root: Utf8PathBuf,
    pub cgroup_strict: bool,
}

impl Default for StarterConfig {
    fn default() -> Self {
        StarterConfig {
            framework: FrameworkDefaults::default(),
            default_tenant_hooks: TenantHooks::default(),
            readiness_deadline: DEFAULT_READINESS_DEADLINE,
            cgroup_root: Utf8PathBuf::from(crate::tenant::cgroup::DEFAULT_CGROUP_ROOT),
            cgroup_strict: false,
        }
    }
}

/// Replace `{{port}}` anywhere in the argument list.
pub fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter().map(|a| a.replace("{{port}}", &port)).collect()
}

/// The resolved invocation for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub runtime: String,
    pub server: String,
    pub args: Vec<String>,
}

pub fn resolve_invocation(tenant: &Tenant, framework: &FrameworkDefaults, port: u16) -> Invocation {
    let runtime = tenant
        .runtime
        .clone()
        .or_else(|| framework.runtime.clone())
        .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
    let server = tenant
        .server
        .clone()
        .or_else(|| framework.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let args = tenant
        .args
        .clone()
        .or_else(|| framework.args.clone())
        .unwrap_or_else(|| {
            vec![
                "server".to_string(),
                "-b".to_string(),
                "0.0.0.0".to_string(),
                "-p".to_string(),
                "{{port}}".to_string(),
            ]
        });
    Invocation {
        runtime,
        server,
        args: substitute_port(&args, port),
    }
}

/// Child environment: parent env, then `PORT`, then the tenant env (tenant
/// wins on collision).
pub fn build_child_env(tenant: &Tenant, port: u16) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert("PORT".to_string(), port.to_string());
    for (k, v) in &tenant.env {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Kill whatever a stale PID file points at and delete the file: SIGTERM,
/// 100 ms of grace, then SIGKILL.
pub async fn remove_stale_pid_file(path: &Utf8PathBuf) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    if let Ok(pid) = contents.trim().parse::<i32>() {
        let pid = nix::unistd::Pid::from_raw(pid);
        if nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).is_ok() {
            info!(%path, %pid, "terminating stale process from PID file");
            tokio::time::sleep(Duration::from_millis(100)).await;
            // Signal 0 probes liveness.
            if nix::sys::signal::kill(pid, None).is_ok() {
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
    if let Err(e) = std::fs::remove_file(path) {
        warn!("could not remove stale PID file {path}: {e}");
    }
}

/// Launch the backend for `app`: spawn the process, run start hooks, and
/// kick off the readiness probe. Spawn errors are synchronous (the caller
/// deregisters the app); the probe itself runs in the background and closes
/// the readiness latch when the backend responds or the deadline passes, so
/// callers wait on [`WebApp::readiness`] with their own timeout.
pub async fn start_backend(
    app: &Arc<WebApp>,
    conf: &StarterConfig,
    tracker: &tokio_util::task::TaskTracker,
) -> anyhow::Result<()> {
    let tenant = &app.tenant;
    let port = app.port;

    if let Some(pidfile) = tenant.env.get("PIDFILE") {
        remove_stale_pid_file(&Utf8PathBuf::from(pidfile)).await;
    }

    let invocation = resolve_invocation(tenant, &conf.framework, port);
    let env = build_child_env(tenant, port);

    let mut cmd = if invocation.runtime.is_empty() {
        tokio::process::Command::new(&invocation.server)
    } else {
        let mut c = tokio::process::Command::new(&invocation.runtime);
        c.arg(&invocation.server);
        c
    };
    cmd.args(&invocation.args)
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !tenant.root.as_str().is_empty() {
        cmd.current_dir(&tenant.root);
    }

    let is_root = nix::unistd::geteuid().is_root();

    // Own process group, so cancellation can take the whole tree down.
    cmd.process_group(0);

    if is_root {
        apply_credentials(&mut cmd, tenant)?;
    }

    let cgroup_path = if is_root && cfg!(target_os = "linux") {
        match tenant.memory_limit {
            Some(limit) if limit > 0 => {
                CgroupManager::new(conf.cgroup_root.clone(), conf.cgroup_strict)
                    .create(&tenant.name, limit)?
            }
            _ => None,
        }
    } else {
        None
    };

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "spawning backend for tenant {:?}: {} {} {:?}",
            tenant.name, invocation.runtime, invocation.server, invocation.args
        )
    })?;
    let pid = child.id().unwrap_or(0);
    app.pid.store(pid as u64, Ordering::SeqCst);
    info!(tenant = %tenant.name, port, pid, "started backend process");

    if let Some(cgroup) = &cgroup_path {
        if let Err(e) = CgroupManager::attach(cgroup, pid) {
            warn!(tenant = %tenant.name, "could not attach backend to cgroup: {e:#}");
        }
        *app.cgroup_path.lock().unwrap() = Some(cgroup.clone());
    }

    if let Some(stdout) = child.stdout.take() {
        child_logs::spawn_forwarder(tenant.name.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        child_logs::spawn_forwarder(tenant.name.clone(), "stderr", stderr);
    }

    supervise(child, app, tracker);

    run_start_hooks(app, conf).await;

    let probe_app = Arc::clone(app);
    let deadline = conf.readiness_deadline;
    tokio::spawn(async move {
        probe_readiness(&probe_app, deadline).await;
        probe_app.mark_ready();
    });
    Ok(())
}

/// Start hooks: default tenant hooks first, then the tenant's own. Failures
/// are logged; the app may still work without them.
pub async fn run_start_hooks(app: &Arc<WebApp>, conf: &StarterConfig) {
    let env = build_child_env(&app.tenant, app.port);
    for (hooks, kind) in [
        (&conf.default_tenant_hooks.start, "tenant-start"),
        (&app.tenant.hooks.start, "tenant-start"),
    ] {
        if let Err(e) = hooks::execute(hooks, &env, kind, None).await {
            warn!(tenant = %app.tenant.name, "start hook failed: {e:#}");
        }
    }
}

fn apply_credentials(cmd: &mut tokio::process::Command, tenant: &Tenant) -> anyhow::Result<()> {
    let Some(user_name) = &tenant.user else {
        return Ok(());
    };
    let user = nix::unistd::User::from_name(user_name)
        .with_context(|| format!("looking up user {user_name:?}"))?
        .with_context(|| format!("unknown user {user_name:?}"))?;
    let gid = match &tenant.group {
        Some(group_name) => nix::unistd::Group::from_name(group_name)
            .with_context(|| format!("looking up group {group_name:?}"))?
            .with_context(|| format!("unknown group {group_name:?}"))?
            .gid,
        None => user.gid,
    };
    cmd.uid(user.uid.as_raw());
    cmd.gid(gid.as_raw());
    Ok(())
}

/// One task per managed process: waits for exit, or kills the process group
/// when the app's cancellation token fires. Tracked so pool cleanup can
/// wait for children to be reaped.
fn supervise(
    mut child: tokio::process::Child,
    app: &Arc<WebApp>,
    tracker: &tokio_util::task::TaskTracker,
) {
    let cancel = app.process_cancel.clone();
    let tenant = app.tenant.name.clone();
    tracker.spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(tenant = %tenant, %status, "backend exited"),
                    Err(e) => warn!(tenant = %tenant, "error waiting for backend: {e}"),
                }
            }
            _ = cancel.cancelled() => {
                if let Some(pid) = child.id() {
                    let pgid = nix::unistd::Pid::from_raw(-(pid as i32));
                    let _ = nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGTERM);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGKILL);
                }
                let _ = child.kill().await;
                let _ = child.wait().await;
                info!(tenant = %tenant, "backend stopped");
            }
        }
    });
}

/// GET the health-check endpoint every 500 ms until any HTTP response comes
/// back (status irrelevant, a 500 still means "listening") or the deadline
/// passes. The deadline does not fail the start; slow apps proceed and the
/// orchestrator's own timeout decides what the client sees.
async fn probe_readiness(app: &Arc<WebApp>, deadline: Duration) {
    let url = format!(
        "http://localhost:{}{}",
        app.port,
        app.tenant.health_check_path()
    );
    let client = hyper::Client::new();
    let give_up_at = tokio::time::Instant::now() + deadline;

    loop {
        let request = Request::get(url.as_str())
            .body(Body::empty())
            .expect("probe uri");
        match tokio::time::timeout(READINESS_PROBE_TIMEOUT, client.request(request)).await {
            Ok(Ok(response)) => {
                debug!(tenant = %app.tenant.name, status = %response.status(), "backend is ready");
                return;
            }
            Ok(Err(e)) => debug!(tenant = %app.tenant.name, "readiness probe: {e}"),
            Err(_) => debug!(tenant = %app.tenant.name, "readiness probe timed out"),
        }
        if tokio::time::Instant::now() + READINESS_PROBE_INTERVAL >= give_up_at {
            warn!(
                tenant = %app.tenant.name,
                "readiness deadline passed, proceeding without a probe response"
            );
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(READINESS_PROBE_INTERVAL) => {}
            _ = app.process_cancel.cancelled() => return,
        }
    }
}
