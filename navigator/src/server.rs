//! The request orchestrator: one listener, one handler, and the per-request
//! state machine chaining rules → auth → static files → tenant dispatch →
//! proxy, with idle bookkeeping around everything.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use arc_swap::{ArcSwap, ArcSwapOption};
use camino::{Utf8Path, Utf8PathBuf};
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::auth::{AuthHandler, AuthOutcome};
use crate::config::ConfigSnapshot;
use crate::error::DispatchError;
use crate::fly_replay::{self, FlyEnv, ReplayDecision};
use crate::idle::{IdleSupervisor, RequestGuard};
use crate::proxy::{websocket, ProxySettings, ReverseProxy};
use crate::rules::RuleOutcome;
use crate::static_files::StaticFileHandler;
use crate::tenant::{self, pool::AppPool};

const BUILTIN_MAINTENANCE_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Service Unavailable</title></head>\n<body>\n<h1>We&rsquo;ll be right back</h1>\n<p>The application is starting up. Please retry in a moment.</p>\n</body>\n</html>\n";

/// Process-wide state shared by every request.
pub struct Navigator {
    config: ArcSwap<ConfigSnapshot>,
    config_path: Option<Utf8PathBuf>,
    pool: Arc<AppPool>,
    idle: Arc<IdleSupervisor>,
    proxy: ReverseProxy,
    auth: ArcSwapOption<AuthHandler>,
    statics: ArcSwap<StaticFileHandler>,
    fly: FlyEnv,
    /// WebSocket relay tasks; shutdown can wait for them.
    ws_connections: TaskTracker,
}

impl Navigator {
    pub fn new(
        snapshot: Arc<ConfigSnapshot>,
        config_path: Option<Utf8PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        let auth = match &snapshot.auth {
            Some(config) => Some(Arc::new(
                AuthHandler::from_config(config).context("loading auth configuration")?,
            )),
            None => None,
        };
        Ok(Arc::new(Navigator {
            pool: AppPool::new(snapshot.pool.clone()),
            idle: IdleSupervisor::new(snapshot.idle.clone()),
            proxy: ReverseProxy::new(),
            auth: ArcSwapOption::from(auth),
            statics: ArcSwap::from_pointee(StaticFileHandler::new(snapshot.static_files.clone())),
            fly: FlyEnv::from_process_env(),
            ws_connections: TaskTracker::new(),
            config: ArcSwap::from(snapshot),
            config_path,
        }))
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.load_full()
    }

    pub fn pool(&self) -> &Arc<AppPool> {
        &self.pool
    }

    pub fn idle_supervisor(&self) -> &Arc<IdleSupervisor> {
        &self.idle
    }

    /// Re-read the configuration file and adopt the new snapshot. A parse
    /// error keeps the old snapshot in place.
    pub fn reload(&self) -> anyhow::Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("no configuration file to reload from");
        };
        let snapshot = ConfigSnapshot::load(path)?;
        self.adopt(snapshot)
    }

    /// Atomically swap in a new snapshot. In-flight backends keep running
    /// with their old settings; new requests see the new config.
    pub fn adopt(&self, snapshot: Arc<ConfigSnapshot>) -> anyhow::Result<()> {
        let auth = match &snapshot.auth {
            Some(config) => Some(Arc::new(
                AuthHandler::from_config(config).context("loading auth configuration")?,
            )),
            None => None,
        };
        self.pool.update_config(snapshot.pool.clone());
        self.idle.update_config(snapshot.idle.clone());
        self.statics
            .store(Arc::new(StaticFileHandler::new(snapshot.static_files.clone())));
        self.auth.store(auth);
        self.config.store(snapshot);
        info!("configuration reloaded");
        Ok(())
    }

    /// Entry point for every accepted request.
    pub async fn handle(self: &Arc<Self>, mut req: Request<Body>, client_ip: IpAddr) -> Response<Body> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string();
        req.headers_mut().insert(
            "x-request-id",
            HeaderValue::from_str(&request_id).expect("uuid is ascii"),
        );
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let span = info_span!("request", id = %request_id, peer = %client_ip);
        let guard = self.idle.request_guard().await;
        let (response, tenant) = self.dispatch(req, client_ip, guard).instrument(span).await;

        info!(
            %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            tenant = tenant.as_deref().unwrap_or("-"),
            request_id = %request_id,
            "request completed"
        );
        response
    }

    async fn dispatch(
        self: &Arc<Self>,
        mut req: Request<Body>,
        client_ip: IpAddr,
        guard: RequestGuard,
    ) -> (Response<Body>, Option<String>) {
        let snapshot = self.config();
        let settings = snapshot.proxy.clone();

        let method = req.method().clone();
        match snapshot.rules.evaluate(req.uri().path(), &method) {
            RuleOutcome::Redirect { location } => return (redirect_response(&location), None),
            RuleOutcome::FlyReplay { target, status } => {
                // The edge already replayed this request to us; emitting
                // another replay would bounce it forever.
                if fly_replay::is_replay_loop(&req, &self.fly) {
                    return (self.maintenance_page(&snapshot).await, None);
                }
                let response = match fly_replay::decide(
                    &req,
                    &target,
                    status,
                    &self.fly,
                    snapshot.listen.port(),
                ) {
                    ReplayDecision::Reply(response) => response,
                    ReplayDecision::Fallback { target } => self
                        .proxy
                        .forward(req, &target, client_ip, &settings)
                        .await
                        .unwrap_or_else(|e| e.into_response()),
                    ReplayDecision::Unavailable => DispatchError::BadGateway(anyhow!(
                        "request body exceeds the replay limit and no fallback target exists"
                    ))
                    .into_response(),
                };
                return (response, None);
            }
            RuleOutcome::Rewritten { path } => rewrite_request_path(&mut req, &path),
            RuleOutcome::PassThrough => {}
        }
        let path = req.uri().path().to_string();

        if let Some(auth) = self.auth.load_full() {
            if !auth.is_public(&path) {
                match auth.authenticate(&req) {
                    AuthOutcome::Granted(_principal) => {}
                    AuthOutcome::Denied(response) => return (*response, None),
                }
            }
        }

        if let Some(response) = self.statics.load_full().try_serve(&method, &path).await {
            return (response, None);
        }

        let Some(tenant) = tenant::resolve(&snapshot.tenants, &path) else {
            return (DispatchError::UnknownTenant(path).into_response(), None);
        };
        let tenant_name = tenant.name.clone();

        let app = match self.pool.get_or_start(tenant).await {
            Ok(app) => app,
            Err(e) => {
                return (
                    DispatchError::BackendUnavailable(e).into_response(),
                    Some(tenant_name),
                )
            }
        };

        // Wait for the shared spawn; a slow start falls through to the
        // maintenance page while the backend keeps coming up.
        let deadline = snapshot.startup_timeout_for(tenant);
        if tokio::time::timeout(deadline, app.readiness.wait()).await.is_err() {
            return (self.maintenance_page(&snapshot).await, Some(tenant_name));
        }

        if websocket::is_upgrade_request(&req) {
            let counter = tenant
                .should_track_websockets(snapshot.pool.track_websockets)
                .then(|| app.websocket_counter());
            // The relay task owns the request lifetime from here.
            let response = websocket::proxy_upgrade(
                req,
                &format!("localhost:{}", app.port),
                client_ip,
                &settings,
                counter,
                &self.ws_connections,
                guard,
            )
            .await
            .unwrap_or_else(|e| e.into_response());
            return (response, Some(tenant_name));
        }

        let target = format!("http://localhost:{}", app.port);
        match self.proxy.forward(req, &target, client_ip, &settings).await {
            Ok(response) => (guard.attach_to_response(response), Some(tenant_name)),
            Err(e) => (e.into_response(), Some(tenant_name)),
        }
    }

    async fn maintenance_page(&self, snapshot: &ConfigSnapshot) -> Response<Body> {
        let html = match &snapshot.maintenance_page {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .unwrap_or_else(|_| BUILTIN_MAINTENANCE_PAGE.to_string()),
            None => BUILTIN_MAINTENANCE_PAGE.to_string(),
        };
        let mut response = Response::new(Body::from(html));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        response
    }

    /// Graceful teardown: stop accepting (caller), drain the pool, wait for
    /// WebSocket relays.
    pub async fn shutdown(&self, grace: Option<std::time::Duration>) {
        self.pool.cleanup(grace).await;
        self.ws_connections.close();
        self.ws_connections.wait().await;
    }
}

fn redirect_response(location: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}

/// Swap the request path, keeping the original query string.
fn rewrite_request_path(req: &mut Request<Body>, new_path: &str) {
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    if let Ok(uri) = format!("{new_path}{query}").parse() {
        *req.uri_mut() = uri;
    }
}

/// Serve until `shutdown` fires. The listener should already be bound; we
/// only flip it to non-blocking for tokio.
pub async fn serve(
    navigator: Arc<Navigator>,
    listener: std::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    listener
        .set_nonblocking(true)
        .context("setting listener non-blocking")?;
    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let navigator = Arc::clone(&navigator);
        let client_ip = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let navigator = Arc::clone(&navigator);
                async move { Ok::<_, Infallible>(navigator.handle(req, client_ip).await) }
            }))
        }
    });
    hyper::Server::from_tcp(listener)
        .context("binding HTTP server")?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled())
        .await
        .context("serving HTTP")?;
    Ok(())
}

/// Record our PID so `--send-reload` can find us.
pub fn write_pid_file(path: &Utf8Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("writing PID file {path}"))
}

pub fn remove_pid_file(path: &Utf8Path) {
    let _ = std::fs::remove_file(path);
}

/// Ask a running navigator (found via its PID file) to reload its config.
pub fn send_reload_signal(pid_file: &Utf8Path) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(pid_file)
        .with_context(|| format!("reading PID file {pid_file}"))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("PID file {pid_file} does not contain a PID"))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP)
        .with_context(|| format!("signalling pid {pid}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

    fn navigator_from(config: &str) -> Arc<Navigator> {
        let snapshot = ConfigSnapshot::parse_and_validate(config).unwrap();
        Navigator::new(snapshot, None).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_tenant_is_a_404() {
        let navigator = navigator_from("");
        let response = navigator.handle(get("/nowhere"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trailing_slash_redirects_to_the_scope() {
        let navigator = navigator_from(
            r#"
root_path = "/showcase"
[[tenants]]
name = "raleigh"
path = "/showcase/2025/raleigh/"
"#,
        );
        let response = navigator.handle(get("/showcase/2025/raleigh"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/showcase/2025/raleigh/");
    }

    #[tokio::test]
    async fn rewrite_then_resolve_reaches_the_tenant_pool() {
        // The rewritten path resolves to a tenant whose backend cannot
        // spawn, which surfaces as a 502 and proves dispatch got there.
        let navigator = navigator_from(
            r#"
[pool]
start_port = 29850
port_range = 10

[[rewrite]]
pattern = "^/api/v1/(.*)"
replacement = "/v1/$1"
flag = "last"

[[tenants]]
name = "api"
path = "/v1/"
runtime = "/nonexistent/interpreter"
"#,
        );
        let response = navigator.handle(get("/api/v1/users"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn fly_replay_rule_emits_the_header() {
        let navigator = navigator_from(
            r#"
[[rewrite]]
pattern = "^/heavy"
replacement = "/heavy"
flag = "fly-replay:app=compute:307"
"#,
        );
        let response = navigator.handle(get("/heavy"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()["fly-replay"], "app=compute");
    }

    #[tokio::test]
    async fn oversize_fly_replay_without_fly_env_is_a_502() {
        let navigator = navigator_from(
            r#"
[[rewrite]]
pattern = "^/heavy"
replacement = "/heavy"
flag = "fly-replay:app=compute:307"
"#,
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/heavy")
            .header("content-length", "2000000")
            .body(Body::empty())
            .unwrap();
        let response = navigator.handle(req, CLIENT).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unready_backend_gets_the_maintenance_page() {
        // The sleeper never answers its health check and the readiness
        // deadline is far away, so the request-side startup timeout expires
        // and serves the 503 page.
        let navigator = navigator_from(
            r#"
[pool]
start_port = 29870
port_range = 10
startup_timeout = "100ms"
readiness_deadline = "30s"

[[tenants]]
name = "slow"
path = "/slow/"
runtime = "/bin/sh"
server = "-c"
args = ["exec sleep 30"]
"#,
        );
        let response = navigator.handle(get("/slow/page"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["content-type"], "text/html");

        navigator.shutdown(Some(Duration::from_millis(500))).await;
    }

    #[tokio::test]
    async fn static_files_win_over_tenants() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "static!").unwrap();
        let navigator = navigator_from(&format!(
            r#"
[static]
enabled = true
public_root = "{root}"

[[tenants]]
name = "app"
path = "/"
"#,
            root = dir.path()
        ));
        let response = navigator.handle(get("/index.html"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"static!");
    }

    #[tokio::test]
    async fn idle_accounting_returns_to_baseline() {
        let navigator = navigator_from("");
        let idle = Arc::clone(navigator.idle_supervisor());
        assert_eq!(idle.active_requests().await, 0);
        let _ = navigator.handle(get("/nowhere"), CLIENT).await;
        // The guard finishes asynchronously on drop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(idle.active_requests().await, 0);
    }

    #[tokio::test]
    async fn reload_swaps_the_snapshot_for_new_requests() {
        let navigator = navigator_from("");
        assert_eq!(
            navigator.handle(get("/v2/x"), CLIENT).await.status(),
            StatusCode::NOT_FOUND
        );
        let next = ConfigSnapshot::parse_and_validate(
            r#"
[[rewrite]]
pattern = "^/v2/(.*)"
replacement = "/gone/$1"
flag = "redirect"
"#,
        )
        .unwrap();
        navigator.adopt(next).unwrap();
        let response = navigator.handle(get("/v2/x"), CLIENT).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/gone/x");
    }

    #[tokio::test]
    async fn pid_file_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("navigator.pid");
        write_pid_file(&pid_file).unwrap();
        let written: u32 = std::fs::read_to_string(&pid_file).unwrap().parse().unwrap();
        assert_eq!(written, std::process::id());
        // A garbage PID file must not signal anyone.
        std::fs::write(&pid_file, "not-a-pid").unwrap();
        assert!(send_reload_signal(&pid_file).is_err());
        remove_pid_file(&pid_file);
        assert!(!pid_file.as_std_path().exists());
    }
}
