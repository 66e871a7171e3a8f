//! Machine-wide idle supervision.
//!
//! Counts in-flight requests; once the process has been quiet for the
//! configured period it runs the `idle` hooks and signals the host to
//! suspend (`SIGTSTP`) or stop (`SIGTERM`) the whole process. The first
//! request after an idle action runs the `resume` hooks; requests arriving
//! while the resume hooks run wait for them to finish before processing.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hooks::{self, HookConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleAction {
    /// Run the hooks but send no signal.
    #[default]
    None,
    /// `SIGTSTP` to self: hypervisor-style suspend.
    Suspend,
    /// `SIGTERM` to self: graceful stop.
    Stop,
}

#[derive(Debug, Clone, Default)]
pub struct IdleConfig {
    pub action: IdleAction,
    /// Zero disables idle supervision.
    pub timeout: Duration,
    pub idle_hooks: Vec<HookConfig>,
    pub resume_hooks: Vec<HookConfig>,
}

struct IdleState {
    active_requests: u64,
    last_activity: Instant,
    /// An idle action has fired; the next request must resume first.
    idle_actioned: bool,
    resuming: bool,
    /// Cancel handle of the scheduled idle timer, if any.
    timer: Option<CancellationToken>,
}

pub struct IdleSupervisor {
    state: tokio::sync::Mutex<IdleState>,
    config: RwLock<Arc<IdleConfig>>,
    /// True while the resume hooks run; `request_started` waits on it.
    resume_busy: (watch::Sender<bool>, watch::Receiver<bool>),
}

impl IdleSupervisor {
    pub fn new(config: IdleConfig) -> Arc<Self> {
        Arc::new(IdleSupervisor {
            state: tokio::sync::Mutex::new(IdleState {
                active_requests: 0,
                last_activity: Instant::now(),
                idle_actioned: false,
                resuming: false,
                timer: None,
            }),
            config: RwLock::new(Arc::new(config)),
            resume_busy: watch::channel(false),
        })
    }

    fn config(&self) -> Arc<IdleConfig> {
        Arc::clone(&self.config.read().unwrap())
    }

    pub fn update_config(&self, config: IdleConfig) {
        *self.config.write().unwrap() = Arc::new(config);
    }

    pub async fn active_requests(&self) -> u64 {
        self.state.lock().await.active_requests
    }

    #[cfg(test)]
    async fn is_idle_actioned(&self) -> bool {
        self.state.lock().await.idle_actioned
    }

    /// A request is entering the system. If an idle action has fired, the
    /// first arrival kicks off the resume hooks (and proceeds); everyone
    /// else arriving during the resume waits for it to complete.
    pub async fn request_started(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.idle_actioned {
            if state.resuming {
                let mut rx = self.resume_busy.1.clone();
                drop(state);
                while *rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                state = self.state.lock().await;
            } else {
                // `idle_actioned` stays set until the resume hooks are done,
                // so later arrivals take the waiting branch above.
                state.resuming = true;
                self.resume_busy.0.send_replace(true);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let config = this.config();
                    info!("first request after idle, running resume hooks");
                    if let Err(e) =
                        hooks::execute(&config.resume_hooks, &Default::default(), "resume", None)
                            .await
                    {
                        warn!("resume hook failed: {e:#}");
                    }
                    {
                        let mut state = this.state.lock().await;
                        state.resuming = false;
                        state.idle_actioned = false;
                    }
                    this.resume_busy.0.send_replace(false);
                });
            }
        }
        state.active_requests += 1;
        state.last_activity = Instant::now();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    /// A request has left the system. When the last one leaves, schedule
    /// the idle timer.
    pub async fn request_finished(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.active_requests = state.active_requests.saturating_sub(1);
        state.last_activity = Instant::now();
        let timeout = self.config().timeout;
        if state.active_requests == 0 && state.timer.is_none() && !timeout.is_zero() {
            let cancel = CancellationToken::new();
            state.timer = Some(cancel.clone());
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.idle_timer(timeout, cancel).await;
            });
        }
    }

    /// Hand out a guard that reports `request_finished` when dropped; the
    /// WebSocket path disarms it and takes over the accounting.
    pub async fn request_guard(self: &Arc<Self>) -> RequestGuard {
        self.request_started().await;
        RequestGuard {
            supervisor: Arc::clone(self),
            armed: true,
        }
    }

    async fn idle_timer(self: Arc<Self>, timeout: Duration, cancel: CancellationToken) {
        let mut wait = timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
            {
                let mut state = self.state.lock().await;
                if state.active_requests > 0 {
                    state.timer = None;
                    return;
                }
                let quiet_for = state.last_activity.elapsed();
                if quiet_for < timeout {
                    // Activity slipped in; sleep out the remainder.
                    wait = timeout - quiet_for;
                    continue;
                }
                state.idle_actioned = true;
                state.timer = None;
            }
            let config = self.config();
            info!(
                "idle for {}, running idle hooks",
                humantime::format_duration(timeout)
            );
            if let Err(e) =
                hooks::execute(&config.idle_hooks, &Default::default(), "idle", None).await
            {
                warn!("idle hook failed: {e:#}");
            }
            fire_action(config.action);
            return;
        }
    }
}

/// Guard returned by [`IdleSupervisor::request_guard`].
pub struct RequestGuard {
    supervisor: Arc<IdleSupervisor>,
    armed: bool,
}

impl RequestGuard {
    /// Transfer request accounting to someone else (the WebSocket relay).
    pub fn disarm(mut self) -> Arc<IdleSupervisor> {
        self.armed = false;
        Arc::clone(&self.supervisor)
    }

    /// Ride along with the response body: the request counts as in-flight
    /// until the body has fully streamed (or the client went away).
    pub fn attach_to_response(
        self,
        response: hyper::Response<hyper::Body>,
    ) -> hyper::Response<hyper::Body> {
        use futures::StreamExt;
        let (parts, body) = response.into_parts();
        let body = hyper::Body::wrap_stream(body.map(move |chunk| {
            let _ = &self;
            chunk
        }));
        hyper::Response::from_parts(parts, body)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.armed {
            let supervisor = Arc::clone(&self.supervisor);
            tokio::spawn(async move {
                supervisor.request_finished().await;
            });
        }
    }
}

#[cfg(unix)]
fn fire_action(action: IdleAction) {
    use nix::sys::signal::{kill, Signal};
    let signal = match action {
        IdleAction::None => {
            info!("idle action is none, nothing to signal");
            return;
        }
        IdleAction::Suspend => Signal::SIGTSTP,
        IdleAction::Stop => Signal::SIGTERM,
    };
    info!(signal = %signal, "machine idle, signalling self");
    if let Err(e) = kill(nix::unistd::Pid::this(), signal) {
        warn!("could not signal self: {e}");
    }
}

#[cfg(not(unix))]
fn fire_action(action: IdleAction) {
    match action {
        IdleAction::None => info!("idle action is none, nothing to signal"),
        IdleAction::Suspend => warn!("suspend is not supported on this platform"),
        IdleAction::Stop => {
            info!("machine idle, exiting");
            std::process::exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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
    async fn counter_returns_to_baseline() {
        let sup = IdleSupervisor::new(IdleConfig::default());
        assert_eq!(sup.active_requests().await, 0);
        sup.request_started().await;
        sup.request_started().await;
        assert_eq!(sup.active_requests().await, 2);
        sup.request_finished().await;
        sup.request_finished().await;
        assert_eq!(sup.active_requests().await, 0);
        // Clamped at zero even if finish outnumbers start.
        sup.request_finished().await;
        assert_eq!(sup.active_requests().await, 0);
    }

    #[tokio::test]
    async fn idle_hooks_fire_after_the_quiet_period() {
        let dir = camino_tempfile::tempdir().unwrap();
        let marker = dir.path().join("idled");
        let sup = IdleSupervisor::new(IdleConfig {
            action: IdleAction::None,
            timeout: Duration::from_millis(80),
            idle_hooks: vec![sh_hook(&format!("touch {marker}"))],
            resume_hooks: Vec::new(),
        });

        sup.request_started().await;
        sup.request_finished().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(marker.as_std_path().exists());
        assert!(sup.is_idle_actioned().await);
    }

    #[tokio::test]
    async fn new_request_cancels_the_idle_timer() {
        let dir = camino_tempfile::tempdir().unwrap();
        let marker = dir.path().join("idled");
        let sup = IdleSupervisor::new(IdleConfig {
            action: IdleAction::None,
            timeout: Duration::from_millis(100),
            idle_hooks: vec![sh_hook(&format!("touch {marker}"))],
            resume_hooks: Vec::new(),
        });

        sup.request_started().await;
        sup.request_finished().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Activity before the timer fires.
        sup.request_started().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.as_std_path().exists());
        sup.request_finished().await;
    }

    #[tokio::test]
    async fn zero_timeout_never_schedules_a_timer() {
        let sup = IdleSupervisor::new(IdleConfig::default());
        sup.request_started().await;
        sup.request_finished().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sup.is_idle_actioned().await);
    }

    #[tokio::test]
    async fn requests_during_resume_wait_for_the_hooks() {
        let dir = camino_tempfile::tempdir().unwrap();
        let resumed = dir.path().join("resumed");
        let sup = IdleSupervisor::new(IdleConfig {
            action: IdleAction::None,
            timeout: Duration::from_millis(50),
            idle_hooks: Vec::new(),
            resume_hooks: vec![sh_hook(&format!("sleep 0.3 && touch {resumed}"))],
        });

        // Go idle.
        sup.request_started().await;
        sup.request_finished().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.is_idle_actioned().await);

        // First arrival starts the resume hooks and proceeds.
        sup.request_started().await;
        assert!(!resumed.as_std_path().exists());

        // A follower must not begin until the resume hooks are done.
        let started_at = Instant::now();
        sup.request_started().await;
        assert!(resumed.as_std_path().exists());
        assert!(started_at.elapsed() >= Duration::from_millis(150));

        sup.request_finished().await;
        sup.request_finished().await;
    }
}
