//! Fly-Replay responses: telling the edge to re-issue a request on another
//! machine instead of proxying it here.
//!
//! The edge only replays bodies up to a size limit, so a request with a
//! large (or unsized) body falls back to reverse-proxying straight at the
//! target over the private network. A replay that has already bounced back
//! to this machine is detected via `fly-replay-src` and answered with the
//! maintenance page instead of looping.

use hyper::header::HeaderValue;
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{debug, info};

use crate::rules::ReplayTarget;

/// Bodies above this are not replayed by the edge.
pub const MAX_FLY_REPLAY_SIZE: u64 = 1024 * 1024;

/// Environment the emitter consults; read once per snapshot so tests can
/// inject values.
#[derive(Debug, Clone, Default)]
pub struct FlyEnv {
    pub app_name: Option<String>,
    pub machine_id: Option<String>,
}

impl FlyEnv {
    pub fn from_process_env() -> Self {
        FlyEnv {
            app_name: std::env::var("FLY_APP_NAME").ok().filter(|s| !s.is_empty()),
            machine_id: std::env::var("FLY_MACHINE_ID").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// What the orchestrator should do for a matched fly-replay rule.
#[derive(Debug)]
pub enum ReplayDecision {
    /// Emit this response; the edge re-issues the request elsewhere.
    Reply(Response<Body>),
    /// Body too large for a replay: reverse-proxy at this target instead.
    Fallback { target: String },
    /// No replay and no fallback possible.
    Unavailable,
}

/// The edge has already replayed this request to us; answering with another
/// replay would loop.
pub fn is_replay_loop<B>(req: &Request<B>, env: &FlyEnv) -> bool {
    let Some(source) = req
        .headers()
        .get("fly-replay-src")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    match &env.machine_id {
        Some(machine) => source.contains(machine.as_str()),
        None => false,
    }
}

pub fn decide<B>(
    req: &Request<B>,
    target: &ReplayTarget,
    status: u16,
    env: &FlyEnv,
    listen_port: u16,
) -> ReplayDecision {
    if replayable_body(req) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
        let value = target.header_value();
        info!(target = %value, %status, "emitting fly-replay");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        response.headers_mut().insert(
            "fly-replay",
            HeaderValue::from_str(&value).expect("replay targets are ascii"),
        );
        return ReplayDecision::Reply(response);
    }

    // The edge will not carry this body; go there ourselves.
    match fallback_target(target, env, listen_port) {
        Some(fallback) => {
            debug!(target = %fallback, "fly-replay body too large, proxying to target");
            ReplayDecision::Fallback { target: fallback }
        }
        None => ReplayDecision::Unavailable,
    }
}

/// A request can be replayed when it has no body, or a body with a known
/// `Content-Length` of at most [`MAX_FLY_REPLAY_SIZE`].
fn replayable_body<B>(req: &Request<B>) -> bool {
    let body_bearing = matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if !body_bearing {
        return true;
    }
    match req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(length) => length <= MAX_FLY_REPLAY_SIZE,
        // Unsized body on a body-bearing method: not replayable.
        None => false,
    }
}

/// Private-network URL for the replay target. Requires a Fly environment
/// (`FLY_APP_NAME` present); region targets additionally need it to name
/// the app to address within the region.
fn fallback_target(target: &ReplayTarget, env: &FlyEnv, listen_port: u16) -> Option<String> {
    let app_name = env.app_name.as_deref()?;
    match target {
        ReplayTarget::App(app) => Some(format!("http://{app}.internal:{listen_port}")),
        ReplayTarget::Region(region) => {
            Some(format!("http://{region}.{app_name}.internal:{listen_port}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fly_env() -> FlyEnv {
        FlyEnv {
            app_name: Some("navigator".to_string()),
            machine_id: Some("e28650dd".to_string()),
        }
    }

    fn post_with_length(length: u64) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/heavy")
            .header("content-length", length.to_string())
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn small_bodies_are_replayed_with_the_header() {
        let req = post_with_length(2_000);
        let target = ReplayTarget::App("compute".to_string());
        match decide(&req, &target, 307, &fly_env(), 3000) {
            ReplayDecision::Reply(resp) => {
                assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
                assert_eq!(resp.headers()["fly-replay"], "app=compute");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn bodyless_methods_always_replay() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/anywhere")
            .body(Body::empty())
            .unwrap();
        let target = ReplayTarget::Region("syd".to_string());
        match decide(&req, &target, 302, &fly_env(), 3000) {
            ReplayDecision::Reply(resp) => {
                assert_eq!(resp.status(), StatusCode::FOUND);
                assert_eq!(resp.headers()["fly-replay"], "region=syd");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn oversize_body_falls_back_to_proxying() {
        let req = post_with_length(2_000_000);
        let target = ReplayTarget::App("compute".to_string());
        match decide(&req, &target, 307, &fly_env(), 3000) {
            ReplayDecision::Fallback { target } => {
                assert_eq!(target, "http://compute.internal:3000");
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn missing_content_length_on_post_falls_back() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/stream")
            .body(Body::empty())
            .unwrap();
        let target = ReplayTarget::Region("fra".to_string());
        match decide(&req, &target, 307, &fly_env(), 3000) {
            ReplayDecision::Fallback { target } => {
                assert_eq!(target, "http://fra.navigator.internal:3000");
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn no_fly_environment_means_unavailable() {
        let req = post_with_length(2_000_000);
        let target = ReplayTarget::App("compute".to_string());
        match decide(&req, &target, 307, &FlyEnv::default(), 3000) {
            ReplayDecision::Unavailable => {}
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn replay_loop_detection_matches_the_machine_id() {
        let mut req = post_with_length(10);
        assert!(!is_replay_loop(&req, &fly_env()));
        req.headers_mut().insert(
            "fly-replay-src",
            "instance=e28650dd;state=started".parse().unwrap(),
        );
        assert!(is_replay_loop(&req, &fly_env()));
        assert!(!is_replay_loop(&req, &FlyEnv::default()));

        req.headers_mut().insert(
            "fly-replay-src",
            "instance=other;state=started".parse().unwrap(),
        );
        assert!(!is_replay_loop(&req, &fly_env()));
    }
}
