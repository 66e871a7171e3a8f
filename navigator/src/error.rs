//! Errors surfaced by the request path, and their mapping onto HTTP
//! responses.

use hyper::{Body, Response, StatusCode};
use thiserror::Error;
use tracing::error;

/// Failures that can end a request before (or instead of) a backend
/// response. Each kind pins down the status code the client sees, so the
/// orchestrator never has to guess.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No tenant owns the requested path.
    #[error("no tenant matches path {0:?}")]
    UnknownTenant(String),

    /// The client request was malformed in a way we refuse to forward.
    #[error("bad request: {0}")]
    BadRequest(anyhow::Error),

    /// Port exhaustion, spawn failure: the backend cannot exist right now.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(anyhow::Error),

    /// The backend exists but refuses connections (after any retries).
    #[error("bad gateway: {0}")]
    BadGateway(anyhow::Error),

    /// Startup did not finish within the caller's deadline; the maintenance
    /// page is served instead.
    #[error("backend for tenant {0:?} is not ready")]
    NotReady(String),

    /// Anything else; never carries backend data.
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::UnknownTenant(_) => StatusCode::NOT_FOUND,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::BackendUnavailable(_) | DispatchError::BadGateway(_) => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the error and render the response the client gets. The body is a
    /// terse status-line text; backend details stay in the logs.
    pub fn into_response(self) -> Response<Body> {
        error!("request failed: {self:#}");
        let status = self.status();
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Body::from(format!(
                "{} {}\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )))
            .expect("building error response")
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
