//! Static file serving, consulted before tenant dispatch.
//!
//! Resolves GET/HEAD requests against a public root, with nginx-style
//! `try_files` extension probing. When disabled (or nothing matches) the
//! orchestrator carries on to tenant dispatch as if we were never here.

use camino::{Utf8Path, Utf8PathBuf};
use hyper::header::HeaderValue;
use hyper::{Body, Method, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    #[serde(default)]
    pub enabled: bool,
    pub public_root: Option<Utf8PathBuf>,
    /// Extensions appended when the literal path misses, e.g. `.html`.
    #[serde(default)]
    pub try_files: Vec<String>,
}

pub struct StaticFileHandler {
    config: StaticConfig,
}

impl StaticFileHandler {
    pub fn new(config: StaticConfig) -> Self {
        StaticFileHandler { config }
    }

    /// Serve `path` from the public root if something matches; `None` means
    /// "not served, keep dispatching".
    pub async fn try_serve(&self, method: &Method, path: &str) -> Option<Response<Body>> {
        if !self.config.enabled {
            return None;
        }
        let root = self.config.public_root.as_deref()?;
        if *method != Method::GET && *method != Method::HEAD {
            return None;
        }
        let relative = sanitize(path)?;

        let mut candidates = Vec::new();
        if path.ends_with('/') {
            candidates.push(root.join(&relative).join("index.html"));
        } else {
            candidates.push(root.join(&relative));
            for ext in &self.config.try_files {
                candidates.push(root.join(format!("{relative}{ext}")));
            }
        }

        for candidate in candidates {
            if let Some(response) = serve_file(&candidate, method).await {
                debug!(%candidate, "served static file");
                return Some(response);
            }
        }
        None
    }
}

/// Leading slash off, and refuse any path that escapes the root.
fn sanitize(path: &str) -> Option<String> {
    let relative = path.strip_prefix('/')?;
    if relative
        .split('/')
        .any(|segment| segment == ".." || segment.contains('\\') || segment.contains('\0'))
    {
        return None;
    }
    Some(relative.to_string())
}

async fn serve_file(path: &Utf8Path, method: &Method) -> Option<Response<Body>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let mime = mime_guess::from_path(path.as_std_path()).first_or_octet_stream();

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    response.headers_mut().insert(
        hyper::header::CONTENT_LENGTH,
        HeaderValue::from(metadata.len()),
    );
    if *method == Method::GET {
        let contents = tokio::fs::read(path).await.ok()?;
        *response.body_mut() = Body::from(contents);
    }
    Some(response)
}
