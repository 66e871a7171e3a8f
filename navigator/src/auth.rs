//! HTTP Basic authentication against an htpasswd file.
//!
//! Deliberately thin: the request path consults [`AuthHandler`] before
//! tenant dispatch, public paths skip it entirely, and an optional allow
//! list narrows which authenticated users get through.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use camino::Utf8PathBuf;
use hyper::header::HeaderValue;
use hyper::{Body, Request, Response, StatusCode};
use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::warn;

fn default_realm() -> String {
    "Restricted".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub htpasswd: Utf8PathBuf,
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Regex patterns for paths that skip authentication.
    #[serde(default)]
    pub public_paths: Vec<String>,
    /// When present, only these users are allowed even with a good password.
    #[serde(default)]
    pub allowed_users: Option<Vec<String>>,
}

pub enum AuthOutcome {
    /// Authenticated principal.
    Granted(String),
    /// Send this response instead of continuing.
    Denied(Box<Response<Body>>),
}

pub struct AuthHandler {
    entries: HashMap<String, String>,
    realm: String,
    public: Vec<Regex>,
    allowed: Option<HashSet<String>>,
}

impl AuthHandler {
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(&config.htpasswd)
            .with_context(|| format!("reading htpasswd file {}", config.htpasswd))?;
        let mut entries = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, hash)) = line.split_once(':') {
                entries.insert(user.to_string(), hash.to_string());
            }
        }
        let public = config
            .public_paths
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compiling public path {p:?}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AuthHandler {
            entries,
            realm: config.realm.clone(),
            public,
            allowed: config
                .allowed_users
                .as_ref()
                .map(|users| users.iter().cloned().collect()),
        })
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public.iter().any(|p| p.is_match(path))
    }

    pub fn is_user_allowed(&self, user: &str) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(user),
            None => true,
        }
    }

    pub fn authenticate<B>(&self, req: &Request<B>) -> AuthOutcome {
        let credentials = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|v| base64::decode(v).ok())
            .and_then(|v| String::from_utf8(v).ok());
        let Some(credentials) = credentials else {
            return AuthOutcome::Denied(Box::new(self.challenge()));
        };
        let Some((user, password)) = credentials.split_once(':') else {
            return AuthOutcome::Denied(Box::new(self.challenge()));
        };
        match self.entries.get(user) {
            Some(hash) if verify_password(hash, password) => {
                if self.is_user_allowed(user) {
                    AuthOutcome::Granted(user.to_string())
                } else {
                    AuthOutcome::Denied(Box::new(forbidden()))
                }
            }
            _ => AuthOutcome::Denied(Box::new(self.challenge())),
        }
    }

    fn challenge(&self) -> Response<Body> {
        let mut response = Response::new(Body::from("401 Unauthorized\n"));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        let challenge = format!("Basic realm=\"{}\"", self.realm);
        response.headers_mut().insert(
            hyper::header::WWW_AUTHENTICATE,
            HeaderValue::from_str(&challenge)
                .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"Restricted\"")),
        );
        response
    }
}

fn forbidden() -> Response<Body> {
    let mut response = Response::new(Body::from("403 Forbidden\n"));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

/// htpasswd hash formats we honor: bcrypt, `{SHA}`, and plain text.
fn verify_password(hash: &str, password: &str) -> bool {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }
    if let Some(digest) = hash.strip_prefix("{SHA}") {
        let computed = base64::encode(Sha1::digest(password.as_bytes()));
        return computed == digest;
    }
    if hash.starts_with("$apr1$") {
        warn!("apr1 htpasswd entries are not supported");
        return false;
    }
    hash == password
}
