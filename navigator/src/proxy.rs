//! The HTTP reverse proxy.
//!
//! Requests are forwarded to `http://localhost:<port>` with hop-by-hop
//! headers stripped and `X-Forwarded-*` injected. Idempotent methods are
//! retried on transport errors with exponential backoff; their responses
//! are buffered up to a cap so a retry never duplicates bytes the client
//! has already seen. WebSocket upgrades take the raw-socket path in
//! [`websocket`].

pub mod retry_buffer;
pub mod websocket;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use futures::StreamExt;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Body, Client, Method, Request, Response, Uri};
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use self::retry_buffer::{Push, RetryBuffer};

pub const MAX_RETRY_BUFFER_SIZE: usize = 1024 * 1024;
pub const PROXY_RETRY_TIMEOUT: Duration = Duration::from_secs(3);
pub const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const RETRY_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Headers that belong to one hop, never forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request proxy settings, re-read from the current config snapshot.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_retry_buffer: usize,
    pub retry_timeout: Duration,
    /// Append to an existing `X-Forwarded-For` instead of replacing it.
    pub trust_proxy: bool,
    /// Strip `Accept-Encoding` so backends reply uncompressed.
    pub disable_compression: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            max_retry_buffer: MAX_RETRY_BUFFER_SIZE,
            retry_timeout: PROXY_RETRY_TIMEOUT,
            trust_proxy: false,
            disable_compression: false,
        }
    }
}

pub struct ReverseProxy {
    client: Client<HttpConnector>,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

enum Attempt {
    Done(Response<Body>),
    Transport(anyhow::Error),
}

impl ReverseProxy {
    pub fn new() -> Self {
        ReverseProxy {
            client: Client::builder().build_http(),
        }
    }

    /// Forward `req` to `target` (scheme and authority, e.g.
    /// `http://localhost:4001`), preserving the request path and query.
    pub async fn forward(
        &self,
        req: Request<Body>,
        target: &str,
        client_ip: IpAddr,
        settings: &ProxySettings,
    ) -> DispatchResult<Response<Body>> {
        let (mut parts, body) = req.into_parts();
        let uri = build_target_uri(target, &parts.uri)
            .map_err(|e| DispatchError::Internal(anyhow!(e).context("parsing proxy target")))?;
        prepare_headers(&mut parts.headers, client_ip, settings);

        let retryable = matches!(parts.method, Method::GET | Method::HEAD | Method::OPTIONS)
            && body.size_hint().exact() == Some(0);

        if !retryable {
            // Single shot: the body is a stream we cannot replay.
            let mut outbound = Request::new(body);
            *outbound.method_mut() = parts.method.clone();
            *outbound.uri_mut() = uri.clone();
            *outbound.headers_mut() = parts.headers.clone();
            return match self.client.request(outbound).await {
                Ok(resp) => Ok(passthrough_response(resp)),
                Err(e) => Err(DispatchError::BadGateway(
                    anyhow!(e).context(format!("connecting to {uri}")),
                )),
            };
        }

        self.forward_with_retry(parts, uri, settings).await
    }

    async fn forward_with_retry(
        &self,
        parts: hyper::http::request::Parts,
        uri: Uri,
        settings: &ProxySettings,
    ) -> DispatchResult<Response<Body>> {
        let deadline = tokio::time::Instant::now() + settings.retry_timeout;
        let mut backoff = RETRY_INITIAL_BACKOFF;
        loop {
            let mut outbound = Request::new(Body::empty());
            *outbound.method_mut() = parts.method.clone();
            *outbound.uri_mut() = uri.clone();
            *outbound.headers_mut() = parts.headers.clone();

            let err = match self.attempt(outbound, settings.max_retry_buffer).await {
                Attempt::Done(resp) => return Ok(resp),
                Attempt::Transport(e) => e,
            };
            debug!("proxy attempt to {uri} failed: {err:#}");

            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(DispatchError::BadGateway(
                    err.context(format!("backend {uri} unreachable, retries exhausted")),
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
        }
    }

    /// One proxy attempt. Nothing reaches the client until either the whole
    /// body fits the retry buffer or the buffer overflows; only the latter
    /// commits us to this attempt.
    async fn attempt(&self, outbound: Request<Body>, max_buffer: usize) -> Attempt {
        let resp = match self.client.request(outbound).await {
            Ok(resp) => resp,
            Err(e) => return Attempt::Transport(anyhow!(e)),
        };
        let (mut parts, mut body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let mut buffer = RetryBuffer::new(max_buffer);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => match buffer.push(chunk) {
                    Push::Buffered => {}
                    Push::Overflow { prefix } => {
                        // Flush the prefix, then stream the rest directly.
                        let rest = futures::stream::once(async move {
                            Ok::<Bytes, hyper::Error>(prefix)
                        })
                        .chain(body);
                        return Attempt::Done(Response::from_parts(
                            parts,
                            Body::wrap_stream(rest),
                        ));
                    }
                },
                Err(e) => {
                    return Attempt::Transport(anyhow!(e).context("reading backend response"))
                }
            }
        }
        Attempt::Done(Response::from_parts(parts, Body::from(buffer.take())))
    }
}

fn build_target_uri(target: &str, original: &Uri) -> Result<Uri, hyper::http::uri::InvalidUri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{target}{path_and_query}").parse()
}

/// Outbound request header hygiene: drop hop-by-hop headers, record the
/// forwarding chain.
pub(crate) fn prepare_headers(headers: &mut HeaderMap, client_ip: IpAddr, settings: &ProxySettings) {
    let original_host = headers.get(hyper::header::HOST).cloned();

    strip_hop_by_hop(headers);

    let client_ip = client_ip.to_string();
    match headers.get("x-forwarded-for") {
        Some(existing) if settings.trust_proxy => {
            let mut chain = existing.to_str().unwrap_or("").to_string();
            chain.push_str(", ");
            chain.push_str(&client_ip);
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert("x-forwarded-for", value);
            }
        }
        _ => {
            if let Ok(value) = HeaderValue::from_str(&client_ip) {
                headers.insert("x-forwarded-for", value);
            }
        }
    }
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    if settings.disable_compression {
        headers.remove(hyper::header::ACCEPT_ENCODING);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn passthrough_response(resp: Response<Body>) -> Response<Body> {
    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::StatusCode;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    /// Serve `handler` on an ephemeral port for the duration of the test.
    fn spawn_backend<F>(handler: F) -> SocketAddr
    where
        F: Fn(Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let make_svc = make_service_fn(move |_| {
            let handler = handler.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req)) }
                }))
            }
        });
        let server = hyper::Server::from_tcp(listener).unwrap().serve(make_svc);
        tokio::spawn(server);
        addr
    }

    /// A port with nothing listening on it.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .header("host", "demo.example")
            .header("connection", "keep-alive")
            .header("upgrade", "h2c")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_with_header_hygiene() {
        let addr = spawn_backend(|req| {
            let mut resp = Response::new(Body::from("hello"));
            let h = req.headers();
            let copy = |name: &str| {
                h.get(name)
                    .cloned()
                    .unwrap_or(HeaderValue::from_static("absent"))
            };
            resp.headers_mut().insert("echo-xff", copy("x-forwarded-for"));
            resp.headers_mut()
                .insert("echo-xfh", copy("x-forwarded-host"));
            resp.headers_mut()
                .insert("echo-xfp", copy("x-forwarded-proto"));
            resp.headers_mut()
                .insert("echo-upgrade", copy("upgrade"));
            resp
        });

        let proxy = ReverseProxy::new();
        let resp = proxy
            .forward(
                get("/hello?q=1"),
                &format!("http://{addr}"),
                LOCALHOST,
                &ProxySettings::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["echo-xff"], "127.0.0.1");
        assert_eq!(resp.headers()["echo-xfh"], "demo.example");
        assert_eq!(resp.headers()["echo-xfp"], "http");
        // Hop-by-hop headers never reach the backend.
        assert_eq!(resp.headers()["echo-upgrade"], "absent");
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn trusted_proxy_appends_to_the_forwarding_chain() {
        let addr = spawn_backend(|req| {
            let mut resp = Response::new(Body::empty());
            resp.headers_mut()
                .insert("echo-xff", req.headers()["x-forwarded-for"].clone());
            resp
        });

        let mut req = get("/");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9"));
        let settings = ProxySettings {
            trust_proxy: true,
            ..ProxySettings::default()
        };
        let proxy = ReverseProxy::new();
        let resp = proxy
            .forward(req, &format!("http://{addr}"), LOCALHOST, &settings)
            .await
            .unwrap();
        assert_eq!(resp.headers()["echo-xff"], "10.0.0.9, 127.0.0.1");
    }

    #[tokio::test]
    async fn post_to_unreachable_backend_fails_fast() {
        let port = dead_port();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header("content-length", "10")
            .body(Body::from("0123456789"))
            .unwrap();

        let proxy = ReverseProxy::new();
        let started = std::time::Instant::now();
        let err = proxy
            .forward(
                req,
                &format!("http://127.0.0.1:{port}"),
                LOCALHOST,
                &ProxySettings::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadGateway(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn idempotent_requests_retry_until_the_timeout() {
        let port = dead_port();
        let settings = ProxySettings {
            retry_timeout: Duration::from_millis(300),
            ..ProxySettings::default()
        };
        let proxy = ReverseProxy::new();
        let started = std::time::Instant::now();
        let err = proxy
            .forward(
                get("/"),
                &format!("http://127.0.0.1:{port}"),
                LOCALHOST,
                &settings,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadGateway(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retry_succeeds_once_the_backend_comes_up() {
        // Reserve a port, leave it dead for a while, then start the backend.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = std::net::TcpListener::bind(addr).unwrap();
            listener.set_nonblocking(true).unwrap();
            let make_svc = make_service_fn(|_| async {
                Ok::<_, Infallible>(service_fn(|_req| async {
                    Ok::<_, Infallible>(Response::new(Body::from("late but fine")))
                }))
            });
            let _ = hyper::Server::from_tcp(listener).unwrap().serve(make_svc).await;
        });

        let settings = ProxySettings {
            retry_timeout: Duration::from_secs(3),
            ..ProxySettings::default()
        };
        let proxy = ReverseProxy::new();
        let resp = proxy
            .forward(get("/"), &format!("http://{addr}"), LOCALHOST, &settings)
            .await
            .unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"late but fine"));
    }

    #[tokio::test]
    async fn bodies_at_and_over_the_buffer_cap_arrive_intact() {
        let addr = spawn_backend(|req| {
            let n: usize = req.uri().path().trim_start_matches('/').parse().unwrap();
            Response::new(Body::from(vec![b'x'; n]))
        });
        let settings = ProxySettings {
            max_retry_buffer: 64,
            ..ProxySettings::default()
        };
        let proxy = ReverseProxy::new();

        for n in [64usize, 65, 1024] {
            let resp = proxy
                .forward(
                    get(&format!("/{n}")),
                    &format!("http://{addr}"),
                    LOCALHOST,
                    &settings,
                )
                .await
                .unwrap();
            let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
            assert_eq!(body.len(), n, "body of {n} bytes must not be truncated");
        }
    }
}
