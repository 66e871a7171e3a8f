//! WebSocket proxying via raw connection hijacking.
//!
//! An upgrade request is relayed over a plain TCP connection to the
//! backend: we write the request head ourselves, read the backend's reply
//! head, and if it is `101 Switching Protocols` we take ownership of the
//! client socket from the HTTP server and shuttle bytes in both directions
//! until either side closes. Anything other than a 101 is relayed as an
//! ordinary response.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Body, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::idle::RequestGuard;
use crate::proxy::{prepare_headers, ProxySettings, HOP_BY_HOP_HEADERS};

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// `Upgrade: websocket` plus a `Connection` header containing `upgrade`,
/// both case-insensitive.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection
}

/// Relay an upgrade request to `authority` (e.g. `localhost:4001`).
///
/// On a 101 from the backend the client connection is hijacked and two copy
/// directions run until one ends; request accounting (the guard) and the
/// optional WebSocket counter transfer to that relay task. Any other
/// backend status is relayed as a normal response, and failures drop the
/// guard so the idle supervisor still sees the request finish.
pub async fn proxy_upgrade(
    mut req: Request<Body>,
    authority: &str,
    client_ip: IpAddr,
    settings: &ProxySettings,
    counter: Option<Arc<AtomicI64>>,
    tracker: &TaskTracker,
    guard: RequestGuard,
) -> DispatchResult<Response<Body>> {
    let mut backend = TcpStream::connect(authority)
        .await
        .map_err(|e| DispatchError::BadGateway(anyhow!(e).context(format!("connecting to {authority}"))))?;

    let head = build_upgrade_head(&req, client_ip, settings);
    backend
        .write_all(head.as_bytes())
        .await
        .map_err(|e| DispatchError::BadGateway(anyhow!(e).context("writing upgrade request")))?;

    let (response_head, leftover) = read_response_head(&mut backend)
        .await
        .map_err(DispatchError::BadGateway)?;

    if response_head.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        debug!(
            status = response_head.status,
            "backend declined websocket upgrade, relaying response"
        );
        return relay_plain_response(response_head, leftover, backend)
            .map(|response| guard.attach_to_response(response));
    }
    let supervisor = guard.disarm();

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_head.headers {
        response = response.header(name.as_str(), value.as_str());
    }
    let response = response
        .body(Body::empty())
        .map_err(|e| DispatchError::Internal(anyhow!(e)))?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    drop(req);

    tracker.spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("client connection was not upgraded: {e}");
                supervisor.request_finished().await;
                return;
            }
        };
        if let Some(counter) = &counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }

        let (mut client_read, mut client_write) = tokio::io::split(upgraded);
        let (mut backend_read, mut backend_write) = backend.into_split();

        // Bytes the backend sent right behind its 101 belong to the client.
        let relay_ok = if leftover.is_empty() {
            true
        } else {
            client_write.write_all(&leftover).await.is_ok()
        };
        if relay_ok {
            tokio::select! {
                r = tokio::io::copy(&mut client_read, &mut backend_write) => {
                    debug!("client-to-backend copy ended: {r:?}");
                }
                r = tokio::io::copy(&mut backend_read, &mut client_write) => {
                    debug!("backend-to-client copy ended: {r:?}");
                }
            }
        }

        if let Some(counter) = &counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        supervisor.request_finished().await;
    });

    Ok(response)
}

/// The raw request head we hand the backend: original request line, headers
/// minus hop-by-hop, plus forwarding headers, with `Upgrade` and
/// `Connection` put back verbatim.
fn build_upgrade_head<B>(req: &Request<B>, client_ip: IpAddr, settings: &ProxySettings) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut headers = req.headers().clone();
    let upgrade = headers.get(UPGRADE).cloned();
    let connection = headers.get(CONNECTION).cloned();
    prepare_headers(&mut headers, client_ip, settings);
    if let Some(upgrade) = upgrade {
        headers.insert(UPGRADE, upgrade);
    }
    if let Some(connection) = connection {
        headers.insert(CONNECTION, connection);
    }

    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in headers.iter() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Read from the backend until the blank line ending the response head.
/// Returns the parsed head and any body/frame bytes read past it.
async fn read_response_head(
    backend: &mut TcpStream,
) -> Result<(ResponseHead, Bytes), anyhow::Error> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = backend
            .read_buf(&mut buf)
            .await
            .context("reading upgrade response")?;
        if n == 0 {
            anyhow::bail!("backend closed the connection before sending a response head");
        }
        if let Some(end) = find_head_end(&buf) {
            let head_bytes = buf.split_to(end);
            let head = parse_response_head(&String::from_utf8_lossy(&head_bytes))?;
            return Ok((head, buf.freeze()));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            anyhow::bail!("backend response head exceeds {MAX_RESPONSE_HEAD} bytes");
        }
    }
}

/// Offset one past the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub(crate) fn parse_response_head(head: &str) -> anyhow::Result<ResponseHead> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    anyhow::ensure!(
        version.starts_with("HTTP/1."),
        "unexpected status line {status_line:?}"
    );
    let status: u16 = parts
        .next()
        .unwrap_or("")
        .parse()
        .with_context(|| format!("unparseable status in {status_line:?}"))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("malformed header line {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(ResponseHead { status, headers })
}

/// The backend answered the upgrade with a normal response; pass it along
/// (hop-by-hop headers dropped) and let the connection wind down.
fn relay_plain_response(
    head: ResponseHead,
    leftover: Bytes,
    backend: TcpStream,
) -> DispatchResult<Response<Body>> {
    let content_length: Option<u64> = head
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse().ok());

    let mut response = Response::builder()
        .status(StatusCode::from_u16(head.status).map_err(|e| DispatchError::Internal(anyhow!(e)))?);
    for (name, value) in &head.headers {
        if HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        response = response.header(name.as_str(), value.as_str());
    }

    let leftover_len = leftover.len() as u64;
    let first = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(leftover) });
    let body = match content_length {
        Some(length) => {
            let remaining = length.saturating_sub(leftover_len);
            Body::wrap_stream(first.chain(ReaderStream::new(backend.take(remaining))))
        }
        None => Body::wrap_stream(first.chain(ReaderStream::new(backend))),
    };

    response
        .body(body)
        .map_err(|e| DispatchError::Internal(anyhow!(e)))
}
