//! Plain HTTP proxying: through a tunnel connection, or directly to a
//! reachable remote with `reqwest`.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::debug;

use crate::environment::Environment;
use crate::error::TunnelError;
use crate::tunnel::frame::{frame_header_pairs, headers_to_frame, FrameHeaders};
use crate::tunnel::{Connection, ProxyRequest, ProxyResponse};

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Caller credentials for the manager; the remote gets its own.
const CALLER_CREDENTIALS: &[&str] = &["authorization", "cookie"];

fn is_forwardable(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    !HOP_BY_HOP.contains(&name.as_str()) && !CALLER_CREDENTIALS.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop headers or caller credentials.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_forwardable(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Buffer a request body, failing with `BodyTooLarge` past `limit` bytes.
pub async fn read_body(body: Body, limit: usize) -> Result<Bytes, TunnelError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(TunnelError::BodyTooLarge(limit)),
        Err(e) => Err(TunnelError::Transport(format!("failed to read request body: {e}"))),
    }
}

/// Proxy one request over a tunnel connection.
pub async fn forward_tunnel(
    conn: &Connection,
    request: Request,
    path: String,
    max_body: usize,
    timeout: Duration,
) -> Result<Response, TunnelError> {
    let (parts, body) = request.into_parts();
    let body = read_body(body, max_body).await?;
    let proxy_request = ProxyRequest {
        method: parts.method.to_string(),
        path,
        headers: headers_to_frame(&forwardable_headers(&parts.headers)),
        body: body.to_vec(),
    };
    let response = conn.request(proxy_request, timeout).await?;
    Ok(into_http_response(response))
}

/// Translate an agent's response frame into an HTTP response.
pub fn into_http_response(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    copy_frame_headers(&response.headers, out.headers_mut());
    out
}

fn copy_frame_headers(from: &FrameHeaders, to: &mut HeaderMap) {
    for (name, value) in frame_header_pairs(from) {
        if !is_forwardable(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "Skipping invalid header from agent");
            continue;
        };
        to.append(name, value);
    }
}

/// Forward one request to a direct remote environment.
pub async fn forward_direct(
    client: &reqwest::Client,
    env: &Environment,
    request: Request,
    path: &str,
    max_body: usize,
    timeout: Duration,
) -> Result<Response, TunnelError> {
    let (parts, body) = request.into_parts();
    let body = read_body(body, max_body).await?;
    let url = format!("{}{path}", env.address.trim_end_matches('/'));

    debug!(environment_id = %env.id, method = %parts.method, url = %url, "Forwarding to remote");
    let mut outbound = client
        .request(parts.method, &url)
        .headers(forwardable_headers(&parts.headers))
        .timeout(timeout)
        .body(body);
    if let Some(token) = env.access_token.as_deref() {
        outbound = outbound.bearer_auth(token);
    }

    let upstream = |e: reqwest::Error| {
        if e.is_timeout() {
            TunnelError::Timeout(timeout)
        } else {
            TunnelError::Upstream(e.to_string())
        }
    };
    let response = outbound.send().await.map_err(upstream)?;
    let status = response.status();
    let headers = forwardable_headers(response.headers());
    let bytes = response.bytes().await.map_err(upstream)?;

    let mut out = Response::new(Body::from(bytes));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok(out)
}
