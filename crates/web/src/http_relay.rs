//! HTTP relay: one authenticated request in, one upstream request out.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::auth::credentials::{self, build_session_cookie, CredentialContext, HTTP_CHAIN};
use crate::error::ProxyError;
use crate::rewrite;
use crate::server::AppState;
use crate::upstream::classify;
use crate::ui_base_path;

/// Headers that describe a single hop and never cross the proxy.
static HOP_BY_HOP: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
        "host",
    ]
    .into_iter()
    .collect()
});

/// `HeaderName`s are stored lowercase, so a plain lookup is case-insensitive.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name.as_str())
}

/// The part of a request path after `/api/instances/{id}/ui`, still
/// percent-encoded: `""`, `"/"` or `"/some/path"`.
pub fn upstream_path(request_path: &str) -> &str {
    let Some(rest) = request_path.strip_prefix("/api/instances/") else {
        return "";
    };
    let after_id = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
    after_id.strip_prefix("/ui").unwrap_or("")
}

/// Upstream URL for `path` (as returned by [`upstream_path`]).
pub fn upstream_url(scheme: &str, host: &str, port: u16, path: &str, query: Option<&str>) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut url = format!("{scheme}://{host}:{port}/{path}");
    if let Some(query) = credentials::forwarded_query(query) {
        url.push('?');
        url.push_str(&query);
    }
    url
}

/// Authenticate, authorize and forward one HTTP request.
pub async fn relay(state: AppState, instance_id: String, req: Request) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();

    let credential = credentials::resolve(
        HTTP_CHAIN,
        &CredentialContext {
            instance_id: &instance_id,
            headers: &parts.headers,
            query: parts.uri.query(),
        },
    )
    .ok_or(ProxyError::Unauthenticated)?;

    let port = state.gate.authorize(&instance_id, &credential.token).await?;

    let url = upstream_url(
        "http",
        &state.config.upstream_host,
        port,
        upstream_path(parts.uri.path()),
        parts.uri.query(),
    );
    let url = reqwest::Url::parse(&url)
        .map_err(|e| ProxyError::UpstreamProtocol(format!("invalid upstream url: {e}")))?;
    debug!(instance_id = %instance_id, port, method = %parts.method, path = url.path(), "Relaying request");

    let mut headers = forward_headers(&parts.headers);
    narrow_accept_encoding(&mut headers);
    let authority = format!("{}:{}", state.config.upstream_host, port);
    if let Ok(host) = HeaderValue::from_str(&authority) {
        headers.insert(header::HOST, host);
    }

    let client = state.pool.client()?;
    let mut request = client.request(parts.method.clone(), url).headers(headers);
    if has_body(&parts.headers) {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = state.pool.send(request).await.map_err(|e| {
        warn!(instance_id = %instance_id, port, "Upstream request failed: {}", e);
        e
    })?;

    let mut response = relay_response(&state, &instance_id, upstream).await?;

    if credential.from_url() {
        let cookie = build_session_cookie(&instance_id, &credential.token, &state.config.session);
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(instance_id = %instance_id, "Token not usable as a cookie value: {}", e),
        }
    }

    Ok(response)
}

/// Request headers minus the hop-by-hop set.
pub fn forward_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Content codings [`rewrite::decode_body`] can undo.
const DECODABLE_CODINGS: [&str; 4] = ["gzip", "x-gzip", "deflate", "identity"];

/// Restrict `Accept-Encoding` to codings an HTML body can be decoded from
/// before rewriting. Anything else (`br`, `zstd`, `*`) is dropped; when
/// nothing is left the container is asked for `identity`.
pub fn narrow_accept_encoding(headers: &mut HeaderMap) {
    if !headers.contains_key(header::ACCEPT_ENCODING) {
        return;
    }

    let kept: Vec<String> = headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|item| {
            let coding = item.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            DECODABLE_CODINGS.contains(&coding.as_str())
        })
        .map(str::to_string)
        .collect();

    let narrowed = if kept.is_empty() {
        "identity".to_string()
    } else {
        kept.join(", ")
    };
    headers.remove(header::ACCEPT_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&narrowed) {
        headers.insert(header::ACCEPT_ENCODING, value);
    }
}

/// Response headers minus the hop-by-hop set and `Content-Length`.
/// Repeated headers such as `Set-Cookie` keep every value.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name) && name != header::CONTENT_LENGTH {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn has_body(headers: &HeaderMap) -> bool {
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0);
    declared_length || headers.contains_key(header::TRANSFER_ENCODING)
}

async fn relay_response(
    state: &AppState,
    instance_id: &str,
    upstream: reqwest::Response,
) -> Result<Response, ProxyError> {
    let status = upstream.status();
    let mut headers = response_headers(upstream.headers());

    let html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(rewrite::is_html);

    let body = if html {
        let raw = upstream.bytes().await.map_err(|e| classify(&e))?;
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match rewrite::decode_body(&raw, encoding.as_deref()) {
            Some(decoded) => {
                let page = String::from_utf8_lossy(&decoded);
                let rewritten = state.rewriter.rewrite(&page, &ui_base_path(instance_id));
                headers.remove(header::CONTENT_ENCODING);
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/html; charset=utf-8"),
                );
                Body::from(rewritten)
            }
            None => {
                debug!(instance_id = %instance_id, encoding = ?encoding, "Passing HTML through unrewritten");
                Body::from(raw)
            }
        }
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_path() {
        assert_eq!(upstream_path("/api/instances/I1/ui"), "");
        assert_eq!(upstream_path("/api/instances/I1/ui/"), "/");
        assert_eq!(upstream_path("/api/instances/I1/ui/static/app%20x.js"), "/static/app%20x.js");
        assert_eq!(upstream_path("/api/instances/a%2Fb/ui/x"), "/x");
        assert_eq!(upstream_path("/elsewhere"), "");
    }

    #[test]
    fn test_upstream_url_drops_token() {
        assert_eq!(
            upstream_url("http", "127.0.0.1", 7000, "", Some("token=t")),
            "http://127.0.0.1:7000/"
        );
        assert_eq!(
            upstream_url("ws", "127.0.0.1", 7000, "/socket.io/", Some("EIO=4&token=t&transport=websocket")),
            "ws://127.0.0.1:7000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_hop_by_hop_filtering() {
        let mut incoming = HeaderMap::new();
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        incoming.insert("host", HeaderValue::from_static("proxy.example"));
        incoming.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        incoming.insert("accept", HeaderValue::from_static("text/html"));
        incoming.insert("content-length", HeaderValue::from_static("3"));

        let out = forward_headers(&incoming);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("accept"));
        assert!(out.contains_key("content-length"));
    }

    #[test]
    fn test_response_headers_keep_repeats_and_drop_length() {
        let mut upstream = HeaderMap::new();
        upstream.append("set-cookie", HeaderValue::from_static("a=1"));
        upstream.append("set-cookie", HeaderValue::from_static("b=2"));
        upstream.insert("content-length", HeaderValue::from_static("10"));
        upstream.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        upstream.insert("content-type", HeaderValue::from_static("text/css"));

        let out = response_headers(&upstream);
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
        assert!(!out.contains_key("content-length"));
        assert!(!out.contains_key("keep-alive"));
        assert!(out.contains_key("content-type"));
    }

    #[test]
    fn test_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!has_body(&headers));
        headers.insert("content-length", HeaderValue::from_static("0"));
        assert!(!has_body(&headers));
        headers.insert("content-length", HeaderValue::from_static("12"));
        assert!(has_body(&headers));

        let mut chunked = HeaderMap::new();
        chunked.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        assert!(has_body(&chunked));
    }

    #[test]
    fn test_accept_encoding_narrowed_to_decodable() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br, zstd"));
        narrow_accept_encoding(&mut headers);
        assert_eq!(headers.get(header::ACCEPT_ENCODING).unwrap(), "gzip, deflate");

        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT_ENCODING, HeaderValue::from_static("br;q=1.0"));
        headers.append(header::ACCEPT_ENCODING, HeaderValue::from_static("GZIP;q=0.8, *;q=0.1"));
        narrow_accept_encoding(&mut headers);
        assert_eq!(headers.get_all(header::ACCEPT_ENCODING).iter().count(), 1);
        assert_eq!(headers.get(header::ACCEPT_ENCODING).unwrap(), "GZIP;q=0.8");

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br, zstd"));
        narrow_accept_encoding(&mut headers);
        assert_eq!(headers.get(header::ACCEPT_ENCODING).unwrap(), "identity");

        let mut headers = HeaderMap::new();
        narrow_accept_encoding(&mut headers);
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
    }
}
