//! Credential extraction.
//!
//! A request can carry its token in three places. They are tried in a fixed
//! order and the first non-empty hit wins; nothing is merged.

use axum::http::{header, HeaderMap};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use url::form_urlencoded;

use crate::config::SessionConfig;
use crate::ui_base_path;

/// Query parameter carrying the token for clients that cannot set headers.
pub const TOKEN_PARAM: &str = "token";

/// Where a credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Header,
    Query,
    Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

impl Credential {
    /// Tokens that arrived in the URL get cached in the session cookie.
    pub fn from_url(&self) -> bool {
        self.source == CredentialSource::Query
    }
}

/// What the extractors may look at
pub struct CredentialContext<'a> {
    pub instance_id: &'a str,
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
}

type Extractor = fn(&CredentialContext<'_>) -> Option<Credential>;

/// Order used for plain HTTP requests.
pub const HTTP_CHAIN: &[Extractor] = &[bearer_header, query_token, session_cookie];

/// Browsers cannot set headers on WebSocket handshakes.
pub const WS_CHAIN: &[Extractor] = &[query_token, session_cookie];

/// Run `chain` in order, returning the first credential found.
pub fn resolve(chain: &[Extractor], ctx: &CredentialContext<'_>) -> Option<Credential> {
    chain.iter().find_map(|extract| extract(ctx))
}

fn bearer_header(ctx: &CredentialContext<'_>) -> Option<Credential> {
    ctx.headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| Credential {
            token: t.to_string(),
            source: CredentialSource::Header,
        })
}

fn query_token(ctx: &CredentialContext<'_>) -> Option<Credential> {
    let query = ctx.query?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == TOKEN_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|t| !t.is_empty())
        .map(|token| Credential {
            token,
            source: CredentialSource::Query,
        })
}

fn session_cookie(ctx: &CredentialContext<'_>) -> Option<Credential> {
    let jar = CookieJar::from_headers(ctx.headers);
    jar.get(&session_cookie_name(ctx.instance_id))
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
        .map(|token| Credential {
            token,
            source: CredentialSource::Cookie,
        })
}

/// Cookie name that caches the token for one instance.
pub fn session_cookie_name(instance_id: &str) -> String {
    format!("proxy_token_{instance_id}")
}

/// Session cookie scoped to one instance's UI prefix.
pub fn build_session_cookie(instance_id: &str, token: &str, cfg: &SessionConfig) -> Cookie<'static> {
    Cookie::build((session_cookie_name(instance_id), token.to_string()))
        .http_only(true)
        .secure(cfg.secure)
        .same_site(SameSite::Lax)
        .path(ui_base_path(instance_id))
        .max_age(time::Duration::seconds(cfg.max_age_secs))
        .build()
}

/// The raw query string with every `token` parameter removed.
///
/// Other pairs are kept byte-for-byte so upstream sees the encoding the
/// client used.
pub fn forwarded_query(query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = query?
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            form_urlencoded::parse(pair.as_bytes())
                .next()
                .map(|(k, _)| k != TOKEN_PARAM)
                .unwrap_or(true)
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn ctx<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> CredentialContext<'a> {
        CredentialContext {
            instance_id: "I1",
            headers,
            query,
        }
    }

    #[test]
    fn test_header_beats_query_and_cookie() {
        let h = headers(&[
            ("authorization", "Bearer from-header"),
            ("cookie", "proxy_token_I1=from-cookie"),
        ]);
        let cred = resolve(HTTP_CHAIN, &ctx(&h, Some("token=from-query"))).unwrap();
        assert_eq!(cred.token, "from-header");
        assert_eq!(cred.source, CredentialSource::Header);
        assert!(!cred.from_url());
    }

    #[test]
    fn test_query_beats_cookie() {
        let h = headers(&[("cookie", "proxy_token_I1=from-cookie")]);
        let cred = resolve(HTTP_CHAIN, &ctx(&h, Some("a=1&token=from-query"))).unwrap();
        assert_eq!(cred.token, "from-query");
        assert!(cred.from_url());
    }

    #[test]
    fn test_cookie_is_per_instance() {
        let h = headers(&[("cookie", "proxy_token_I2=other; proxy_token_I1=mine")]);
        let cred = resolve(HTTP_CHAIN, &ctx(&h, None)).unwrap();
        assert_eq!(cred.token, "mine");
        assert_eq!(cred.source, CredentialSource::Cookie);

        let h = headers(&[("cookie", "proxy_token_I2=other")]);
        assert!(resolve(HTTP_CHAIN, &ctx(&h, None)).is_none());
    }

    #[test]
    fn test_empty_values_fall_through() {
        let h = headers(&[("authorization", "Bearer "), ("cookie", "proxy_token_I1=c")]);
        let cred = resolve(HTTP_CHAIN, &ctx(&h, Some("token="))).unwrap();
        assert_eq!(cred.source, CredentialSource::Cookie);
    }

    #[test]
    fn test_non_bearer_scheme_is_ignored() {
        let h = headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(resolve(HTTP_CHAIN, &ctx(&h, None)).is_none());
    }

    #[test]
    fn test_ws_chain_ignores_authorization_header() {
        let h = headers(&[("authorization", "Bearer from-header")]);
        assert!(resolve(WS_CHAIN, &ctx(&h, None)).is_none());

        let cred = resolve(WS_CHAIN, &ctx(&h, Some("EIO=4&token=t"))).unwrap();
        assert_eq!(cred.token, "t");
    }

    #[test]
    fn test_forwarded_query_strips_only_token() {
        assert_eq!(
            forwarded_query(Some("EIO=4&token=abc&transport=websocket")),
            Some("EIO=4&transport=websocket".to_string())
        );
        assert_eq!(
            forwarded_query(Some("q=a%20b&tokens=keep")),
            Some("q=a%20b&tokens=keep".to_string())
        );
        assert_eq!(forwarded_query(Some("token=abc")), None);
        assert_eq!(forwarded_query(Some("token=a&token=b")), None);
        assert_eq!(forwarded_query(None), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = build_session_cookie("I1", "tok", &SessionConfig::default());
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("proxy_token_I1=tok"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("Secure"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("Path=/api/instances/I1/ui"));
        assert!(rendered.contains("Max-Age=3600"));
    }
}
