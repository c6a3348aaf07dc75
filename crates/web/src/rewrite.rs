//! HTML rewriting for apps served under a path prefix.
//!
//! Container UIs assume they live at `/`. Two things make them work under
//! `/api/instances/{id}/ui` instead:
//! - root-absolute links in the served markup get the prefix, so the
//!   browser fetches assets back through the proxy;
//! - a small script, injected before anything else in `<head>`, prefixes
//!   root-relative URLs the app builds at runtime for `fetch`, XHR and
//!   WebSocket.
//!
//! Both steps skip work that is already done, so rewriting a rewritten page
//! is a no-op.

use regex_lite::{Captures, Regex};
use std::io::Read;

/// Attribute marking the injected script.
pub const SHIM_MARKER: &str = "data-uiproxy-shim";

pub struct HtmlRewriter {
    double_quoted: Regex,
    single_quoted: Regex,
    css_url: Regex,
    head_open: Regex,
}

impl HtmlRewriter {
    pub fn new() -> Result<Self, regex_lite::Error> {
        Ok(Self {
            double_quoted: Regex::new(r#"(href|src|action)="(/[^"]*)"#)?,
            single_quoted: Regex::new(r#"(href|src|action)='(/[^']*)"#)?,
            css_url: Regex::new(r#"url\((\s*["']?)(/[^)"'\s]*)"#)?,
            // `(\s[^>]*)?` keeps <header> and <headline> from matching.
            head_open: Regex::new(r"(?i)<head(\s[^>]*)?>")?,
        })
    }

    /// Prefix links and inject the runtime shim.
    pub fn rewrite(&self, html: &str, base: &str) -> String {
        let linked = self.prefix_links(html, base);
        self.inject_shim(&linked, base)
    }

    /// Prefix root-absolute `href`/`src`/`action` values and CSS `url()`s.
    pub fn prefix_links(&self, html: &str, base: &str) -> String {
        let html = self.double_quoted.replace_all(html, |caps: &Captures| {
            attribute(&caps[1], '"', &caps[2], base)
        });
        let html = self.single_quoted.replace_all(&html, |caps: &Captures| {
            attribute(&caps[1], '\'', &caps[2], base)
        });
        let html = self.css_url.replace_all(&html, |caps: &Captures| {
            format!("url({}{})", &caps[1], prefixed(&caps[2], base))
        });
        html.into_owned()
    }

    /// Insert the shim as the first child of `<head>`, or at the very start
    /// when there is no head. Pages that already carry it are left alone.
    pub fn inject_shim(&self, html: &str, base: &str) -> String {
        if html.contains(SHIM_MARKER) {
            return html.to_string();
        }

        let shim = shim_script(base);
        match self.head_open.find(html) {
            Some(m) => {
                let mut out = String::with_capacity(html.len() + shim.len());
                out.push_str(&html[..m.end()]);
                out.push_str(&shim);
                out.push_str(&html[m.end()..]);
                out
            }
            None => format!("{shim}{html}"),
        }
    }
}

fn attribute(name: &str, quote: char, value: &str, base: &str) -> String {
    format!("{name}={quote}{}", prefixed(value, base))
}

/// `value` with `base` in front, unless it is protocol-relative or already
/// under `base`.
fn prefixed(value: &str, base: &str) -> String {
    if needs_prefix(value, base) {
        format!("{base}{value}")
    } else {
        value.to_string()
    }
}

fn needs_prefix(value: &str, base: &str) -> bool {
    if !value.starts_with('/') || value.starts_with("//") {
        return false;
    }
    match value.strip_prefix(base) {
        Some(rest) => !(rest.is_empty() || rest.starts_with(['/', '?', '#'])),
        None => true,
    }
}

/// The runtime shim for one base path.
pub fn shim_script(base: &str) -> String {
    format!(
        r#"<script {SHIM_MARKER}>
(function () {{
  var base = {base};
  function prefix(u) {{
    if (typeof u === "string" && u.charAt(0) === "/" && u.charAt(1) !== "/" &&
        u !== base && u.indexOf(base + "/") !== 0 && u.indexOf(base + "?") !== 0) {{
      return base + u;
    }}
    return u;
  }}
  var nativeFetch = window.fetch;
  if (nativeFetch) {{
    window.fetch = function (input, init) {{
      return nativeFetch.call(this, prefix(input), init);
    }};
  }}
  var nativeOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {{
    var args = Array.prototype.slice.call(arguments);
    args[1] = prefix(url);
    return nativeOpen.apply(this, args);
  }};
  var NativeWebSocket = window.WebSocket;
  function ProxiedWebSocket(url, protocols) {{
    if (typeof url === "string") {{
      if (url.charAt(0) === "/") {{
        url = prefix(url);
      }} else {{
        try {{
          var parsed = new URL(url);
          if (parsed.host === location.host && parsed.pathname.indexOf(base) !== 0) {{
            parsed.pathname = base + parsed.pathname;
            url = parsed.toString();
          }}
        }} catch (e) {{}}
      }}
    }}
    return protocols === undefined ? new NativeWebSocket(url) : new NativeWebSocket(url, protocols);
  }}
  ProxiedWebSocket.prototype = NativeWebSocket.prototype;
  ["CONNECTING", "OPEN", "CLOSING", "CLOSED"].forEach(function (k) {{
    ProxiedWebSocket[k] = NativeWebSocket[k];
  }});
  window.WebSocket = ProxiedWebSocket;
}})();
</script>"#,
        base = js_string(base),
    )
}

/// A JS string literal that cannot terminate the surrounding script element.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string())
        .to_string()
        .replace("</", "<\\/")
}

/// Whether a `Content-Type` value names an HTML document.
pub fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}

/// Undo a response `Content-Encoding` so the body can be rewritten.
///
/// Returns `None` for encodings this proxy cannot decode (or bodies that
/// fail to decode); those responses are passed through untouched.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    let encoding = content_encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("") | Some("identity") => Some(body.to_vec()),
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body).read_to_end(&mut out).ok()?;
            Some(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            // Most servers send zlib-wrapped data; some send raw deflate.
            if flate2::read::ZlibDecoder::new(body).read_to_end(&mut out).is_ok() {
                return Some(out);
            }
            out.clear();
            flate2::read::DeflateDecoder::new(body).read_to_end(&mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}
