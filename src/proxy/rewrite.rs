//! Cookie-path and HTML rewriting for the reverse proxy (spec §4.9, P4-P6).
//!
//! Translated from
//! `original_source/.../forwarding_server/proxy.py`. The Python original's
//! absolute-path-attribute regex uses a negative lookahead (`/(?!/)`) to
//! reject protocol-relative URLs; the `regex` crate has no lookaround, so
//! that check is done by inspecting the character after the match instead
//! of encoding it in the pattern.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::primitives::AgentId;

fn agent_prefix(agent_id: &AgentId) -> String {
    format!("/agents/{agent_id}")
}

static COOKIE_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(;\s*path\s*=\s*)([^;]*)").unwrap());

/// Rewrite the `Path` attribute of a `Set-Cookie` header to scope it under
/// the agent's prefix. Idempotent (P4): a path already under the prefix is
/// left unchanged.
pub fn rewrite_cookie_path(set_cookie_header: &str, agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);

    if let Some(captures) = COOKIE_PATH_PATTERN.captures(set_cookie_header) {
        let path_match = captures.get(2).unwrap();
        let original_path = path_match.as_str().trim();
        if original_path.starts_with(&prefix) {
            return set_cookie_header.to_string();
        }
        let separator = if original_path.starts_with('/') { "" } else { "/" };
        let new_path = format!("{prefix}{separator}{original_path}");
        format!(
            "{}{}{}",
            &set_cookie_header[..path_match.start()],
            new_path,
            &set_cookie_header[path_match.end()..]
        )
    } else {
        format!("{set_cookie_header}; Path={prefix}/")
    }
}

static ATTR_QUOTE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(?:href|src|action|formaction)\s*=\s*(["'])"#).unwrap());

/// Rewrite absolute-path URLs (`href`/`src`/`action`/`formaction`) in HTML to
/// be scoped under the agent's prefix. Leaves already-prefixed paths,
/// relative paths, protocol-relative paths (`//host/...`), and absolute URLs
/// (`https://...`) unchanged (P5).
pub fn rewrite_absolute_paths_in_html(html: &str, agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);
    let mut out = String::with_capacity(html.len());
    let mut last_end = 0;

    for captures in ATTR_QUOTE_PATTERN.captures_iter(html) {
        let whole = captures.get(0).unwrap();
        let quote_match = captures.get(1).unwrap();
        let quote = quote_match.as_str().chars().next().unwrap();
        let path_start = whole.end();
        let bytes = html.as_bytes();

        let is_absolute_path = bytes.get(path_start) == Some(&b'/')
            && bytes.get(path_start + 1) != Some(&b'/');
        if !is_absolute_path {
            continue;
        }

        let remaining = &html[path_start..];
        let end_quote_idx = remaining[1..].find(quote).map(|i| i + 1);
        let full_path = match end_quote_idx {
            Some(idx) => &remaining[..idx],
            None => remaining,
        };

        out.push_str(&html[last_end..whole.end()]);
        if full_path.starts_with(&format!("{prefix}/")) || full_path == prefix {
            // Already scoped; nothing further to rewrite at this point.
        } else {
            out.push_str(&prefix);
        }
        last_end = whole.end();
    }
    out.push_str(&html[last_end..]);
    out
}

pub fn generate_service_worker_js(agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);
    format!(
        r#"
const PREFIX = '{prefix}';

self.addEventListener('install', () => self.skipWaiting());
self.addEventListener('activate', (e) => e.waitUntil(self.clients.claim()));

self.addEventListener('fetch', (event) => {{
  const url = new URL(event.request.url);

  if (url.origin !== location.origin) return;

  if (url.pathname.startsWith(PREFIX + '/') || url.pathname === PREFIX) return;

  if (url.pathname.endsWith('__sw.js')) return;

  url.pathname = PREFIX + url.pathname;

  const init = {{
    method: event.request.method,
    headers: event.request.headers,
    mode: event.request.mode,
    credentials: event.request.credentials,
    redirect: 'manual',
  }};

  if (!['GET', 'HEAD'].includes(event.request.method)) {{
    init.body = event.request.body;
    init.duplex = 'half';
  }}

  event.respondWith(fetch(new Request(url.toString(), init)));
}});
"#
    )
}

pub fn generate_websocket_shim_js(agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);
    format!(
        r#"<script>
(function() {{
  var PREFIX = '{prefix}';
  var OrigWebSocket = window.WebSocket;

  window.WebSocket = function(url, protocols) {{
    try {{
      var parsed = new URL(url, location.origin);
      if (parsed.host === location.host) {{
        if (!parsed.pathname.startsWith(PREFIX + '/') && parsed.pathname !== PREFIX) {{
          parsed.pathname = PREFIX + parsed.pathname;
        }}
        url = parsed.toString();
      }}
    }} catch(e) {{}}
    return protocols !== undefined
      ? new OrigWebSocket(url, protocols)
      : new OrigWebSocket(url);
  }};

  window.WebSocket.prototype = OrigWebSocket.prototype;
  window.WebSocket.CONNECTING = OrigWebSocket.CONNECTING;
  window.WebSocket.OPEN = OrigWebSocket.OPEN;
  window.WebSocket.CLOSING = OrigWebSocket.CLOSING;
  window.WebSocket.CLOSED = OrigWebSocket.CLOSED;
}})();
</script>"#
    )
}

fn inject_into_head(html: &str, injection: &str) -> String {
    if let Some(idx) = html.find("<head>") {
        let mut out = String::with_capacity(html.len() + injection.len());
        out.push_str(&html[..idx + "<head>".len()]);
        out.push_str(injection);
        out.push_str(&html[idx + "<head>".len()..]);
        out
    } else if let Some(idx) = html.find("<head ") {
        let close_idx = html[idx..].find('>').map(|i| idx + i).unwrap_or(idx);
        let mut out = String::with_capacity(html.len() + injection.len());
        out.push_str(&html[..close_idx + 1]);
        out.push_str(injection);
        out.push_str(&html[close_idx + 1..]);
        out
    } else {
        format!("{injection}{html}")
    }
}

/// Apply every HTML transformation a proxied response needs: rewrite
/// absolute paths, inject a `<base>` tag, inject the WebSocket shim. Injects
/// exactly one `<base>` tag regardless of whether `<head>` is present (P6).
pub fn rewrite_proxied_html(html: &str, agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);
    let rewritten = rewrite_absolute_paths_in_html(html, agent_id);

    let base_tag = format!(r#"<base href="{prefix}/">"#);
    let shim = generate_websocket_shim_js(agent_id);
    let injection = format!("{base_tag}{shim}");

    inject_into_head(&rewritten, &injection)
}

pub fn generate_bootstrap_html(agent_id: &AgentId) -> String {
    let prefix = agent_prefix(agent_id);
    format!(
        r#"<!DOCTYPE html>
<html><head><title>Loading...</title></head>
<body>
<p>Loading...</p>
<script>
const PREFIX = '{prefix}/';
const SW_URL = PREFIX + '__sw.js';

async function boot() {{
  const reg = await navigator.serviceWorker.register(SW_URL, {{ scope: PREFIX }});
  const sw = reg.installing || reg.waiting || reg.active;

  function onActivated() {{
    document.cookie = 'sw_installed_{agent_id}=1; path=' + PREFIX;
    location.reload();
  }}

  if (sw.state === 'activated') {{
    onActivated();
    return;
  }}

  sw.addEventListener('statechange', () => {{
    if (sw.state === 'activated') onActivated();
  }});
}}

boot().catch(err => {{
  document.body.textContent = 'Failed to initialize: ' + err.message;
}});
</script>
</body></html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent_id() -> AgentId {
        "agent-00000000000000000000000000000001".parse().unwrap()
    }

    #[test]
    fn cookie_path_rewrite_sets_missing_path() {
        let id = test_agent_id();
        let result = rewrite_cookie_path("sid=abc", &id);
        assert_eq!(result, format!("sid=abc; Path=/agents/{id}/"));
    }

    #[test]
    fn cookie_path_rewrite_prefixes_root_path() {
        let id = test_agent_id();
        let result = rewrite_cookie_path("sid=abc; Path=/", &id);
        assert_eq!(result, format!("sid=abc; Path=/agents/{id}/"));
    }

    #[test]
    fn cookie_path_rewrite_is_idempotent() {
        let id = test_agent_id();
        let once = rewrite_cookie_path("sid=abc; Path=/agents/agent-00000000000000000000000000000001/api", &id);
        let twice = rewrite_cookie_path(&once, &id);
        assert_eq!(once, twice);
        assert_eq!(once, format!("sid=abc; Path=/agents/{id}/api"));
    }

    #[test]
    fn html_rewrite_leaves_relative_and_protocol_relative_paths_alone() {
        let id = test_agent_id();
        let html = r#"<a href="foo">x</a><a href="//other/bar">y</a><a href="https://example.com/z">z</a>"#;
        let result = rewrite_absolute_paths_in_html(html, &id);
        assert_eq!(result, html);
    }

    #[test]
    fn html_rewrite_prefixes_absolute_paths() {
        let id = test_agent_id();
        let html = r#"<a href="/foo">l</a>"#;
        let result = rewrite_absolute_paths_in_html(html, &id);
        assert_eq!(result, format!(r#"<a href="/agents/{id}/foo">l</a>"#));
    }

    #[test]
    fn rewrite_proxied_html_injects_base_and_shim() {
        let id = test_agent_id();
        let html = r#"<html><head><title>x</title></head><body><a href="/foo">l</a></body></html>"#;
        let result = rewrite_proxied_html(html, &id);
        assert!(result.contains(&format!(r#"<base href="/agents/{id}/">"#)));
        assert!(result.contains(&format!(r#"href="/agents/{id}/foo""#)));
        assert!(result.contains("OrigWebSocket"));
    }

    #[test]
    fn rewrite_proxied_html_injects_base_tag_without_head() {
        let id = test_agent_id();
        let html = r#"<body>no head here</body>"#;
        let result = rewrite_proxied_html(html, &id);
        assert_eq!(result.matches("<base").count(), 1);
    }
}
