//! HTML page templates for the reverse proxy (spec §4.9), grounded on
//! `original_source/.../forwarding_server/templates.py`. The Python original
//! renders these with jinja2; this crate has no templating engine in its
//! dependency stack (nor does `RactorLabs-ractor`), so they're plain `format!`
//! strings, with `html_escape` applied to any value that isn't already a
//! validated newtype (agent ids / server names are safe by construction;
//! free-form error messages are not).

use crate::primitives::{AgentId, OneTimeCode, ServerName};

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn render_landing_page(accessible_agent_ids: &[AgentId]) -> String {
    let body = if accessible_agent_ids.is_empty() {
        r#"<p class="empty-state">
    No agents are accessible. Use a login link to authenticate with an agent.
  </p>"#
            .to_string()
    } else {
        let items: String = accessible_agent_ids
            .iter()
            .map(|id| format!(r#"    <li><a href="/agents/{id}/">{id}</a></li>"#))
            .collect::<Vec<_>>()
            .join("\n");
        format!("<ul class=\"agent-list\">\n{items}\n</ul>")
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>mngr</title>
  <style>
    * {{ margin: 0; padding: 0; box-sizing: border-box; }}
    body {{ font-family: system-ui, -apple-system, sans-serif; padding: 40px; background: whitesmoke; }}
    h1 {{ margin-bottom: 24px; color: rgb(26, 26, 46); }}
    .agent-list {{ list-style: none; }}
    .agent-list li {{ margin-bottom: 8px; }}
    .agent-list a {{
      display: inline-block; padding: 12px 20px;
      background: rgb(26, 26, 46); color: white; text-decoration: none;
      border-radius: 6px; font-size: 16px;
    }}
    .agent-list a:hover {{ background: rgb(42, 42, 78); }}
    .empty-state {{ color: gray; font-size: 16px; }}
  </style>
</head>
<body>
  <h1>Your Agents</h1>
  {body}
</body>
</html>"#
    )
}

pub fn render_login_redirect_page(agent_id: &AgentId, one_time_code: &OneTimeCode) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authenticating...</title></head>
<body>
<p>Authenticating...</p>
<script>
window.location.href = '/authenticate?agent_id={agent_id}&one_time_code={one_time_code}';
</script>
</body>
</html>"#
    )
}

pub fn render_auth_error_page(message: &str) -> String {
    let escaped = html_escape(message);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Authentication Error</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; padding: 40px; background: whitesmoke; }}
    .error {{ background: rgb(255, 238, 238); border: 1px solid rgb(255, 204, 204); padding: 20px; border-radius: 6px; color: darkred; }}
  </style>
</head>
<body>
  <div class="error">
    <h2>Authentication Failed</h2>
    <p>{escaped}</p>
    <p>Please generate a new login URL for this device. Each login URL can only be used once.</p>
  </div>
</body>
</html>"#
    )
}

pub fn render_agent_servers_page(agent_id: &AgentId, server_names: &[ServerName]) -> String {
    let body = if server_names.is_empty() {
        r#"<p class="empty-state">
    No servers are currently running for this agent.
  </p>"#
            .to_string()
    } else {
        let items: String = server_names
            .iter()
            .map(|name| format!(r#"    <li><a href="/agents/{agent_id}/{name}/">{name}</a></li>"#))
            .collect::<Vec<_>>()
            .join("\n");
        format!("<ul class=\"server-list\">\n{items}\n</ul>")
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Servers - {agent_id}</title>
  <style>
    * {{ margin: 0; padding: 0; box-sizing: border-box; }}
    body {{ font-family: system-ui, -apple-system, sans-serif; padding: 40px; background: whitesmoke; }}
    h1 {{ margin-bottom: 8px; color: rgb(26, 26, 46); }}
    .subtitle {{ margin-bottom: 24px; color: gray; font-size: 14px; }}
    .server-list {{ list-style: none; }}
    .server-list li {{ margin-bottom: 8px; }}
    .server-list a {{
      display: inline-block; padding: 12px 20px;
      background: rgb(26, 26, 46); color: white; text-decoration: none;
      border-radius: 6px; font-size: 16px;
    }}
    .server-list a:hover {{ background: rgb(42, 42, 78); }}
    .empty-state {{ color: gray; font-size: 16px; }}
    .back-link {{ margin-top: 24px; }}
    .back-link a {{ color: rgb(26, 26, 46); text-decoration: underline; }}
  </style>
</head>
<body>
  <h1>{agent_id}</h1>
  <p class="subtitle">Available servers</p>
  {body}
  <div class="back-link"><a href="/">Back to all agents</a></div>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent_id() -> AgentId {
        "agent-00000000000000000000000000000001".parse().unwrap()
    }

    #[test]
    fn landing_page_shows_empty_state_with_no_agents() {
        let html = render_landing_page(&[]);
        assert!(html.contains("No agents are accessible"));
    }

    #[test]
    fn landing_page_lists_agents() {
        let id = test_agent_id();
        let html = render_landing_page(&[id.clone()]);
        assert!(html.contains(&format!("/agents/{id}/")));
    }

    #[test]
    fn auth_error_page_escapes_message() {
        let html = render_auth_error_page("<script>bad</script>");
        assert!(!html.contains("<script>bad</script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
