//! Reverse HTTP+WebSocket proxy (C10, spec §4.9).
//!
//! Routes and behaviors are grounded on
//! `original_source/.../forwarding_server/proxy.py` and `auth.py`; the router
//! itself is new (the Python original never assembled one — only the pure
//! rewrite helpers survived the distillation). Built on `axum` +
//! `tower-http`, `RactorLabs-ractor`'s HTTP stack. The WebSocket relay's
//! downstream leg uses `axum`'s native `extract::ws` support; the upstream
//! leg dials out with `tokio-tungstenite`, since `RactorLabs-ractor` never
//! proxies WebSocket traffic itself.
//!
//! This is the one module in the crate with an `IntoResponse` impl for
//! [`MngrError`] (spec §7/§4.9 behavior 5): it never echoes internal error
//! detail to the browser, only a generic auth-error page.

pub mod rewrite;
pub mod templates;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::auth::FileAuthStore;
use crate::backend_resolver::BackendResolver;
use crate::error::{MngrError, MngrResult};
use crate::primitives::{AgentId, CookieSigningKey, OneTimeCode};
use crate::proxy::rewrite;

type HmacSha256 = Hmac<Sha256>;

pub struct ProxyState {
    pub auth_store: FileAuthStore,
    pub resolver: BackendResolver,
    pub signing_key: CookieSigningKey,
    pub http_client: reqwest::Client,
    /// Off only for local development over plain HTTP; the `Secure`
    /// attribute is otherwise always set per spec §6 wire format.
    pub secure_cookies: bool,
}

impl ProxyState {
    pub fn new(auth_store: FileAuthStore, resolver: BackendResolver, signing_key: CookieSigningKey) -> Self {
        Self {
            auth_store,
            resolver,
            signing_key,
            http_client: reqwest::Client::new(),
            secure_cookies: true,
        }
    }
}

pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/login", get(login_page))
        .route("/authenticate", get(authenticate))
        .route("/agents/{agent_id}/__sw.js", get(service_worker))
        .route("/agents/{agent_id}", get(bootstrap_page))
        .route("/agents/{agent_id}/{*rest}", any(proxy_agent))
        .with_state(state)
}

fn cookie_name(agent_id: &AgentId) -> String {
    format!("auth_{agent_id}")
}

/// Stateless signed-cookie value: `hex(hmac_sha256(signing_key, agent_id))`.
/// Not specified by spec.md beyond "signed cookie"; this scheme lets the
/// proxy verify a cookie without keeping server-side session state.
fn sign_agent_cookie(signing_key: &CookieSigningKey, agent_id: &AgentId) -> String {
    let mut mac = HmacSha256::new_from_slice(&signing_key.0).expect("hmac accepts any key length");
    mac.update(agent_id.as_str().as_bytes());
    let tag = mac.finalize().into_bytes();
    tag.iter().map(|b| format!("{b:02x}")).collect()
}

fn verify_agent_cookie(signing_key: &CookieSigningKey, agent_id: &AgentId, value: &str) -> bool {
    let expected = sign_agent_cookie(signing_key, agent_id);
    constant_time_eq(expected.as_bytes(), value.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let Some(raw) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    raw.split(';')
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim();
            let value = parts.next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn find_cookie<'a>(cookies: &'a [(String, String)], name: &str) -> Option<&'a str> {
    cookies
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

async fn landing_page(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    let cookies = parse_cookies(&headers);
    let known = state.auth_store.list_agent_ids_with_valid_codes().await;
    let mut accessible: Vec<AgentId> = known
        .into_iter()
        .chain(state.resolver.list_known_agent_ids().await)
        .collect();
    accessible.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    accessible.dedup();
    let accessible: Vec<AgentId> = accessible
        .into_iter()
        .filter(|id| {
            find_cookie(&cookies, &cookie_name(id))
                .map(|value| verify_agent_cookie(&state.signing_key, id, value))
                .unwrap_or(false)
        })
        .collect();

    axum::response::Html(templates::render_landing_page(&accessible)).into_response()
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    agent_id: String,
    one_time_code: String,
}

async fn login_page(Query(query): Query<LoginQuery>) -> Response {
    let Ok(agent_id) = query.agent_id.parse::<AgentId>() else {
        return auth_error_response("invalid agent id in login link");
    };
    let code = OneTimeCode(query.one_time_code);
    axum::response::Html(templates::render_login_redirect_page(&agent_id, &code)).into_response()
}

async fn authenticate(State(state): State<Arc<ProxyState>>, Query(query): Query<LoginQuery>) -> Response {
    let Ok(agent_id) = query.agent_id.parse::<AgentId>() else {
        return auth_error_response("invalid agent id");
    };
    let code = OneTimeCode(query.one_time_code);

    match state.auth_store.validate_and_consume_code(&agent_id, &code).await {
        Ok(true) => {
            let prefix = format!("/agents/{agent_id}/");
            let cookie_value = sign_agent_cookie(&state.signing_key, &agent_id);
            let secure = if state.secure_cookies { "; Secure" } else { "" };
            let set_cookie = format!(
                "{}={}; Path={}; HttpOnly{}",
                cookie_name(&agent_id),
                cookie_value,
                prefix,
                secure
            );
            let mut response = Redirect::to(&prefix).into_response();
            if let Ok(value) = HeaderValue::from_str(&set_cookie) {
                response.headers_mut().append(axum::http::header::SET_COOKIE, value);
            }
            response
        }
        Ok(false) => auth_error_response(
            "This login link has already been used or is invalid. One-time codes can only be used once.",
        ),
        Err(e) => {
            tracing::warn!("authenticate failed for {agent_id}: {e}");
            auth_error_response("Authentication failed due to an internal error.")
        }
    }
}

fn auth_error_response(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, axum::response::Html(templates::render_auth_error_page(message))).into_response()
}

async fn bootstrap_page(Path(agent_id): Path<String>) -> Response {
    let Ok(agent_id) = agent_id.parse::<AgentId>() else {
        return auth_error_response("invalid agent id");
    };
    axum::response::Html(rewrite::generate_bootstrap_html(&agent_id)).into_response()
}

async fn service_worker(Path(agent_id): Path<String>) -> Response {
    let Ok(agent_id) = agent_id.parse::<AgentId>() else {
        return auth_error_response("invalid agent id");
    };
    (
        [(axum::http::header::CONTENT_TYPE, "application/javascript")],
        rewrite::generate_service_worker_js(&agent_id),
    )
        .into_response()
}

fn authorized_agent(headers: &HeaderMap, state: &ProxyState, agent_id: &AgentId) -> bool {
    let cookies = parse_cookies(headers);
    find_cookie(&cookies, &cookie_name(agent_id))
        .map(|value| verify_agent_cookie(&state.signing_key, agent_id, value))
        .unwrap_or(false)
}

async fn proxy_agent(
    State(state): State<Arc<ProxyState>>,
    Path((agent_id, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
    body: Body,
) -> Response {
    let Ok(agent_id) = agent_id.parse::<AgentId>() else {
        return auth_error_response("invalid agent id");
    };

    if !authorized_agent(&headers, &state, &agent_id) {
        return auth_error_response(
            "No valid session for this agent. Use a fresh login link; one-time codes can only be used once.",
        );
    }

    let Some(backend_url) = state.resolver.get_backend_url(&agent_id).await else {
        return auth_error_response("This agent has no backend registered right now.");
    };

    let upstream_path = format!("/{rest}");

    if let Some(upgrade) = ws {
        let ws_url = to_ws_url(&backend_url, &upstream_path);
        return upgrade.on_upgrade(move |socket| relay_websocket(socket, ws_url));
    }

    match forward_http(&state, &backend_url, &upstream_path, method, headers, body, &agent_id).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("proxy request to {backend_url} failed: {e}");
            auth_error_response("The agent's backend is not reachable right now.")
        }
    }
}

fn to_ws_url(backend_url: &str, path: &str) -> String {
    let http_url = format!("{}{path}", backend_url.trim_end_matches('/'));
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url
    }
}

async fn relay_websocket(downstream: WebSocket, upstream_url: String) {
    let upstream = match tokio_tungstenite::connect_async(&upstream_url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!("failed to connect upstream websocket {upstream_url}: {e}");
            return;
        }
    };

    let (mut down_tx, mut down_rx) = downstream.split();
    let (mut up_tx, mut up_rx) = upstream.split();

    let downstream_to_upstream = async {
        while let Some(Ok(message)) = down_rx.next().await {
            let forwarded = match message {
                AxumMessage::Text(text) => tokio_tungstenite::tungstenite::Message::Text(text.to_string()),
                AxumMessage::Binary(data) => tokio_tungstenite::tungstenite::Message::Binary(data.to_vec()),
                AxumMessage::Ping(data) => tokio_tungstenite::tungstenite::Message::Ping(data.to_vec()),
                AxumMessage::Pong(data) => tokio_tungstenite::tungstenite::Message::Pong(data.to_vec()),
                AxumMessage::Close(_) => break,
            };
            if up_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = up_tx.close().await;
    };

    let upstream_to_downstream = async {
        while let Some(Ok(message)) = up_rx.next().await {
            let forwarded = match message {
                tokio_tungstenite::tungstenite::Message::Text(text) => AxumMessage::Text(text.into()),
                tokio_tungstenite::tungstenite::Message::Binary(data) => AxumMessage::Binary(data.into()),
                tokio_tungstenite::tungstenite::Message::Ping(data) => AxumMessage::Ping(data.into()),
                tokio_tungstenite::tungstenite::Message::Pong(data) => AxumMessage::Pong(data.into()),
                tokio_tungstenite::tungstenite::Message::Close(_) => break,
                tokio_tungstenite::tungstenite::Message::Frame(_) => continue,
            };
            if down_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(downstream_to_upstream, upstream_to_downstream);
}

async fn forward_http(
    state: &ProxyState,
    backend_url: &str,
    upstream_path: &str,
    method: Method,
    headers: HeaderMap,
    body: Body,
    agent_id: &AgentId,
) -> MngrResult<Response> {
    let url = format!("{}{upstream_path}", backend_url.trim_end_matches('/'));
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| MngrError::internal(format!("failed to buffer request body: {e}")))?;

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| MngrError::internal(format!("invalid method: {e}")))?;
    let mut request = state.http_client.request(reqwest_method, &url);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::COOKIE {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            request = request.header(name.as_str(), value_str);
        }
    }
    request = request.body(body_bytes.to_vec());

    let upstream_response = request
        .send()
        .await
        .map_err(|e| MngrError::provider_degraded(None, format!("upstream request failed: {e}")))?;

    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    let is_html = upstream_headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    let body_bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| MngrError::internal(format!("failed to read upstream response body: {e}")))?;

    let mut response_builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_headers.iter() {
        if name == reqwest::header::SET_COOKIE {
            continue;
        }
        if name == reqwest::header::CONTENT_LENGTH {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_builder = response_builder.header(name, value);
        }
    }
    for cookie in upstream_headers.get_all(reqwest::header::SET_COOKIE) {
        if let Ok(cookie_str) = cookie.to_str() {
            let rewritten = rewrite::rewrite_cookie_path(cookie_str, agent_id);
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                response_builder = response_builder.header(axum::http::header::SET_COOKIE, value);
            }
        }
    }

    let final_body = if is_html {
        let html = String::from_utf8_lossy(&body_bytes);
        rewrite::rewrite_proxied_html(&html, agent_id).into_bytes()
    } else {
        body_bytes.to_vec()
    };

    response_builder
        .body(Body::from(final_body))
        .map_err(|e| MngrError::internal(format!("failed to build proxied response: {e}")))
}

impl IntoResponse for MngrError {
    fn into_response(self) -> Response {
        tracing::warn!("proxy error: {self}");
        auth_error_response("Something went wrong handling this request.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent_id() -> AgentId {
        "agent-00000000000000000000000000000001".parse().unwrap()
    }

    #[test]
    fn cookie_signature_round_trips() {
        let key = CookieSigningKey(b"test-signing-key-material".to_vec());
        let agent = test_agent_id();
        let signed = sign_agent_cookie(&key, &agent);
        assert!(verify_agent_cookie(&key, &agent, &signed));
    }

    #[test]
    fn cookie_signature_rejects_tampering() {
        let key = CookieSigningKey(b"test-signing-key-material".to_vec());
        let agent = test_agent_id();
        let signed = sign_agent_cookie(&key, &agent);
        assert!(!verify_agent_cookie(&key, &agent, &format!("{signed}ff")));
    }

    #[test]
    fn cookie_signature_is_agent_specific() {
        let key = CookieSigningKey(b"test-signing-key-material".to_vec());
        let agent_a = test_agent_id();
        let agent_b = AgentId::new_random();
        let signed = sign_agent_cookie(&key, &agent_a);
        assert!(!verify_agent_cookie(&key, &agent_b, &signed));
    }

    #[test]
    fn parse_cookies_splits_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("auth_agent-1=abc; sw_installed_agent-1=1"),
        );
        let cookies = parse_cookies(&headers);
        assert_eq!(find_cookie(&cookies, "auth_agent-1"), Some("abc"));
        assert_eq!(find_cookie(&cookies, "sw_installed_agent-1"), Some("1"));
    }

    #[test]
    fn to_ws_url_converts_scheme() {
        assert_eq!(to_ws_url("http://localhost:9000", "/socket"), "ws://localhost:9000/socket");
        assert_eq!(to_ws_url("https://localhost:9000", "/socket"), "wss://localhost:9000/socket");
    }
}
