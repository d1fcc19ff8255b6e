//! Single-credential gateway authentication.
//!
//! Session cookies are HMAC-SHA256 signed `username|unix-expiry|signature`
//! strings under a random per-process key, so a gateway restart invalidates
//! every session. Login is protected by a CSRF cookie scoped to `/auth/`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::warn;

use super::{login, GatewayState};

pub const SESSION_COOKIE: &str = "sp_session";
pub const CSRF_COOKIE: &str = "sp_csrf";
pub const SESSION_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

type HmacSha256 = Hmac<Sha256>;

pub struct Auth {
    username: String,
    password: String,
    hmac_key: [u8; 32],
}

impl Auth {
    /// The signing key is minted fresh at process start.
    pub fn new(username: String, password: String) -> Self {
        let mut hmac_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut hmac_key);
        Self {
            username,
            password,
            hmac_key,
        }
    }

    pub fn credentials_match(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    /// Token format: `username|expiry_unix|signature`.
    pub fn sign_session(&self, username: &str, expires_unix: u64) -> String {
        let payload = format!("{username}|{expires_unix}");
        format!("{payload}|{}", self.sign(&payload))
    }

    pub fn valid_token(&self, token: &str, now_unix: u64) -> bool {
        let mut parts = token.splitn(3, '|');
        let (Some(username), Some(expiry), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        let payload = format!("{username}|{expiry}");
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.hmac_key) else {
            return false;
        };
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            return false;
        }

        if username != self.username {
            return false;
        }
        let Ok(expiry) = expiry.parse::<u64>() else {
            return false;
        };
        now_unix <= expiry
    }

    pub fn valid_session(&self, headers: &HeaderMap) -> bool {
        match cookie_value(headers, SESSION_COOKIE) {
            Some(token) => self.valid_token(&token, unix_now()),
            None => false,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for raw in headers.get_all(header::COOKIE) {
        let Ok(raw) = raw.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn generate_csrf() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn csrf_cookie(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{CSRF_COOKIE}={value}; Path=/auth/; HttpOnly; Secure; SameSite=Strict"
    ))
    .ok()
}

fn clear_csrf_cookie() -> HeaderValue {
    HeaderValue::from_static("sp_csrf=; Path=/auth/; Max-Age=0")
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("sp_session=; Path=/; Max-Age=0")
}

/// Enforces a valid session on everything except the health, auth and tunnel
/// paths. API and WebSocket callers get a JSON 401; browsers are redirected
/// to the login page.
pub async fn auth_middleware(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let exempt = path == "/api/health"
        || path.starts_with("/auth/")
        || path == "/tunnel"
        || path == "/gateway/health";
    if exempt {
        return next.run(req).await;
    }

    if !state.auth.valid_session(req.headers()) {
        if path.starts_with("/api/") || path.starts_with("/ws/") {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response();
        }
        return Redirect::to("/auth/login").into_response();
    }

    next.run(req).await
}

pub async fn login_page(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if state.auth.valid_session(&headers) {
        return Redirect::to("/").into_response();
    }
    fresh_login_page("")
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub csrf_token: String,
}

pub async fn login(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let csrf = cookie_value(&headers, CSRF_COOKIE).unwrap_or_default();
    if csrf.is_empty() || csrf != form.csrf_token {
        return fresh_login_page("Invalid request, please try again");
    }

    if !state.auth.credentials_match(&form.username, &form.password) {
        warn!(username = %form.username, "failed login attempt");
        return fresh_login_page("Invalid username or password");
    }

    let expires = unix_now() + SESSION_DURATION.as_secs();
    let token = state.auth.sign_session(&form.username, expires);
    let session_cookie = HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
        SESSION_DURATION.as_secs()
    ));
    let Ok(session_cookie) = session_cookie else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "cookie encoding failed").into_response();
    };

    let mut response = Redirect::to("/").into_response();
    response
        .headers_mut()
        .append(header::SET_COOKIE, session_cookie);
    response
        .headers_mut()
        .append(header::SET_COOKIE, clear_csrf_cookie());
    response
}

pub async fn logout() -> Response {
    let mut response = Redirect::to("/auth/login").into_response();
    response
        .headers_mut()
        .append(header::SET_COOKIE, clear_session_cookie());
    response
}

fn fresh_login_page(error: &str) -> Response {
    let csrf = generate_csrf();
    let mut response = Html(login::render(&csrf, error)).into_response();
    if let Some(cookie) = csrf_cookie(&csrf) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Auth {
        Auth::new("admin".into(), "hunter2".into())
    }

    #[test]
    fn session_token_round_trips() {
        let auth = auth();
        let token = auth.sign_session("admin", 2_000_000_000);
        assert!(auth.valid_token(&token, 1_900_000_000));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = auth();
        let token = auth.sign_session("admin", 1_000);
        assert!(!auth.valid_token(&token, 2_000));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let auth = auth();
        let token = auth.sign_session("admin", 2_000_000_000);
        let tampered = token.replace("admin", "evil!");
        assert!(!auth.valid_token(&tampered, 1_000));

        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let flipped = String::from_utf8(bytes).unwrap();
        assert!(!auth.valid_token(&flipped, 1_000));
    }

    #[test]
    fn token_for_other_user_is_rejected() {
        let auth = auth();
        // A token self-signed for another username never validates even with
        // an intact signature.
        let token = auth.sign_session("other", 2_000_000_000);
        assert!(!auth.valid_token(&token, 1_000));
    }

    #[test]
    fn restart_invalidates_existing_sessions() {
        let first = auth();
        let token = first.sign_session("admin", 2_000_000_000);
        let second = auth();
        assert!(!second.valid_token(&token, 1_000));
    }

    #[test]
    fn cookie_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; sp_session=tok|123|abc; sp_csrf=zzz"),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("tok|123|abc")
        );
        assert_eq!(cookie_value(&headers, CSRF_COOKIE).as_deref(), Some("zzz"));
        assert!(cookie_value(&headers, "missing").is_none());
    }
}
