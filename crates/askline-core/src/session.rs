//! Session negotiation over HTTP long-polling.
//!
//! Two round-trips against the engine endpoint: a `GET` that hands out the
//! session id, then a `POST` carrying the anonymous namespace-connect packet.
//! Cookies set by either response are kept and later forwarded verbatim on the
//! WebSocket upgrade, which the service uses to tie both phases together.

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{AskError, Result};
use crate::protocol::frame::{split_payloads, split_prefix};

/// Literal body the server answers a successful polling `POST` with.
const AUTH_OK: &str = "OK";

/// Engine.IO open packet contents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// Parse a long-polling handshake body such as `0{"sid":"…",…}`.
///
/// Only the first packet of the body is considered; all leading frame digits
/// are stripped before the JSON is parsed.
pub fn parse_handshake(body: &str) -> Result<HandshakeInfo> {
    let packet = split_payloads(body)
        .next()
        .ok_or_else(|| AskError::Handshake("empty handshake response".into()))?;
    let (_, json) = split_prefix(packet);
    let info: HandshakeInfo = serde_json::from_str(json)
        .map_err(|e| AskError::Handshake(format!("unparsable handshake {packet:?}: {e}")))?;
    if info.sid.is_empty() {
        return Err(AskError::Handshake("handshake carried an empty sid".into()));
    }
    Ok(info)
}

/// Cookies collected during negotiation, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    /// Record every `Set-Cookie` header of a response.
    pub fn store_from_headers(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(raw) => self.store(raw),
                Err(_) => debug!("skipping non-ASCII Set-Cookie header"),
            }
        }
    }

    /// Record one `Set-Cookie` value; attributes after the first `;` are ignored.
    pub fn store(&mut self, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or_default().trim();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let value = value.trim().to_string();
        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value,
            None => self.cookies.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` request header value: `a=1; b=2`.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// A negotiated session, ready to be upgraded to a duplex channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub sid: String,
    pub authenticated: bool,
    pub handshake: HandshakeInfo,
    pub cookies: CookieJar,
}

/// Performs the handshake and anonymous authentication.
pub struct Negotiator<'a> {
    config: &'a ClientConfig,
    http: reqwest::Client,
}

impl<'a> Negotiator<'a> {
    pub fn new(config: &'a ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&config.service.user_agent)?);
        headers.insert(
            HeaderName::from_static("x-client-name"),
            header_value(&config.service.client_name)?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| AskError::Config(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Acquire a session id and authenticate it anonymously. No retries.
    #[instrument(skip(self), fields(base = %self.config.service.base_url))]
    pub async fn negotiate(&self) -> Result<Session> {
        let token = client_token();
        let mut cookies = CookieJar::default();

        let handshake = self.handshake(&token, &mut cookies).await?;
        debug!(
            sid = %handshake.sid,
            ping_interval = handshake.ping_interval,
            upgrades = ?handshake.upgrades,
            "handshake complete"
        );
        if !handshake.upgrades.is_empty() && !handshake.upgrades.iter().any(|u| u == "websocket") {
            warn!(upgrades = ?handshake.upgrades, "server does not advertise a websocket upgrade");
        }

        self.authenticate(&token, &handshake.sid, &mut cookies).await?;
        debug!(cookies = cookies.len(), "anonymous session authenticated");

        Ok(Session {
            sid: handshake.sid.clone(),
            authenticated: true,
            handshake,
            cookies,
        })
    }

    async fn handshake(&self, token: &str, cookies: &mut CookieJar) -> Result<HandshakeInfo> {
        let url = self.config.polling_url(token, None)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AskError::Handshake(e.to_string()))?;
        cookies.store_from_headers(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            return Err(AskError::Handshake(format!("HTTP {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| AskError::Handshake(e.to_string()))?;
        parse_handshake(&body)
    }

    async fn authenticate(&self, token: &str, sid: &str, cookies: &mut CookieJar) -> Result<()> {
        let url = self.config.polling_url(token, Some(sid))?;
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(format!("40{}", self.config.service.auth_payload));
        if let Some(cookie) = cookies.header_value() {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AskError::Auth(e.to_string()))?;
        cookies.store_from_headers(resp.headers());

        let status = resp.status();
        let body = resp.text().await.map_err(|e| AskError::Auth(e.to_string()))?;
        if body != AUTH_OK {
            return Err(AskError::Auth(format!("HTTP {status}, unexpected response {body:?}")));
        }
        Ok(())
    }
}

/// Eight hex digits of cache-busting noise for the `t` query parameter.
pub fn client_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|e| AskError::Config(format!("header {raw:?}: {e}")))
}
