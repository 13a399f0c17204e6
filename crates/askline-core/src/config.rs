use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{AskError, Result};
use crate::protocol::ENGINE_IO_VERSION;
use crate::protocol::sequence::DEFAULT_BASE;

/// Mobile client identity. The service only hands out anonymous sessions to
/// requests that look like they come from its iOS app.
pub const DEFAULT_USER_AGENT: &str = "Ask/2.4.1/224 (iOS; iPhone; Version 18.1) isiOSOnMac/false";
pub const DEFAULT_CLIENT_NAME: &str = "Perplexity-iOS";

/// Everything a client instance needs; passed by reference into each component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service: ServiceConfig,
    pub query: QueryConfig,
    pub connect: ConnectPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP(S) origin used for the long-polling handshake
    pub base_url: String,
    /// Override for the duplex origin (defaults to `base_url` with a ws scheme)
    pub websocket_url: Option<String>,
    /// Engine endpoint path
    pub path: String,
    pub user_agent: String,
    pub client_name: String,
    /// JSON body of the anonymous namespace-connect packet
    pub auth_payload: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.perplexity.ai".to_string(),
            websocket_url: None,
            path: "/socket.io/".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            auth_payload: r#"{"jwt":"anonymous-ask-user"}"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Event name of the outbound query packet
    pub event: String,
    pub language: String,
    pub timezone: String,
    pub search_focus: String,
    pub mode: String,
    /// Ceiling on the wait for a terminal fragment, measured from the send
    pub answer_timeout_secs: u64,
    /// Capacity of the fragment queue between the channel task and the consumer
    pub fragment_buffer: usize,
    /// Initial packet id base
    pub sequence_base: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            event: "perplexity_ask".to_string(),
            language: "en-GB".to_string(),
            timezone: "UTC".to_string(),
            search_focus: "internet".to_string(),
            mode: "concise".to_string(),
            answer_timeout_secs: 30,
            fragment_buffer: 256,
            sequence_base: DEFAULT_BASE,
        }
    }
}

impl QueryConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }
}

/// Bounded wait for the duplex upgrade: poll every `poll_interval_ms`, give
/// up after `max_attempts` polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectPolicy {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_attempts: 50,
        }
    }
}

impl ConnectPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Total time the opener is willing to wait.
    pub fn budget(&self) -> Duration {
        self.poll_interval()
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }
}

impl ClientConfig {
    /// Default location: `~/.askline/config.toml`.
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".askline").join("config.toml")
    }

    /// Load configuration from file, falling back to defaults when absent.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: ClientConfig = toml::from_str(&content)
                .map_err(|e| AskError::Config(format!("{}: {}", config_path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(ClientConfig::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| AskError::Config(e.to_string()))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        if self.query.answer_timeout_secs == 0 {
            return Err(AskError::Config("answer_timeout_secs must be positive".into()));
        }
        if self.query.fragment_buffer == 0 {
            return Err(AskError::Config("fragment_buffer must be positive".into()));
        }
        if self.connect.max_attempts == 0 || self.connect.poll_interval_ms == 0 {
            return Err(AskError::Config("connect budget must be positive".into()));
        }
        Ok(())
    }

    fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.service.base_url)
            .map_err(|e| AskError::Config(format!("base_url {:?}: {}", self.service.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(AskError::Config(format!("base_url scheme {other:?} is not http(s)"))),
        }
    }

    /// Long-polling endpoint: `?EIO=4&transport=polling&t=<token>[&sid=<sid>]`.
    pub fn polling_url(&self, token: &str, sid: Option<&str>) -> Result<Url> {
        let mut url = self
            .base_url()?
            .join(&self.service.path)
            .map_err(|e| AskError::Config(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("EIO", &ENGINE_IO_VERSION.to_string())
                .append_pair("transport", "polling")
                .append_pair("t", token);
            if let Some(sid) = sid {
                query.append_pair("sid", sid);
            }
        }
        Ok(url)
    }

    /// Duplex endpoint: `ws(s)://…?EIO=4&transport=websocket&sid=<sid>`.
    pub fn websocket_url(&self, sid: &str) -> Result<Url> {
        let origin = match &self.service.websocket_url {
            Some(raw) => Url::parse(raw)
                .map_err(|e| AskError::Config(format!("websocket_url {raw:?}: {e}")))?,
            None => {
                let mut url = self.base_url()?;
                let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
                url.set_scheme(scheme)
                    .map_err(|_| AskError::Config(format!("cannot derive {scheme} url")))?;
                url
            }
        };
        let mut url = origin
            .join(&self.service.path)
            .map_err(|e| AskError::Config(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("EIO", &ENGINE_IO_VERSION.to_string())
            .append_pair("transport", "websocket")
            .append_pair("sid", sid);
        Ok(url)
    }
}
