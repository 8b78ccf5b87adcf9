//! Client configuration
//!
//! Everything the call client needs to know up front: where the signaling
//! server lives, who the local user is, how hard to retry, and which ICE
//! servers to hand to the peer connection.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default signaling endpoint (can be overridden via `SIGNALING_URL`)
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:5000/ws";

/// Reconnect attempts before giving up
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Missing identity field: {0}")]
    MissingIdentity(&'static str),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// IDENTITY
// ============================================================================

/// The local user as announced in `register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub department: String,
    pub role: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        department: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            department: department.into(),
            role: role.into(),
            display_name: None,
        }
    }

    /// Sets the name callees see instead of the user id
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name shown to callees; falls back to the user id
    pub fn caller_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Bounded, fixed-delay reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the budget is spent
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// ICE SERVERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Public STUN servers, enough for most hospital LAN/NAT setups
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub server_url: String,
    pub identity: Identity,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, identity: Identity) -> Self {
        Self {
            server_url: server_url.into(),
            identity,
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
            ice_servers: default_ice_servers(),
        }
    }

    /// Builds a config for `identity` from the process environment
    ///
    /// Reads `SIGNALING_URL`, `SIGNALING_TOKEN`, `SIGNALING_RECONNECT_ATTEMPTS`,
    /// `SIGNALING_RECONNECT_DELAY_MS` and the `TURN_*` triple.
    pub fn from_env(identity: Identity) -> Result<Self, ConfigError> {
        Self::from_lookup(identity, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(identity: Identity, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url =
            lookup("SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let mut config = Self::new(server_url, identity);
        config.auth_token = lookup("SIGNALING_TOKEN").filter(|t| !t.is_empty());

        if let Some(raw) = lookup("SIGNALING_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts =
                raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SIGNALING_RECONNECT_ATTEMPTS",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup("SIGNALING_RECONNECT_DELAY_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SIGNALING_RECONNECT_DELAY_MS",
                value: raw.clone(),
            })?;
            config.reconnect.delay = Duration::from_millis(millis);
        }

        if let Some(url) = lookup("TURN_URL") {
            config.add_turn_server(
                url,
                lookup("TURN_USERNAME").unwrap_or_default(),
                lookup("TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds TURN credentials on top of the STUN defaults
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServer {
            urls: vec![url],
            username,
            credential,
        });
    }

    /// Checks the URL scheme and that the identity is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ws_url()?;
        if self.identity.user_id.trim().is_empty() {
            return Err(ConfigError::MissingIdentity("userId"));
        }
        if self.identity.department.trim().is_empty() {
            return Err(ConfigError::MissingIdentity("department"));
        }
        Ok(())
    }

    /// Server URL normalised to a WebSocket scheme
    ///
    /// `http(s)://` is rewritten to `ws(s)://` the way browsers resolve the
    /// console's API origin.
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.server_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| invalid("cannot switch scheme".to_string()))?;
        }
        Ok(url)
    }
}

// ============================================================================
// TESTS
// ============================================================================
