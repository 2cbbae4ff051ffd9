use std::time::Duration;

use crate::error::{JanusError, JanusResult};

pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_millis(25_000);
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_POLL_EVENTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One gateway endpoint, or an ordered list tried until one accepts the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerList {
    Single(String),
    Multiple(Vec<String>),
}

impl ServerList {
    pub fn as_slice(&self) -> &[String] {
        match self {
            ServerList::Single(server) => std::slice::from_ref(server),
            ServerList::Multiple(servers) => servers,
        }
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, ServerList::Multiple(_))
    }
}

impl From<&str> for ServerList {
    fn from(value: &str) -> Self {
        ServerList::Single(value.to_string())
    }
}

impl From<String> for ServerList {
    fn from(value: String) -> Self {
        ServerList::Single(value)
    }
}

impl From<Vec<String>> for ServerList {
    fn from(value: Vec<String>) -> Self {
        ServerList::Multiple(value)
    }
}

impl From<Vec<&str>> for ServerList {
    fn from(value: Vec<&str>) -> Self {
        ServerList::Multiple(value.into_iter().map(str::to_owned).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// Settings for one gateway session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub servers: ServerList,
    /// Token for the gateway's token-based authentication.
    pub token: Option<String>,
    /// Shared API secret, when the gateway requires one.
    pub apisecret: Option<String>,
    /// Keepalive interval on the socket transport.
    pub keepalive_period: Duration,
    /// Upper bound for a single long poll on the polling transport.
    pub long_poll_timeout: Duration,
    /// `maxev` sent with each long poll; never below 1.
    pub max_poll_events: u32,
    pub with_credentials: bool,
    /// Optional bound on how long a request waits for its reply.
    pub request_timeout: Option<Duration>,
    /// Pause before trying the next server in the list.
    pub retry_delay: Duration,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub ipv6: bool,
}

impl SessionConfig {
    pub fn new(servers: impl Into<ServerList>) -> Self {
        Self {
            servers: servers.into(),
            token: None,
            apisecret: None,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            max_poll_events: DEFAULT_MAX_POLL_EVENTS,
            with_credentials: false,
            request_timeout: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            ice_transport_policy: IceTransportPolicy::default(),
            bundle_policy: BundlePolicy::default(),
            ipv6: false,
        }
    }

    pub fn builder(servers: impl Into<ServerList>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig::new(servers),
        }
    }

    /// Reads `JANUS_SERVER` (comma separated), `JANUS_TOKEN`, `JANUS_API_SECRET`,
    /// `JANUS_KEEPALIVE_MS` and `JANUS_MAX_POLL_EVENTS`.
    pub fn from_env() -> JanusResult<Self> {
        let raw = std::env::var("JANUS_SERVER")
            .map_err(|_| JanusError::Config("JANUS_SERVER is not set".into()))?;
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let servers = if servers.len() == 1 {
            ServerList::Single(servers[0].clone())
        } else {
            ServerList::Multiple(servers)
        };

        let mut config = SessionConfig::new(servers);
        config.token = std::env::var("JANUS_TOKEN").ok();
        config.apisecret = std::env::var("JANUS_API_SECRET").ok();
        if let Ok(value) = std::env::var("JANUS_KEEPALIVE_MS") {
            let millis = value.parse::<u64>().map_err(|err| {
                JanusError::Config(format!("invalid JANUS_KEEPALIVE_MS '{value}': {err}"))
            })?;
            config.keepalive_period = Duration::from_millis(millis);
        }
        if let Ok(value) = std::env::var("JANUS_MAX_POLL_EVENTS") {
            let maxev = value.parse::<u32>().map_err(|err| {
                JanusError::Config(format!("invalid JANUS_MAX_POLL_EVENTS '{value}': {err}"))
            })?;
            config.max_poll_events = maxev.max(1);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> JanusResult<()> {
        let servers = self.servers.as_slice();
        if servers.is_empty() {
            return Err(JanusError::Config("invalid server url: empty list".into()));
        }
        if let Some(position) = servers.iter().position(|s| s.trim().is_empty()) {
            return Err(JanusError::Config(format!(
                "invalid server url at position {position}"
            )));
        }
        if self.keepalive_period.is_zero() {
            return Err(JanusError::Config("keepalive period must be non-zero".into()));
        }
        Ok(())
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn apisecret(mut self, secret: impl Into<String>) -> Self {
        self.config.apisecret = Some(secret.into());
        self
    }

    pub fn keepalive_period(mut self, period: Duration) -> Self {
        self.config.keepalive_period = period;
        self
    }

    pub fn long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.long_poll_timeout = timeout;
        self
    }

    pub fn max_poll_events(mut self, maxev: u32) -> Self {
        self.config.max_poll_events = maxev.max(1);
        self
    }

    pub fn with_credentials(mut self, enabled: bool) -> Self {
        self.config.with_credentials = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.config.ice_servers.push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    pub fn ice_transport_policy(mut self, policy: IceTransportPolicy) -> Self {
        self.config.ice_transport_policy = policy;
        self
    }

    pub fn bundle_policy(mut self, policy: BundlePolicy) -> Self {
        self.config.bundle_policy = policy;
        self
    }

    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.config.ipv6 = enabled;
        self
    }

    pub fn build(self) -> JanusResult<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
