use std::time::Duration;

use anyhow::{
    Error,
    Result,
};

use crate::{
    core::{
        roles::PeerRole,
        types::HashMap,
    },
    serializer::serializer::SerializerType,
    transport::raw_socket_transport::DEFAULT_MAX_LENGTH_EXPONENT,
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for WebSocket connections.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConfig {
    /// Additional headers to include in the WebSocket handshake request.
    pub headers: HashMap<String, String>,
}

/// Configuration for RawSocket connections.
#[derive(Debug, Clone)]
pub struct RawSocketConfig {
    /// Largest message we accept, as the exponent `n` of `2^(9 + n)` bytes. At most 15.
    pub max_length_exponent: u8,
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            max_length_exponent: DEFAULT_MAX_LENGTH_EXPONENT,
        }
    }
}

/// Configuration for a [`Session`][`crate::session::Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the session, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles announced to the router.
    pub roles: Vec<PeerRole>,
    /// Allowed serializers, in order of preference.
    ///
    /// The actual serializer is selected when the connection with the router is established.
    pub serializers: Vec<SerializerType>,
    /// Additional configuration for WebSocket connections.
    pub web_socket: Option<WebSocketConfig>,
    /// Additional configuration for RawSocket connections.
    pub raw_socket: RawSocketConfig,
    /// How long to wait for the connection to the router to open.
    pub connect_timeout: Duration,
    /// How long to wait for WELCOME after sending HELLO.
    pub handshake_timeout: Duration,
    /// How long to wait for the router's GOODBYE when leaving.
    pub goodbye_timeout: Duration,
    /// Timeout for calls that do not set their own, and for other requests awaiting a router
    /// acknowledgement.
    pub request_timeout: Option<Duration>,
}

impl SessionConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(Error::msg("at least one serializer is required"));
        }
        if self.roles.is_empty() {
            return Err(Error::msg("at least one role is required"));
        }
        for (i, serializer) in self.serializers.iter().enumerate() {
            if self.serializers[..i].contains(serializer) {
                return Err(Error::msg(format!("serializer {serializer} is listed twice")));
            }
        }
        if self.raw_socket.max_length_exponent > 15 {
            return Err(Error::msg("raw socket max length exponent must be at most 15"));
        }
        if self.handshake_timeout.is_zero() || self.goodbye_timeout.is_zero() {
            return Err(Error::msg("handshake and goodbye timeouts must be positive"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: Vec::from_iter(PeerRole::all()),
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            web_socket: None,
            raw_socket: RawSocketConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            goodbye_timeout: Duration::from_secs(5),
            request_timeout: None,
        }
    }
}
