use std::fmt::Debug;

use anyhow::{
    Context,
    Error,
    Result,
};
use async_trait::async_trait;
use log::{
    debug,
    warn,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};
use url::Url;

use crate::{
    core::{
        error::TransportError,
        stream::{
            MessageStream,
            TransportMessageStream,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    session::config::SessionConfig,
    transport::{
        raw_socket_transport::RawSocketTransport,
        web_socket_transport::WebSocketTransport,
    },
};

/// A connection to a WAMP router produced by a [`Connector`].
#[derive(Debug)]
pub struct Connection {
    pub stream: Box<dyn MessageStream>,
    pub serializer: SerializerType,
}

/// A type for initiating a connection to a router.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, config: &SessionConfig, url: &Url) -> Result<Connection>;
}

/// Selects the [`Connector`] for an endpoint by its URL scheme.
pub fn connector_for_url(url: &Url) -> Result<Box<dyn Connector>> {
    match url.scheme() {
        "ws" | "wss" => Ok(Box::new(WebSocketConnector::default())),
        "tcp" | "rs" => Ok(Box::new(RawSocketConnector::default())),
        "rss" => Err(TransportError::UnsupportedEndpoint(
            "RawSocket over TLS (rss://) is not supported".to_owned(),
        )
        .into()),
        scheme => Err(TransportError::UnsupportedEndpoint(format!(
            "unknown scheme {scheme}://, expected ws://, wss://, tcp:// or rs://"
        ))
        .into()),
    }
}

/// Connects over WebSocket, negotiating the serializer as the WebSocket sub-protocol.
#[derive(Debug, Default)]
pub struct WebSocketConnector {}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &SessionConfig, url: &Url) -> Result<Connection> {
        let mut request = ClientRequestBuilder::new(url.as_str().try_into()?);
        if !config.agent.is_empty() {
            request = request.with_header("User-Agent", &config.agent);
        }
        for serializer in &config.serializers {
            request = request.with_sub_protocol(serializer.uri().to_string());
        }
        if let Some(web_socket) = &config.web_socket {
            for (key, value) in &web_socket.headers {
                request = request.with_header(key, value);
            }
        }

        let (stream, response) = connect_async(request)
            .await
            .with_context(|| format!("failed to open WebSocket connection to {url}"))?;
        let serializer = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => SerializerType::try_from(protocol.to_str()?)?,
            None => {
                return Err(TransportError::SerializerNegotiation(
                    "handshake did not produce a sub-protocol".to_owned(),
                )
                .into());
            }
        };
        if !config.serializers.contains(&serializer) {
            return Err(TransportError::SerializerNegotiation(format!(
                "router selected {serializer}, which was not offered"
            ))
            .into());
        }

        let transport = WebSocketTransport::new(stream, serializer);
        Ok(Connection {
            stream: Box::new(TransportMessageStream::new(
                Box::new(transport),
                new_serializer(serializer),
            )),
            serializer,
        })
    }
}

/// Connects over TCP with RawSocket framing.
///
/// Serializers are tried in order of preference, reconnecting if the router rejects one.
#[derive(Debug, Default)]
pub struct RawSocketConnector {}

impl RawSocketConnector {
    fn address(url: &Url) -> Result<String> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::msg(format!("{url} has no host")))?;
        let port = url
            .port()
            .ok_or_else(|| Error::msg(format!("{url} has no port")))?;
        Ok(format!("{host}:{port}"))
    }
}

#[async_trait]
impl Connector for RawSocketConnector {
    async fn connect(&self, config: &SessionConfig, url: &Url) -> Result<Connection> {
        let address = Self::address(url)?;
        let mut last_error = None;
        for serializer in &config.serializers {
            let stream = TcpStream::connect(&address)
                .await
                .with_context(|| format!("failed to open TCP connection to {address}"))?;
            match RawSocketTransport::handshake(
                stream,
                *serializer,
                config.raw_socket.max_length_exponent,
            )
            .await
            {
                Ok(transport) => {
                    debug!("RawSocket handshake with {address} selected {serializer}");
                    return Ok(Connection {
                        stream: Box::new(TransportMessageStream::new(
                            Box::new(transport),
                            new_serializer(*serializer),
                        )),
                        serializer: *serializer,
                    });
                }
                Err(err) => {
                    warn!("RawSocket handshake with {address} using {serializer} failed: {err:#}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::msg("no serializers configured")))
    }
}

#[cfg(test)]
mod connector_test {
    use url::Url;

    use crate::{
        core::error::TransportError,
        session::connector::{
            RawSocketConnector,
            connector_for_url,
        },
    };

    #[test]
    fn selects_connector_by_scheme() {
        for url in [
            "ws://localhost:8080/ws",
            "wss://example.com/ws",
            "tcp://localhost:8081",
            "rs://localhost:8081",
        ] {
            assert_matches::assert_matches!(connector_for_url(&Url::parse(url).unwrap()), Ok(_));
        }
    }

    #[test]
    fn rejects_unsupported_schemes() {
        assert_matches::assert_matches!(connector_for_url(&Url::parse("rss://localhost:8081").unwrap()), Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<TransportError>(), Some(TransportError::UnsupportedEndpoint(_)));
        });
        assert_matches::assert_matches!(
            connector_for_url(&Url::parse("http://localhost:8080").unwrap()),
            Err(_)
        );
    }

    #[test]
    fn requires_raw_socket_port() {
        assert_matches::assert_matches!(
            RawSocketConnector::address(&Url::parse("tcp://localhost:8081").unwrap()),
            Ok(address) => {
                assert_eq!(address, "localhost:8081");
            }
        );
        assert_matches::assert_matches!(
            RawSocketConnector::address(&Url::parse("tcp://localhost").unwrap()),
            Err(_)
        );
    }
}
