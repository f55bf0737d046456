use std::{
    fmt::Debug,
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};

use crate::{
    core::error::SessionError,
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// An item on a [`MessageStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Message(Message),
}

/// A duplex stream of WAMP messages, which is the message-level side of a connection.
pub trait MessageStream:
    Send
    + Stream<Item = Result<StreamMessage>>
    + Sink<StreamMessage, Error = Error>
    + Unpin
    + Debug
{
}

/// A [`MessageStream`] over a byte-level [`Transport`] and a [`Serializer`].
///
/// Frames that fail to deserialize surface as [`SessionError::Decode`].
#[derive(Debug)]
pub struct TransportMessageStream {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
}

impl TransportMessageStream {
    pub fn new(transport: Box<dyn Transport>, serializer: Box<dyn Serializer>) -> Self {
        Self {
            transport,
            serializer,
        }
    }
}

impl MessageStream for TransportMessageStream {}

impl Stream for TransportMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Ping(data))))
            }
            Some(Ok(TransportData::Pong(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Pong(data))))
            }
            Some(Ok(TransportData::Message(data))) => match self.serializer.deserialize(&data) {
                Ok(message) => task::Poll::Ready(Some(Ok(StreamMessage::Message(message)))),
                Err(err) => task::Poll::Ready(Some(Err(SessionError::Decode(format!(
                    "{err:#}"
                ))
                .into()))),
            },
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for TransportMessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: StreamMessage,
    ) -> std::result::Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Pong(data) => TransportData::Pong(data),
            StreamMessage::Message(message) => {
                TransportData::Message(self.serializer.serialize(&message)?)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}

/// An in-memory [`MessageStream`], connected directly to another [`DirectMessageStream`].
///
/// Messages skip serialization entirely. Closing either side ends the other side's stream.
#[derive(Debug)]
pub struct DirectMessageStream {
    message_tx: Option<UnboundedSender<StreamMessage>>,
    message_rx: UnboundedReceiver<StreamMessage>,
}

impl DirectMessageStream {
    /// Creates two streams connected to each other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        (
            Self {
                message_tx: Some(a_tx),
                message_rx: b_rx,
            },
            Self {
                message_tx: Some(b_tx),
                message_rx: a_rx,
            },
        )
    }
}

impl MessageStream for DirectMessageStream {}

impl Stream for DirectMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.message_rx.poll_recv(cx).map(|message| message.map(Ok))
    }
}

impl Sink<StreamMessage> for DirectMessageStream {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: StreamMessage,
    ) -> std::result::Result<(), Self::Error> {
        match &self.message_tx {
            Some(message_tx) => message_tx
                .send(item)
                .map_err(|_| Error::msg("direct stream peer is closed")),
            None => Err(Error::msg("direct stream is closed")),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.message_tx = None;
        self.message_rx.close();
        task::Poll::Ready(Ok(()))
    }
}
