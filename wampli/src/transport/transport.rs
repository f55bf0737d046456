use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};

/// Data moving through a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportData {
    /// A health check from the router, which must be answered with a [`TransportData::Pong`]
    /// carrying the same payload.
    Ping(Vec<u8>),
    /// The answer to a health check.
    Pong(Vec<u8>),
    /// A serialized WAMP message.
    Message(Vec<u8>),
}

/// A transport, over which serialized WAMP messages are sent and received.
///
/// Implemented as a [`Stream`] and [`Sink`] that extracts out meaningful data and reports framing
/// violations to be handled at higher layers. The stream ends when the connection is closed.
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin + Debug
{
}
