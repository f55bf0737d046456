use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpStream,
};
use tokio_util::codec::{
    Decoder,
    Encoder,
    Framed,
};

use crate::{
    core::error::TransportError,
    serializer::serializer::SerializerType,
    transport::transport::{
        Transport,
        TransportData,
    },
};

const MAGIC: u8 = 0x7f;
const HEADER_LENGTH: usize = 4;

/// Exponent of the largest message length we accept, announced as `2^(9 + exponent)`.
pub const DEFAULT_MAX_LENGTH_EXPONENT: u8 = 0x0f;

/// Largest length the 24-bit frame header can carry.
const MAX_FRAME_LENGTH: usize = (1 << 24) - 1;

fn max_length_for_exponent(exponent: u8) -> usize {
    (1 << (9 + exponent as usize)).min(MAX_FRAME_LENGTH)
}

/// A RawSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSocketFrame {
    Message(Bytes),
    Ping(Bytes),
    Pong(Bytes),
}

impl RawSocketFrame {
    fn frame_type(&self) -> u8 {
        match self {
            Self::Message(_) => 0,
            Self::Ping(_) => 1,
            Self::Pong(_) => 2,
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            Self::Message(payload) | Self::Ping(payload) | Self::Pong(payload) => payload,
        }
    }
}

/// Codec for RawSocket frames: a type byte, a 24-bit big-endian length and the payload.
#[derive(Debug)]
pub struct RawSocketCodec {
    max_receive_length: usize,
    max_send_length: usize,
}

impl RawSocketCodec {
    pub fn new(max_receive_length: usize, max_send_length: usize) -> Self {
        Self {
            max_receive_length: max_receive_length.min(MAX_FRAME_LENGTH),
            max_send_length: max_send_length.min(MAX_FRAME_LENGTH),
        }
    }
}

impl Decoder for RawSocketCodec {
    type Item = RawSocketFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let frame_type = src[0] & 0x07;
        if src[0] & 0xf8 != 0 {
            return Err(Error::msg("raw socket frame uses reserved bits"));
        }
        let length = u32::from_be_bytes([0, src[1], src[2], src[3]]) as usize;
        if length > self.max_receive_length {
            return Err(Error::msg(format!(
                "raw socket frame of {length} bytes exceeds limit of {}",
                self.max_receive_length
            )));
        }
        if src.len() < HEADER_LENGTH + length {
            src.reserve(HEADER_LENGTH + length - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LENGTH);
        let payload = src.split_to(length).freeze();
        match frame_type {
            0 => Ok(Some(RawSocketFrame::Message(payload))),
            1 => Ok(Some(RawSocketFrame::Ping(payload))),
            2 => Ok(Some(RawSocketFrame::Pong(payload))),
            _ => Err(Error::msg(format!(
                "invalid raw socket frame type: {frame_type}"
            ))),
        }
    }
}

impl Encoder<RawSocketFrame> for RawSocketCodec {
    type Error = Error;

    fn encode(&mut self, item: RawSocketFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload();
        if payload.len() > self.max_send_length {
            return Err(TransportError::Send(format!(
                "message of {} bytes exceeds router limit of {}",
                payload.len(),
                self.max_send_length
            ))
            .into());
        }
        let length = (payload.len() as u32).to_be_bytes();
        dst.reserve(HEADER_LENGTH + payload.len());
        dst.put_u8(item.frame_type());
        dst.put_slice(&length[1..]);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Performs the client side of the RawSocket handshake.
///
/// Returns the maximum message length the router accepts.
pub async fn raw_socket_handshake(
    stream: &mut TcpStream,
    serializer_type: SerializerType,
    max_length_exponent: u8,
) -> Result<usize> {
    let request = [
        MAGIC,
        (max_length_exponent << 4) | serializer_type.raw_socket_id(),
        0,
        0,
    ];
    stream.write_all(&request).await?;
    let mut response = [0u8; 4];
    stream.read_exact(&mut response).await?;
    parse_handshake_response(response, serializer_type)
}

fn parse_handshake_response(response: [u8; 4], serializer_type: SerializerType) -> Result<usize> {
    if response[0] != MAGIC {
        return Err(TransportError::RawSocketHandshake(format!(
            "router is not a raw socket endpoint (first byte {:#04x})",
            response[0]
        ))
        .into());
    }
    let serializer = response[1] & 0x0f;
    let upper = response[1] >> 4;
    if serializer == 0 {
        let reason = match upper {
            1 => "serializer unsupported",
            2 => "maximum message length unacceptable",
            3 => "use of reserved bits",
            4 => "maximum connection count reached",
            _ => "unknown error",
        };
        return Err(TransportError::RawSocketHandshake(reason.to_owned()).into());
    }
    if serializer != serializer_type.raw_socket_id() {
        return Err(TransportError::SerializerNegotiation(format!(
            "router answered with serializer {serializer}"
        ))
        .into());
    }
    Ok(max_length_for_exponent(upper))
}

/// A transport implemented for a TCP stream using WAMP RawSocket framing.
#[derive(Debug)]
pub struct RawSocketTransport {
    stream: Framed<TcpStream, RawSocketCodec>,
}

impl RawSocketTransport {
    /// Wraps a stream that has completed the handshake.
    pub fn new(stream: TcpStream, max_receive_length: usize, max_send_length: usize) -> Self {
        Self {
            stream: Framed::new(
                stream,
                RawSocketCodec::new(max_receive_length, max_send_length),
            ),
        }
    }

    /// Connects the handshake and the framing together.
    pub async fn handshake(
        mut stream: TcpStream,
        serializer_type: SerializerType,
        max_length_exponent: u8,
    ) -> Result<Self> {
        let max_send_length =
            raw_socket_handshake(&mut stream, serializer_type, max_length_exponent).await?;
        Ok(Self::new(
            stream,
            max_length_for_exponent(max_length_exponent),
            max_send_length,
        ))
    }
}

impl Transport for RawSocketTransport {}

impl Stream for RawSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            return match futures_util::ready!(self.stream.poll_next_unpin(cx)) {
                Some(Ok(RawSocketFrame::Message(data))) => {
                    task::Poll::Ready(Some(Ok(TransportData::Message(data.to_vec()))))
                }
                Some(Ok(RawSocketFrame::Ping(data))) => {
                    task::Poll::Ready(Some(Ok(TransportData::Ping(data.to_vec()))))
                }
                Some(Ok(RawSocketFrame::Pong(_))) => continue,
                Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
                None => task::Poll::Ready(None),
            };
        }
    }
}

impl Sink<TransportData> for RawSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_ready_unpin(cx)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: TransportData,
    ) -> std::result::Result<(), Self::Error> {
        let frame = match item {
            TransportData::Message(data) => RawSocketFrame::Message(data.into()),
            TransportData::Ping(data) => RawSocketFrame::Ping(data.into()),
            TransportData::Pong(data) => RawSocketFrame::Pong(data.into()),
        };
        self.stream.start_send_unpin(frame)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.stream.poll_close_unpin(cx)
    }
}
