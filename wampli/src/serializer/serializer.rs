use std::fmt::{
    Debug,
    Display,
};

use anyhow::{
    Context,
    Result,
};

use crate::{
    core::uri::Uri,
    message::message::Message,
};

/// The type of serializer to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializerType {
    /// Serializes messages to and from JavaScript Object Notation.
    Json,
    /// Serializes messages to and from the MessagePack format.
    MessagePack,
}

impl SerializerType {
    /// The protocol URI used during WebSocket sub-protocol negotiation.
    pub fn uri(&self) -> Uri {
        match self {
            Self::Json => Uri::from_known("wamp.2.json"),
            Self::MessagePack => Uri::from_known("wamp.2.msgpack"),
        }
    }

    /// The serializer identifier used in the RawSocket handshake.
    pub fn raw_socket_id(&self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MessagePack => 2,
        }
    }

    /// Looks up a serializer by its RawSocket handshake identifier.
    pub fn from_raw_socket_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Json),
            2 => Some(Self::MessagePack),
            _ => None,
        }
    }

    /// Whether messages are sent as binary rather than text.
    pub fn is_binary(&self) -> bool {
        *self == Self::MessagePack
    }
}

impl Display for SerializerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::MessagePack => f.write_str("msgpack"),
        }
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "wamp.2.json" | "json" => Ok(Self::Json),
            "wamp.2.msgpack" | "msgpack" => Ok(Self::MessagePack),
            _ => Err(Self::Error::msg(format!("unsupported serializer: {value}"))),
        }
    }
}

/// A serializer, which serializes and deserializes WAMP messages to a well-known format that can be
/// passed over wire.
///
/// Does not implement message batching.
pub trait Serializer: Send + Sync + Debug {
    /// Serializes the given message to bytes.
    fn serialize(&self, value: &Message) -> Result<Vec<u8>>;

    /// Deserializes bytes to a message.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

/// A serializer implemented for JavaScript Object Notation.
#[derive(Debug, Default)]
pub struct JsonSerializer {}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("failed to encode message as JSON")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes).context("failed to decode JSON message")
    }
}

/// A serializer implemented for MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackSerializer {}

impl Serializer for MessagePackSerializer {
    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).context("failed to encode message as MessagePack")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        rmp_serde::from_slice(bytes).context("failed to decode MessagePack message")
    }
}

/// Creates a new [`Serializer`] for the given type.
pub fn new_serializer(serializer_type: SerializerType) -> Box<dyn Serializer> {
    match serializer_type {
        SerializerType::Json => Box::new(JsonSerializer::default()),
        SerializerType::MessagePack => Box::new(MessagePackSerializer::default()),
    }
}

#[cfg(test)]
mod serializer_test {
    use crate::{
        core::{
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::message::{
            CallMessage,
            Message,
            ResultMessage,
        },
        serializer::serializer::{
            SerializerType,
            new_serializer,
        },
    };

    fn call_message() -> Message {
        Message::Call(CallMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::default(),
            procedure: Uri::try_from("com.example.add").unwrap(),
            arguments: List::from_iter([Value::Integer(2), Value::Integer(3)]),
            arguments_keyword: Dictionary::default(),
        })
    }

    #[test]
    fn parses_serializer_names() {
        assert_matches::assert_matches!(SerializerType::try_from("json"), Ok(SerializerType::Json));
        assert_matches::assert_matches!(
            SerializerType::try_from("wamp.2.msgpack"),
            Ok(SerializerType::MessagePack)
        );
        assert_matches::assert_matches!(SerializerType::try_from("cbor"), Err(_));
    }

    #[test]
    fn maps_raw_socket_ids() {
        for serializer_type in [SerializerType::Json, SerializerType::MessagePack] {
            assert_eq!(
                SerializerType::from_raw_socket_id(serializer_type.raw_socket_id()),
                Some(serializer_type)
            );
        }
        assert_eq!(SerializerType::from_raw_socket_id(0), None);
    }

    #[test]
    fn json_serializes_to_text() {
        let serializer = new_serializer(SerializerType::Json);
        let bytes = serializer.serialize(&call_message()).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[48,1,{},"com.example.add",[2,3]]"#
        );
    }

    #[test]
    fn message_pack_reads_back_what_it_writes() {
        let serializer = new_serializer(SerializerType::MessagePack);
        let bytes = serializer.serialize(&call_message()).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), call_message());
    }

    #[test]
    fn round_trips_integers_outside_signed_range() {
        let text = "[50,1,{},[18446744073709551615,-1]]";
        let serializer = new_serializer(SerializerType::Json);
        let message = serializer.deserialize(text.as_bytes()).unwrap();
        assert_matches::assert_matches!(&message, Message::Result(ResultMessage { yield_arguments, .. }) => {
            pretty_assertions::assert_eq!(
                yield_arguments,
                &List::from_iter([Value::UnsignedInteger(u64::MAX), Value::Integer(-1)])
            );
        });
        assert_eq!(
            String::from_utf8(serializer.serialize(&message).unwrap()).unwrap(),
            text
        );

        let serializer = new_serializer(SerializerType::MessagePack);
        let bytes = serializer.serialize(&message).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn fails_malformed_input() {
        assert_matches::assert_matches!(new_serializer(SerializerType::Json).deserialize(b"[48,"), Err(_));
        assert_matches::assert_matches!(
            new_serializer(SerializerType::MessagePack).deserialize(&[0xc1]),
            Err(_)
        );
    }
}
