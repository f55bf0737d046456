use std::{
    fmt::Display,
    time::Duration,
};

use thiserror::Error;

use crate::{
    core::{
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    session::SessionState,
};

/// An error concerning the lifecycle of a session, as opposed to the outcome of a single request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// The router rejected the join, or the handshake did not complete in time.
    #[error("handshake failed ({reason}): {message}")]
    Handshake { reason: String, message: String },
    /// No response arrived within the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The connection dropped while the operation was outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// The operation is not valid in the current session state.
    #[error("operation not allowed in state {0}")]
    InvalidState(SessionState),
    /// An inbound frame could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// The session was closed; a new session must be created.
    #[error("session closed")]
    SessionClosed,
}

/// An application-level error returned by the router for a request, most notably for calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub error: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub message: Option<String>,
}

impl CallError {
    /// Creates a new call error with no payload.
    pub fn new(error: Uri) -> Self {
        Self {
            error,
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
            message: None,
        }
    }

    /// Creates a call error from the fields of an ERROR message.
    ///
    /// The human-readable message comes from the `message` detail, or the first string argument.
    pub fn from_error_message(
        error: Uri,
        details: &Dictionary,
        arguments: List,
        arguments_keyword: Dictionary,
    ) -> Self {
        let message = details
            .get("message")
            .and_then(|message| message.string())
            .or_else(|| arguments.first().and_then(Value::string))
            .map(|message| message.to_owned());
        Self {
            error,
            arguments,
            arguments_keyword,
            message,
        }
    }

    /// Attaches a human-readable message.
    pub fn with_message<S>(mut self, message: S) -> Self
    where
        S: Into<String>,
    {
        self.message = Some(message.into());
        self
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for CallError {}

/// An interaction error, clearly defined by WAMP and reserved for errors that peers must be able
/// to parse easily.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The procedure failed for a reason other than a [`CallError`].
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchRegistration => "no_such_registration",
            Self::RuntimeError(_) => "runtime_error",
        }
    }

    /// URI for the error.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.error.{}", self.uri_component()))
    }
}

/// An error at the byte-level transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The endpoint URL scheme has no transport.
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
    /// The router did not agree on a serializer.
    #[error("no supported serializer negotiated: {0}")]
    SerializerNegotiation(String),
    /// The RawSocket handshake failed.
    #[error("raw socket handshake failed: {0}")]
    RawSocketHandshake(String),
    /// A frame could not be written.
    #[error("failed to send message: {0}")]
    Send(String),
}

/// Converts a handler failure into a [`CallError`] that can be sent back to the router.
///
/// A [`CallError`] is kept as is, and anything else becomes `wamp.error.runtime_error`.
pub fn call_error_for(error: &anyhow::Error) -> CallError {
    match error.downcast_ref::<CallError>() {
        Some(call_error) => call_error.clone(),
        None => match error.downcast_ref::<InteractionError>() {
            Some(interaction_error) => {
                CallError::new(interaction_error.uri()).with_message(interaction_error.to_string())
            }
            None => CallError::new(InteractionError::RuntimeError(String::new()).uri())
                .with_message(error.to_string()),
        },
    }
}

#[cfg(test)]
mod error_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            CallError,
            InteractionError,
            call_error_for,
        },
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    };

    #[test]
    fn reads_message_from_details_or_arguments() {
        let uri = Uri::try_from("com.example.error").unwrap();
        let error = CallError::from_error_message(
            uri.clone(),
            &Dictionary::from_iter([("message".to_owned(), Value::from("from details"))]),
            Vec::from_iter([Value::from("from arguments")]),
            Dictionary::default(),
        );
        assert_eq!(error.message.as_deref(), Some("from details"));
        assert_eq!(error.to_string(), "com.example.error: from details");

        let error = CallError::from_error_message(
            uri.clone(),
            &Dictionary::default(),
            Vec::from_iter([Value::from("from arguments")]),
            Dictionary::default(),
        );
        assert_eq!(error.message.as_deref(), Some("from arguments"));

        let error =
            CallError::from_error_message(uri, &Dictionary::default(), Vec::new(), Dictionary::default());
        assert_eq!(error.to_string(), "com.example.error");
    }

    #[test]
    fn keeps_call_errors_for_handler_failures() {
        let error = CallError::new(Uri::try_from("com.example.bad_input").unwrap());
        assert_eq!(call_error_for(&Error::new(error.clone())), error);
    }

    #[test]
    fn converts_other_handler_failures_to_runtime_errors() {
        let error = call_error_for(&Error::msg("kaboom"));
        assert_eq!(error.error.as_ref(), "wamp.error.runtime_error");
        assert_eq!(error.message.as_deref(), Some("kaboom"));

        let error = call_error_for(&Error::new(InteractionError::NoSuchRegistration));
        assert_eq!(error.error.as_ref(), "wamp.error.no_such_registration");
    }
}
