use crate::{
    core::{
        close::CloseReason,
        error::{
            CallError,
            InteractionError,
        },
        id::Id,
        types::{
            Dictionary,
            Value,
        },
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

/// ABORT for a protocol violation, which ends the session immediately.
pub fn abort_for_protocol_violation<S>(message: S) -> Message
where
    S: Into<String>,
{
    let error = InteractionError::ProtocolViolation(message.into());
    Message::Abort(AbortMessage {
        details: Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))]),
        reason: error.uri(),
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// ERROR in response to an INVOCATION.
pub fn error_for_invocation(request: Id, error: CallError) -> Message {
    let mut details = Dictionary::default();
    if let Some(message) = error.message {
        details.insert("message".to_owned(), Value::String(message));
    }
    Message::Error(ErrorMessage {
        request_type: 68,
        request,
        details,
        error: error.error,
        arguments: error.arguments,
        arguments_keyword: error.arguments_keyword,
    })
}

#[cfg(test)]
mod common_test {
    use crate::{
        core::{
            error::CallError,
            id::Id,
            uri::Uri,
        },
        message::{
            common::{
                abort_for_protocol_violation,
                error_for_invocation,
                goodbye_and_out,
            },
            message::Message,
        },
    };

    #[test]
    fn builds_protocol_violation_abort() {
        assert_matches::assert_matches!(abort_for_protocol_violation("bad message"), Message::Abort(message) => {
            assert_eq!(message.reason.as_ref(), "wamp.error.protocol_violation");
        });
    }

    #[test]
    fn builds_goodbye_and_out() {
        assert_eq!(
            serde_json::to_string(&goodbye_and_out()).unwrap(),
            r#"[6,{},"wamp.close.goodbye_and_out"]"#
        );
    }

    #[test]
    fn builds_invocation_error() {
        let error = CallError::new(Uri::try_from("com.example.failed").unwrap());
        let message = error_for_invocation(Id::try_from(12).unwrap(), error);
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"[8,68,12,{},"com.example.failed",[]]"#
        );
    }
}
