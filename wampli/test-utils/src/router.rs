use std::{
    pin::Pin,
    task,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};
use wampli::{
    core::{
        id::Id,
        stream::{
            MessageStream,
            TransportMessageStream,
        },
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    },
    message::{
        common::goodbye_and_out,
        message::{
            AbortMessage,
            CallMessage,
            GoodbyeMessage,
            HelloMessage,
            Message,
            ResultMessage,
            WelcomeMessage,
        },
    },
    serializer::serializer::{
        Serializer,
        SerializerType,
        new_serializer,
    },
    session::{
        Session,
        SessionConfig,
    },
    transport::transport::{
        Transport,
        TransportData,
    },
};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Transport`] backed by in-memory channels.
#[derive(Debug)]
struct ChannelTransport {
    data_tx: Option<UnboundedSender<TransportData>>,
    data_rx: UnboundedReceiver<TransportData>,
}

impl Transport for ChannelTransport {}

impl Stream for ChannelTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.data_rx.poll_recv(cx).map(|data| data.map(Ok))
    }
}

impl Sink<TransportData> for ChannelTransport {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        match &self.data_tx {
            Some(data_tx) => data_tx
                .send(item)
                .map_err(|_| Error::msg("router is gone")),
            None => Err(Error::msg("transport is closed")),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.data_tx = None;
        self.data_rx.close();
        task::Poll::Ready(Ok(()))
    }
}

/// A scripted router on the other end of an in-memory connection.
///
/// Messages go through a real serializer, so tests can also send frames that do not decode.
pub struct TestRouter {
    data_tx: UnboundedSender<TransportData>,
    data_rx: UnboundedReceiver<TransportData>,
    serializer: Box<dyn Serializer>,
}

impl TestRouter {
    /// Creates a router and the message stream a session should connect over.
    pub fn new() -> (Self, Box<dyn MessageStream>) {
        let (router_tx, session_rx) = unbounded_channel();
        let (session_tx, router_rx) = unbounded_channel();
        let transport = ChannelTransport {
            data_tx: Some(session_tx),
            data_rx: session_rx,
        };
        let stream = TransportMessageStream::new(
            Box::new(transport),
            new_serializer(SerializerType::Json),
        );
        (
            Self {
                data_tx: router_tx,
                data_rx: router_rx,
                serializer: new_serializer(SerializerType::Json),
            },
            Box::new(stream),
        )
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.send_raw(self.serializer.serialize(&message)?)
    }

    /// Sends bytes as a single message frame, whether or not they decode.
    pub fn send_raw(&self, data: Vec<u8>) -> Result<()> {
        self.data_tx
            .send(TransportData::Message(data))
            .map_err(|_| Error::msg("session is gone"))
    }

    pub fn ping(&self, data: Vec<u8>) -> Result<()> {
        self.data_tx
            .send(TransportData::Ping(data))
            .map_err(|_| Error::msg("session is gone"))
    }

    async fn next_data(&mut self) -> Result<Option<TransportData>> {
        tokio::time::timeout(RECEIVE_TIMEOUT, self.data_rx.recv())
            .await
            .map_err(|_| Error::msg("timed out waiting for the session"))
    }

    /// Receives the next pong from the session.
    pub async fn pong(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.next_data().await? {
                Some(TransportData::Pong(data)) => return Ok(data),
                Some(_) => continue,
                None => return Err(Error::msg("connection closed")),
            }
        }
    }

    /// Receives the next message from the session.
    pub async fn receive(&mut self) -> Result<Message> {
        loop {
            match self.next_data().await? {
                Some(TransportData::Message(data)) => return self.serializer.deserialize(&data),
                Some(_) => continue,
                None => return Err(Error::msg("connection closed")),
            }
        }
    }

    /// Waits for the session to close the connection, returning any messages sent before that.
    pub async fn closed(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        loop {
            match self.next_data().await? {
                Some(TransportData::Message(data)) => {
                    messages.push(self.serializer.deserialize(&data)?)
                }
                Some(_) => continue,
                None => return Ok(messages),
            }
        }
    }

    /// Expects HELLO and answers with WELCOME.
    pub async fn accept_join(&mut self, session: u64) -> Result<HelloMessage> {
        let hello = match self.receive().await? {
            Message::Hello(hello) => hello,
            message => {
                return Err(Error::msg(format!(
                    "expected HELLO, got {}",
                    message.message_name()
                )));
            }
        };
        self.send(Message::Welcome(WelcomeMessage {
            session: Id::try_from(session)?,
            details: Dictionary::default(),
        }))?;
        Ok(hello)
    }

    /// Expects HELLO and answers with ABORT.
    pub async fn reject_join(&mut self, reason: &str) -> Result<()> {
        match self.receive().await? {
            Message::Hello(_) => (),
            message => {
                return Err(Error::msg(format!(
                    "expected HELLO, got {}",
                    message.message_name()
                )));
            }
        }
        self.send(Message::Abort(AbortMessage {
            details: Dictionary::default(),
            reason: Uri::try_from(reason)?,
        }))
    }

    /// Expects GOODBYE and answers with GOODBYE.
    pub async fn accept_leave(&mut self) -> Result<GoodbyeMessage> {
        let goodbye = match self.receive().await? {
            Message::Goodbye(goodbye) => goodbye,
            message => {
                return Err(Error::msg(format!(
                    "expected GOODBYE, got {}",
                    message.message_name()
                )));
            }
        };
        self.send(goodbye_and_out())?;
        Ok(goodbye)
    }

    /// Expects CALL.
    pub async fn receive_call(&mut self) -> Result<CallMessage> {
        match self.receive().await? {
            Message::Call(call) => Ok(call),
            message => Err(Error::msg(format!(
                "expected CALL, got {}",
                message.message_name()
            ))),
        }
    }

    /// Answers a call with RESULT.
    pub fn result(&self, call_request: Id, arguments: List) -> Result<()> {
        self.send(Message::Result(ResultMessage {
            call_request,
            details: Dictionary::default(),
            yield_arguments: arguments,
            yield_arguments_keyword: Dictionary::default(),
        }))
    }
}

/// Creates a session connected to a [`TestRouter`] and joined to `com.example.realm`.
pub async fn joined_session(config: SessionConfig) -> Result<(Session, TestRouter)> {
    let (mut router, stream) = TestRouter::new();
    let session = Session::new(config)?;
    session.direct_connect(stream)?;
    let realm = Uri::try_from("com.example.realm")?;
    let (joined, accepted) = tokio::join!(session.join(realm), router.accept_join(1));
    joined?;
    accepted?;
    Ok((session, router))
}
