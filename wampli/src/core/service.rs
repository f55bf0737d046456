use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    error,
    info,
    trace,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::SessionError,
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::{
        common::abort_for_protocol_violation,
        message::Message,
    },
};

/// What the service should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Continue,
    /// Write out any queued messages, then close the connection.
    Close,
}

/// Receives every message read off the connection, on the single reader task.
pub trait MessageHandler: Send + Sync {
    /// Handles one inbound message.
    ///
    /// An error is treated as a protocol violation: the service sends ABORT and stops.
    fn handle_message(&self, message: Message) -> Result<MessageOutcome>;

    /// Called exactly once, after the connection is gone for any reason.
    fn connection_lost(&self);
}

/// A handle to an asynchronously-running [`Service`].
#[derive(Debug)]
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    message_tx: UnboundedSender<Message>,
}

impl ServiceHandle {
    /// Joins the task running the service.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the service.
    ///
    /// Messages queued before cancellation are still written out.
    pub fn cancel(&self) {
        // The service may already be gone, in which case there is nothing to cancel.
        self.cancel_tx.send(()).ok();
    }

    /// The message transmission channel.
    pub fn message_tx(&self) -> UnboundedSender<Message> {
        self.message_tx.clone()
    }
}

/// The core asynchronous service that sends and receives WAMP messages over a connection.
///
/// Received messages are passed to a [`MessageHandler`] in the order they arrive. Pings are
/// answered here and never reach the handler.
pub struct Service {
    name: String,
    stream: Box<dyn MessageStream>,
    handler: Arc<dyn MessageHandler>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,
    outbound_tx: UnboundedSender<Message>,
    outbound_rx: UnboundedReceiver<Message>,
}

impl Service {
    /// Creates a new service over the given stream.
    pub fn new(
        name: String,
        stream: Box<dyn MessageStream>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = unbounded_channel();
        Self {
            name,
            stream,
            handler,
            cancel_tx,
            cancel_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// The message transmission channel, available before the service starts.
    pub fn message_tx(&self) -> UnboundedSender<Message> {
        self.outbound_tx.clone()
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions with the service should
    /// be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let message_tx = self.outbound_tx.clone();
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            message_tx,
        }
    }

    async fn run(mut self) {
        match self.service_loop().await {
            Ok(()) => info!("Service {} finished", self.name),
            Err(err) => error!("Service {} failed: {err:#}", self.name),
        }
        // The stream may already be closed.
        self.stream.close().await.ok();
        self.handler.connection_lost();
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        trace!("Sending {} message on {}: {message:?}", message.message_name(), self.name);
        self.stream.send(StreamMessage::Message(message)).await
    }

    async fn flush(&mut self) -> Result<()> {
        while let Ok(message) = self.outbound_rx.try_recv() {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            self.stream.send(StreamMessage::Pong(data)).await?;
                        }
                        Some(Ok(StreamMessage::Pong(_))) => {}
                        Some(Ok(StreamMessage::Message(message))) => {
                            trace!("Received {} message on {}: {message:?}", message.message_name(), self.name);
                            match self.handler.handle_message(message) {
                                Ok(MessageOutcome::Continue) => {}
                                Ok(MessageOutcome::Close) => {
                                    self.flush().await?;
                                    return Ok(());
                                }
                                Err(err) => {
                                    self.send(abort_for_protocol_violation(err.to_string())).await.ok();
                                    return Err(err);
                                }
                            }
                        }
                        Some(Err(err)) => {
                            // Only a frame we could read but not understand gets an ABORT. Any
                            // other failure means the connection itself is unusable.
                            if let Some(SessionError::Decode(reason)) = err.downcast_ref::<SessionError>() {
                                self.send(abort_for_protocol_violation(reason.clone())).await.ok();
                            }
                            return Err(err);
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                message = self.outbound_rx.recv() => {
                    match message {
                        Some(message) => self.send(message).await?,
                        None => return Ok(()),
                    }
                }
                _ = self.cancel_rx.recv() => {
                    self.flush().await?;
                    return Ok(());
                }
            }
        }
    }
}
