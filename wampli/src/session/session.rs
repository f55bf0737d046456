use std::{
    fmt::{
        Debug,
        Display,
    },
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Context,
    Result,
};
use log::{
    debug,
    info,
    warn,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::unbounded_channel,
    oneshot,
};
use url::Url;

use crate::{
    core::{
        close::CloseReason,
        error::SessionError,
        id::Id,
        service::{
            MessageHandler,
            Service,
            ServiceHandle,
        },
        stream::MessageStream,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            MatchStyle,
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::goodbye_with_close_reason,
        message::{
            CallMessage,
            HelloMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
        },
    },
    session::{
        config::SessionConfig,
        connector::connector_for_url,
        dispatcher::Dispatcher,
        handler::{
            EventHandler,
            InvocationHandler,
        },
        requests::PendingRequest,
    },
};

/// The lifecycle state of a [`Session`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Joining,
    Established,
    Closing,
}

impl SessionState {
    pub(crate) fn allowed_state_transition(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Disconnected, Self::Connecting) => true,
            (Self::Connecting, Self::Joining) => true,
            (Self::Connecting, Self::Disconnected) => true,
            (Self::Joining, Self::Established) => true,
            (Self::Joining, Self::Disconnected) => true,
            (Self::Established, Self::Closing) => true,
            (Self::Established, Self::Disconnected) => true,
            (Self::Closing, Self::Disconnected) => true,
            _ => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Joining => "joining",
            Self::Established => "established",
            Self::Closing => "closing",
        })
    }
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// Overrides [`SessionConfig::request_timeout`] for this call.
    pub timeout: Option<Duration>,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// The value returned by an [`InvocationHandler`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishOptions {
    /// Wait for the router to acknowledge the publication.
    pub acknowledge: bool,
    /// Whether the publisher should receive the event too, if it is subscribed.
    pub exclude_me: Option<bool>,
}

/// An event to publish to a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    /// How the subscription should be matched for published events.
    pub match_style: Option<MatchStyle>,
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct ProcedureOptions {
    /// How the procedure should be matched for procedure calls.
    pub match_style: Option<MatchStyle>,
}

/// An event received for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subscription: Id,
    pub publication: Id,
    /// The concrete topic. Only known for pattern subscriptions if the router discloses it.
    pub topic: Option<Uri>,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// An invocation of a registered procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub registration: Id,
    /// The concrete procedure. Only known for pattern registrations if the router discloses it.
    pub procedure: Option<Uri>,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// A subscription to a topic, returned by [`Session::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    subscription: Id,
    key: u64,
    topic: WildcardUri,
}

impl SubscriptionHandle {
    /// The router-assigned subscription ID.
    ///
    /// Subscribing to the same topic twice may produce the same ID for two handles.
    pub fn id(&self) -> Id {
        self.subscription
    }

    pub fn topic(&self) -> &WildcardUri {
        &self.topic
    }
}

/// A registered procedure, returned by [`Session::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    registration: Id,
    procedure: WildcardUri,
}

impl RegistrationHandle {
    pub fn id(&self) -> Id {
        self.registration
    }

    pub fn procedure(&self) -> &WildcardUri {
        &self.procedure
    }
}

/// A WAMP client session.
///
/// A session goes through its lifecycle exactly once: [`Self::connect`], [`Self::join`], any
/// number of operations, then [`Self::leave`] or [`Self::close`]. Once the connection is gone,
/// every operation fails with [`SessionError::SessionClosed`] and a new session must be created.
pub struct Session {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    service: Mutex<Option<ServiceHandle>>,
}

impl Session {
    /// Creates a new session.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(config.name.clone()));
        Ok(Self {
            config,
            dispatcher,
            service: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state()
    }

    /// The router-assigned session ID, once joined.
    pub fn session_id(&self) -> Option<Id> {
        self.dispatcher.session_id()
    }

    /// The realm the session joined, or is joining.
    pub fn realm(&self) -> Option<Uri> {
        self.dispatcher.realm()
    }

    /// Checks if the session is permanently closed.
    pub fn closed(&self) -> bool {
        self.dispatcher.closed()
    }

    /// Waits until the session is permanently closed, for any reason.
    pub async fn wait_until_closed(&self) {
        let mut closed_rx = self.dispatcher.closed_rx();
        // The sender lives in the dispatcher, which outlives this borrow.
        closed_rx.wait_for(|closed| *closed).await.ok();
    }

    /// The number of requests waiting on the router.
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.requests().len()
    }

    /// Connects to a router.
    ///
    /// The transport is chosen by the URL scheme. A failed connection attempt can be retried.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("invalid router URL {url}"))?;
        let connector = connector_for_url(&url)?;
        self.dispatcher.begin_connect()?;
        info!("Session {} connecting to {url}", self.config.name);
        let connection =
            match tokio::time::timeout(self.config.connect_timeout, connector.connect(&self.config, &url))
                .await
            {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    self.dispatcher.abandon_connect();
                    return Err(err);
                }
                Err(_) => {
                    self.dispatcher.abandon_connect();
                    return Err(SessionError::Timeout(self.config.connect_timeout).into());
                }
            };
        info!(
            "Session {} connected to {url} using {}",
            self.config.name, connection.serializer
        );
        self.start_service(connection.stream);
        Ok(())
    }

    /// Connects to a router over an existing message stream.
    ///
    /// Useful for connecting to a router running in the same process.
    pub fn direct_connect(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        self.dispatcher.begin_connect()?;
        self.start_service(stream);
        Ok(())
    }

    fn start_service(&self, stream: Box<dyn MessageStream>) {
        let service = Service::new(self.config.name.clone(), stream, self.dispatcher.clone());
        self.dispatcher.attach(service.message_tx());
        *self.service.lock() = Some(service.start());
    }

    fn hello_details(&self) -> Dictionary {
        let roles = Dictionary::from_iter(self.config.roles.iter().map(|role| {
            (
                role.as_str().to_owned(),
                Value::Dictionary(Dictionary::default()),
            )
        }));
        Dictionary::from_iter([
            ("agent".to_owned(), Value::String(self.config.agent.clone())),
            ("roles".to_owned(), Value::Dictionary(roles)),
        ])
    }

    /// Joins a realm, returning the router-assigned session ID.
    ///
    /// A rejected or timed out join closes the session.
    pub async fn join(&self, realm: Uri) -> Result<Id> {
        let (join_tx, join_rx) = oneshot::channel();
        self.dispatcher.begin_join(realm.clone(), join_tx)?;
        self.dispatcher.send(Message::Hello(HelloMessage {
            realm,
            details: self.hello_details(),
            ..Default::default()
        }))?;
        match tokio::time::timeout(self.config.handshake_timeout, join_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ConnectionLost.into()),
            Err(_) => {
                self.close().await?;
                Err(SessionError::Handshake {
                    reason: "timeout".to_owned(),
                    message: format!(
                        "router did not answer HELLO within {:?}",
                        self.config.handshake_timeout
                    ),
                }
                .into())
            }
        }
    }

    /// Calls a procedure and waits for its result.
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        self.dispatcher.ensure_established()?;
        let (result_tx, result_rx) = oneshot::channel();
        let request = self
            .dispatcher
            .requests()
            .insert(PendingRequest::Call(result_tx))?;
        self.dispatcher.send(Message::Call(CallMessage {
            request: request.id(),
            options: Dictionary::default(),
            procedure,
            arguments: rpc_call.arguments,
            arguments_keyword: rpc_call.arguments_keyword,
        }))?;
        request
            .wait(result_rx, rpc_call.timeout.or(self.config.request_timeout))
            .await
    }

    /// Publishes an event to a topic.
    ///
    /// Returns the publication ID if the publication was acknowledged. Unacknowledged events are
    /// handed to the connection with no guarantee of delivery.
    pub async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<Option<Id>> {
        self.dispatcher.ensure_established()?;
        let mut options = Dictionary::default();
        if let Some(exclude_me) = event.options.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(exclude_me));
        }

        if !event.options.acknowledge {
            let request = self.dispatcher.requests().allocate_id()?;
            self.dispatcher.send(Message::Publish(PublishMessage {
                request,
                options,
                topic,
                arguments: event.arguments,
                arguments_keyword: event.arguments_keyword,
            }))?;
            return Ok(None);
        }

        options.insert("acknowledge".to_owned(), Value::Bool(true));
        let (published_tx, published_rx) = oneshot::channel();
        let request = self
            .dispatcher
            .requests()
            .insert(PendingRequest::Publish(published_tx))?;
        self.dispatcher.send(Message::Publish(PublishMessage {
            request: request.id(),
            options,
            topic,
            arguments: event.arguments,
            arguments_keyword: event.arguments_keyword,
        }))?;
        let publication = request
            .wait(published_rx, self.config.request_timeout)
            .await?;
        Ok(Some(publication))
    }

    /// Subscribes to a topic.
    ///
    /// The handler receives every event for the subscription, one at a time, in the order the
    /// router sent them, until the subscription is removed or the session ends.
    pub async fn subscribe<H>(
        &self,
        topic: WildcardUri,
        options: SubscriptionOptions,
        handler: H,
    ) -> Result<SubscriptionHandle>
    where
        H: EventHandler + 'static,
    {
        self.dispatcher.ensure_established()?;
        let (event_tx, mut event_rx) = unbounded_channel();
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        let key = self.dispatcher.next_subscription_key();
        let request = self.dispatcher.requests().insert(PendingRequest::Subscribe {
            topic: topic.clone(),
            key,
            event_tx,
            response_tx: subscribed_tx,
        })?;
        let mut message_options = Dictionary::default();
        if let Some(match_style) = options.match_style {
            message_options.insert(
                "match".to_owned(),
                Value::String(match_style.as_str().to_owned()),
            );
        }
        self.dispatcher.send(Message::Subscribe(SubscribeMessage {
            request: request.id(),
            options: message_options,
            topic: topic.clone(),
        }))?;
        let subscription = request
            .wait(subscribed_rx, self.config.request_timeout)
            .await?;

        debug!(
            "Session {} subscribed to {topic} as subscription {subscription}",
            self.config.name
        );
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handler.handle_event(event).await;
            }
        });
        Ok(SubscriptionHandle {
            subscription,
            key,
            topic,
        })
    }

    /// Removes a subscription.
    ///
    /// Events for the subscription are dropped from this point on. Removing a subscription that
    /// is already gone is not an error.
    pub async fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<()> {
        if !self
            .dispatcher
            .remove_subscription(subscription.subscription, subscription.key)
        {
            return Ok(());
        }
        if self.dispatcher.state() != SessionState::Established {
            return Ok(());
        }
        let (unsubscribed_tx, unsubscribed_rx) = oneshot::channel();
        let request = self
            .dispatcher
            .requests()
            .insert(PendingRequest::Unsubscribe(unsubscribed_tx))?;
        self.dispatcher.send(Message::Unsubscribe(UnsubscribeMessage {
            request: request.id(),
            subscribed_subscription: subscription.subscription,
        }))?;
        request
            .wait(unsubscribed_rx, self.config.request_timeout)
            .await
    }

    /// Registers a procedure.
    ///
    /// Every invocation runs the handler on its own task.
    pub async fn register<H>(
        &self,
        procedure: WildcardUri,
        options: ProcedureOptions,
        handler: H,
    ) -> Result<RegistrationHandle>
    where
        H: InvocationHandler + 'static,
    {
        self.dispatcher.ensure_established()?;
        let (registered_tx, registered_rx) = oneshot::channel();
        let request = self.dispatcher.requests().insert(PendingRequest::Register {
            procedure: procedure.clone(),
            handler: Arc::new(handler),
            response_tx: registered_tx,
        })?;
        let mut message_options = Dictionary::default();
        if let Some(match_style) = options.match_style {
            message_options.insert(
                "match".to_owned(),
                Value::String(match_style.as_str().to_owned()),
            );
        }
        self.dispatcher.send(Message::Register(RegisterMessage {
            request: request.id(),
            options: message_options,
            procedure: procedure.clone(),
        }))?;
        let registration = request
            .wait(registered_rx, self.config.request_timeout)
            .await?;
        debug!(
            "Session {} registered {procedure} as registration {registration}",
            self.config.name
        );
        Ok(RegistrationHandle {
            registration,
            procedure,
        })
    }

    /// Removes a registration. Removing a registration that is already gone is not an error.
    pub async fn unregister(&self, registration: &RegistrationHandle) -> Result<()> {
        if !self
            .dispatcher
            .remove_registration(registration.registration)
        {
            return Ok(());
        }
        if self.dispatcher.state() != SessionState::Established {
            return Ok(());
        }
        let (unregistered_tx, unregistered_rx) = oneshot::channel();
        let request = self
            .dispatcher
            .requests()
            .insert(PendingRequest::Unregister(unregistered_tx))?;
        self.dispatcher.send(Message::Unregister(UnregisterMessage {
            request: request.id(),
            registered_registration: registration.registration,
        }))?;
        request
            .wait(unregistered_rx, self.config.request_timeout)
            .await
    }

    /// Leaves the realm gracefully, then closes the session.
    ///
    /// Outstanding requests fail with [`SessionError::ConnectionLost`].
    pub async fn leave(&self) -> Result<()> {
        let goodbye_rx = self.dispatcher.begin_leave()?;
        match self
            .dispatcher
            .send(goodbye_with_close_reason(CloseReason::Normal))
        {
            Ok(()) => match tokio::time::timeout(self.config.goodbye_timeout, goodbye_rx).await {
                Ok(_) => debug!("Session {} left its realm", self.config.name),
                Err(_) => warn!(
                    "Session {} did not receive GOODBYE within {:?}",
                    self.config.name, self.config.goodbye_timeout
                ),
            },
            Err(err) => warn!("Session {} failed to send GOODBYE: {err}", self.config.name),
        }
        self.close().await
    }

    /// Closes the session immediately, without saying goodbye to the router.
    ///
    /// Closing a closed session does nothing.
    pub async fn close(&self) -> Result<()> {
        let service = self.service.lock().take();
        match service {
            Some(service) => {
                service.cancel();
                service.join().await?;
            }
            None => self.dispatcher.connection_lost(),
        }
        Ok(())
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(service) = self.service.lock().take() {
            service.cancel();
        }
    }
}
