use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        Ordering,
    },
};

use anyhow::Result;
use log::{
    debug,
    info,
    trace,
    warn,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::UnboundedSender,
    oneshot,
    watch,
};

use crate::{
    core::{
        error::{
            CallError,
            InteractionError,
            SessionError,
            call_error_for,
        },
        id::Id,
        service::{
            MessageHandler,
            MessageOutcome,
        },
        types::{
            Dictionary,
            HashMap,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::{
            error_for_invocation,
            goodbye_and_out,
        },
        message::{
            AbortMessage,
            ErrorMessage,
            EventMessage,
            InvocationMessage,
            Message,
            RegisteredMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnsubscribeMessage,
            YieldMessage,
        },
    },
    session::{
        handler::InvocationHandler,
        requests::{
            PendingRequest,
            RequestTable,
        },
        session::{
            Event,
            Invocation,
            RpcResult,
            SessionState,
        },
    },
};

struct SubscriptionEntry {
    key: u64,
    topic: WildcardUri,
    event_tx: UnboundedSender<Event>,
}

struct Registration {
    procedure: WildcardUri,
    handler: Arc<dyn InvocationHandler>,
}

#[derive(Default)]
struct Lifecycle {
    realm: Option<Uri>,
    session_id: Option<Id>,
    join_tx: Option<oneshot::Sender<Result<Id>>>,
    goodbye_tx: Option<oneshot::Sender<()>>,
    message_tx: Option<UnboundedSender<Message>>,
}

/// Routes inbound messages to the request, subscription or registration they belong to.
///
/// The dispatcher is shared between the session's public operations, which insert state, and the
/// connection's reader task, which resolves it. Locks are held only for map operations, never
/// while a handler runs or a message is written.
pub(crate) struct Dispatcher {
    name: String,
    requests: RequestTable,
    subscriptions: Mutex<HashMap<Id, Vec<SubscriptionEntry>>>,
    registrations: Mutex<HashMap<Id, Registration>>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
    closed_tx: watch::Sender<bool>,
    next_subscription_key: AtomicU64,
}

impl Dispatcher {
    pub fn new(name: String) -> Self {
        Self {
            name,
            requests: RequestTable::default(),
            subscriptions: Mutex::new(HashMap::default()),
            registrations: Mutex::new(HashMap::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            state_tx: watch::Sender::new(SessionState::default()),
            closed_tx: watch::Sender::new(false),
            next_subscription_key: AtomicU64::new(0),
        }
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn session_id(&self) -> Option<Id> {
        self.lifecycle.lock().session_id
    }

    pub fn realm(&self) -> Option<Uri> {
        self.lifecycle.lock().realm.clone()
    }

    pub fn next_subscription_key(&self) -> u64 {
        self.next_subscription_key.fetch_add(1, Ordering::Relaxed)
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut result = Ok(());
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.allowed_state_transition(next) {
                result = Err(SessionError::InvalidState(*state));
                return false;
            }
            trace!("Session {} transitioned from {state} to {next}", self.name);
            *state = next;
            true
        });
        result
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    /// Checks that request-level operations are allowed.
    pub fn ensure_established(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        match self.state() {
            SessionState::Established => Ok(()),
            state => Err(SessionError::InvalidState(state)),
        }
    }

    pub fn begin_connect(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.transition(SessionState::Connecting)
    }

    /// Returns to the disconnected state after a failed connection attempt.
    pub fn abandon_connect(&self) {
        self.transition(SessionState::Disconnected).ok();
    }

    /// Attaches the outbound channel of the connection.
    pub fn attach(&self, message_tx: UnboundedSender<Message>) {
        self.lifecycle.lock().message_tx = Some(message_tx);
    }

    pub fn begin_join(
        &self,
        realm: Uri,
        join_tx: oneshot::Sender<Result<Id>>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.transition(SessionState::Joining)?;
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.realm = Some(realm);
        lifecycle.join_tx = Some(join_tx);
        Ok(())
    }

    pub fn begin_leave(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        self.ensure_established()?;
        let (goodbye_tx, goodbye_rx) = oneshot::channel();
        self.lifecycle.lock().goodbye_tx = Some(goodbye_tx);
        self.transition(SessionState::Closing)?;
        Ok(goodbye_rx)
    }

    /// Queues a message for the connection.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        let message_tx = self.lifecycle.lock().message_tx.clone();
        match message_tx {
            Some(message_tx) => message_tx
                .send(message)
                .map_err(|_| SessionError::ConnectionLost),
            None => Err(SessionError::ConnectionLost),
        }
    }

    /// Removes one local subscription handle.
    ///
    /// Returns true if it was the last handle for the router-side subscription, which should then
    /// be released.
    pub fn remove_subscription(&self, subscription: Id, key: u64) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(entries) = subscriptions.get_mut(&subscription) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        if entries.len() == before {
            return false;
        }
        if entries.is_empty() {
            subscriptions.remove(&subscription);
            return true;
        }
        false
    }

    /// Removes a registration, returning true if it existed.
    pub fn remove_registration(&self, registration: Id) -> bool {
        self.registrations.lock().remove(&registration).is_some()
    }

    /// Releases a router-side subscription nobody is waiting on anymore.
    fn release_subscription(&self, subscription: Id) {
        let (unsubscribed_tx, _) = oneshot::channel();
        let released = self
            .requests
            .insert_detached(PendingRequest::Unsubscribe(unsubscribed_tx))
            .and_then(|request| {
                self.send(Message::Unsubscribe(UnsubscribeMessage {
                    request,
                    subscribed_subscription: subscription,
                }))
            });
        if let Err(err) = released {
            debug!(
                "Session {} could not release subscription {subscription}: {err}",
                self.name
            );
        }
    }

    /// Releases a router-side registration nobody is waiting on anymore.
    fn release_registration(&self, registration: Id) {
        let (unregistered_tx, _) = oneshot::channel();
        let released = self
            .requests
            .insert_detached(PendingRequest::Unregister(unregistered_tx))
            .and_then(|request| {
                self.send(Message::Unregister(UnregisterMessage {
                    request,
                    registered_registration: registration,
                }))
            });
        if let Err(err) = released {
            debug!(
                "Session {} could not release registration {registration}: {err}",
                self.name
            );
        }
    }

    fn protocol_violation(&self, message: &Message) -> anyhow::Error {
        InteractionError::ProtocolViolation(format!(
            "received {} message on a {} session",
            message.message_name(),
            self.state()
        ))
        .into()
    }

    fn discard(&self, message: &Message) {
        debug!(
            "Session {} discarded {} message for unknown request {:?}",
            self.name,
            message.message_name(),
            message.request_id()
        );
    }

    fn handle_joining(&self, message: Message) -> Result<MessageOutcome> {
        match message {
            Message::Welcome(message) => {
                self.requests.open();
                self.transition(SessionState::Established)?;
                let (realm, join_tx) = {
                    let mut lifecycle = self.lifecycle.lock();
                    lifecycle.session_id = Some(message.session);
                    (lifecycle.realm.clone(), lifecycle.join_tx.take())
                };
                info!(
                    "Session {} started session {} on realm {}",
                    self.name,
                    message.session,
                    realm.map(|realm| realm.to_string()).unwrap_or_default()
                );
                if let Some(join_tx) = join_tx {
                    join_tx.send(Ok(message.session)).ok();
                }
                Ok(MessageOutcome::Continue)
            }
            Message::Abort(message) => {
                warn!(
                    "Session {} was rejected by the router: {}",
                    self.name, message.reason
                );
                let join_tx = self.lifecycle.lock().join_tx.take();
                if let Some(join_tx) = join_tx {
                    join_tx.send(Err(handshake_error(&message).into())).ok();
                }
                Ok(MessageOutcome::Close)
            }
            message => Err(self.protocol_violation(&message)),
        }
    }

    fn handle_established(&self, message: Message) -> Result<MessageOutcome> {
        match message {
            Message::Result(message) => {
                match self.requests.take(message.call_request, 48) {
                    Some(PendingRequest::Call(result_tx)) => {
                        // The caller may have stopped waiting in the meantime.
                        result_tx
                            .send(Ok(RpcResult {
                                arguments: message.yield_arguments,
                                arguments_keyword: message.yield_arguments_keyword,
                                details: message.details,
                            }))
                            .ok();
                    }
                    _ => self.discard(&Message::Result(message)),
                }
            }
            Message::Error(message) => self.handle_error(message),
            Message::Published(message) => {
                match self.requests.take(message.publish_request, 16) {
                    Some(PendingRequest::Publish(published_tx)) => {
                        published_tx.send(Ok(message.publication)).ok();
                    }
                    _ => self.discard(&Message::Published(message)),
                }
            }
            Message::Subscribed(message) => self.handle_subscribed(message),
            Message::Unsubscribed(message) => {
                match self.requests.take(message.unsubscribe_request, 34) {
                    Some(PendingRequest::Unsubscribe(unsubscribed_tx)) => {
                        unsubscribed_tx.send(Ok(())).ok();
                    }
                    _ => self.discard(&Message::Unsubscribed(message)),
                }
            }
            Message::Event(message) => self.handle_event(message),
            Message::Registered(message) => self.handle_registered(message),
            Message::Unregistered(message) => {
                match self.requests.take(message.unregister_request, 66) {
                    Some(PendingRequest::Unregister(unregistered_tx)) => {
                        unregistered_tx.send(Ok(())).ok();
                    }
                    _ => self.discard(&Message::Unregistered(message)),
                }
            }
            Message::Invocation(message) => self.handle_invocation(message)?,
            Message::Goodbye(message) => {
                info!(
                    "Session {} was closed by the router: {}",
                    self.name, message.reason
                );
                self.send(goodbye_and_out())?;
                return Ok(MessageOutcome::Close);
            }
            Message::Abort(message) => {
                warn!(
                    "Session {} was aborted by the router: {} {:?}",
                    self.name, message.reason, message.details
                );
                return Ok(MessageOutcome::Close);
            }
            message => return Err(self.protocol_violation(&message)),
        }
        Ok(MessageOutcome::Continue)
    }

    fn handle_closing(&self, message: Message) -> Result<MessageOutcome> {
        match message {
            Message::Goodbye(_) => {
                let goodbye_tx = self.lifecycle.lock().goodbye_tx.take();
                if let Some(goodbye_tx) = goodbye_tx {
                    goodbye_tx.send(()).ok();
                }
                Ok(MessageOutcome::Close)
            }
            Message::Abort(_) => Ok(MessageOutcome::Close),
            message => {
                trace!(
                    "Session {} ignored {} message while closing",
                    self.name,
                    message.message_name()
                );
                Ok(MessageOutcome::Continue)
            }
        }
    }

    fn handle_error(&self, message: ErrorMessage) {
        let Some(request) = self.requests.take(message.request, message.request_type) else {
            return self.discard(&Message::Error(message));
        };
        let error = CallError::from_error_message(
            message.error,
            &message.details,
            message.arguments,
            message.arguments_keyword,
        );
        request.fail(error.into());
    }

    fn handle_subscribed(&self, message: SubscribedMessage) {
        let Some(PendingRequest::Subscribe {
            topic,
            key,
            event_tx,
            response_tx,
        }) = self.requests.take(message.subscribe_request, 32)
        else {
            return self.discard(&Message::Subscribed(message));
        };
        // Insert before resolving, so that no event for the subscription can be missed.
        self.subscriptions
            .lock()
            .entry(message.subscription)
            .or_default()
            .push(SubscriptionEntry {
                key,
                topic,
                event_tx,
            });
        if response_tx.send(Ok(message.subscription)).is_err()
            && self.remove_subscription(message.subscription, key)
        {
            self.release_subscription(message.subscription);
        }
    }

    fn handle_registered(&self, message: RegisteredMessage) {
        let Some(PendingRequest::Register {
            procedure,
            handler,
            response_tx,
        }) = self.requests.take(message.register_request, 64)
        else {
            return self.discard(&Message::Registered(message));
        };
        self.registrations.lock().insert(
            message.registration,
            Registration { procedure, handler },
        );
        if response_tx.send(Ok(message.registration)).is_err()
            && self.remove_registration(message.registration)
        {
            self.release_registration(message.registration);
        }
    }

    fn handle_event(&self, message: EventMessage) {
        let subscription = message.subscribed_subscription;
        let released = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(entries) = subscriptions.get_mut(&subscription) else {
                debug!(
                    "Session {} discarded event for unknown subscription {subscription}",
                    self.name
                );
                return;
            };
            // The queue closes when its handler task ends, or when subscribing was cancelled
            // before that task started.
            entries.retain(|entry| {
                let event = Event {
                    subscription,
                    publication: message.published_publication,
                    topic: concrete_uri(&message.details, "topic", &entry.topic),
                    arguments: message.publish_arguments.clone(),
                    arguments_keyword: message.publish_arguments_keyword.clone(),
                    details: message.details.clone(),
                };
                entry.event_tx.send(event).is_ok()
            });
            if entries.is_empty() {
                subscriptions.remove(&subscription);
                true
            } else {
                false
            }
        };
        if released {
            self.release_subscription(subscription);
        }
    }

    fn handle_invocation(&self, message: InvocationMessage) -> Result<()> {
        let registration = self
            .registrations
            .lock()
            .get(&message.registered_registration)
            .map(|registration| {
                (
                    registration.handler.clone(),
                    concrete_uri(&message.details, "procedure", &registration.procedure),
                )
            });
        let Some((handler, procedure)) = registration else {
            let error = InteractionError::NoSuchRegistration;
            self.send(error_for_invocation(
                message.request,
                CallError::new(error.uri()).with_message(error.to_string()),
            ))?;
            return Ok(());
        };
        let Some(message_tx) = self.lifecycle.lock().message_tx.clone() else {
            return Err(SessionError::ConnectionLost.into());
        };

        let request = message.request;
        let invocation = Invocation {
            registration: message.registered_registration,
            procedure,
            arguments: message.call_arguments,
            arguments_keyword: message.call_arguments_keyword,
            details: message.details,
        };
        let name = self.name.clone();
        tokio::spawn(async move {
            let reply = match handler.invoke(invocation).await {
                Ok(rpc_yield) => Message::Yield(YieldMessage {
                    invocation_request: request,
                    options: Dictionary::default(),
                    arguments: rpc_yield.arguments,
                    arguments_keyword: rpc_yield.arguments_keyword,
                }),
                Err(err) => {
                    debug!("Session {name} invocation {request} failed: {err:#}");
                    error_for_invocation(request, call_error_for(&err))
                }
            };
            if message_tx.send(reply).is_err() {
                debug!("Session {name} lost its connection before replying to invocation {request}");
            }
        });
        Ok(())
    }
}

impl MessageHandler for Dispatcher {
    fn handle_message(&self, message: Message) -> Result<MessageOutcome> {
        if self.closed() {
            return Ok(MessageOutcome::Close);
        }
        match self.state() {
            SessionState::Disconnected | SessionState::Connecting => {
                Err(self.protocol_violation(&message))
            }
            SessionState::Joining => self.handle_joining(message),
            SessionState::Established => self.handle_established(message),
            SessionState::Closing => self.handle_closing(message),
        }
    }

    fn connection_lost(&self) {
        let newly_closed = self.closed_tx.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            *closed = true;
            true
        });
        if !newly_closed {
            return;
        }

        let (join_tx, goodbye_tx) = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.message_tx = None;
            (lifecycle.join_tx.take(), lifecycle.goodbye_tx.take())
        };
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                return false;
            }
            *state = SessionState::Disconnected;
            true
        });

        let failed = self.requests.drain();
        self.subscriptions.lock().clear();
        self.registrations.lock().clear();
        if let Some(join_tx) = join_tx {
            join_tx.send(Err(SessionError::ConnectionLost.into())).ok();
        }
        if let Some(goodbye_tx) = goodbye_tx {
            goodbye_tx.send(()).ok();
        }
        info!(
            "Session {} closed, failing {failed} outstanding requests",
            self.name
        );
    }
}

fn handshake_error(message: &AbortMessage) -> SessionError {
    SessionError::Handshake {
        reason: message.reason.to_string(),
        message: message
            .details
            .get("message")
            .and_then(|message| message.string())
            .unwrap_or_default()
            .to_owned(),
    }
}

/// The concrete URI of an event or invocation.
///
/// Pattern-based subscriptions and registrations learn it from the details, and exact ones
/// already know it.
fn concrete_uri(details: &Dictionary, key: &str, pattern: &WildcardUri) -> Option<Uri> {
    details
        .get(key)
        .and_then(|value| value.string())
        .and_then(|uri| Uri::try_from(uri).ok())
        .or_else(|| Uri::try_from(pattern.as_ref()).ok())
}

#[cfg(test)]
mod dispatcher_test {
    use tokio::sync::{
        mpsc::{
            UnboundedReceiver,
            unbounded_channel,
        },
        oneshot,
    };

    use crate::{
        core::{
            error::{
                CallError,
                SessionError,
            },
            id::Id,
            service::{
                MessageHandler,
                MessageOutcome,
            },
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::{
                Uri,
                WildcardUri,
            },
        },
        message::message::{
            AbortMessage,
            CallMessage,
            ErrorMessage,
            EventMessage,
            InvocationMessage,
            Message,
            ResultMessage,
            SubscribedMessage,
            WelcomeMessage,
        },
        session::{
            dispatcher::Dispatcher,
            requests::PendingRequest,
            session::SessionState,
        },
    };

    fn joined_dispatcher() -> (Dispatcher, UnboundedReceiver<Message>) {
        let dispatcher = Dispatcher::new("test".to_owned());
        let (message_tx, message_rx) = unbounded_channel();
        dispatcher.attach(message_tx);
        dispatcher.begin_connect().unwrap();
        let (join_tx, _join_rx) = oneshot::channel();
        dispatcher
            .begin_join(Uri::try_from("com.example.realm").unwrap(), join_tx)
            .unwrap();
        assert_matches::assert_matches!(
            dispatcher.handle_message(Message::Welcome(WelcomeMessage {
                session: Id::try_from(7).unwrap(),
                ..Default::default()
            })),
            Ok(MessageOutcome::Continue)
        );
        (dispatcher, message_rx)
    }

    #[test]
    fn rejects_messages_before_join() {
        let dispatcher = Dispatcher::new("test".to_owned());
        dispatcher.begin_connect().unwrap();
        assert_matches::assert_matches!(
            dispatcher.handle_message(Message::Result(ResultMessage::default())),
            Err(_)
        );
    }

    #[test]
    fn welcome_establishes_session() {
        let (dispatcher, _) = joined_dispatcher();
        assert_eq!(dispatcher.state(), SessionState::Established);
        assert_eq!(dispatcher.session_id(), Some(Id::try_from(7).unwrap()));
        assert_eq!(
            dispatcher.realm(),
            Some(Uri::try_from("com.example.realm").unwrap())
        );
    }

    #[tokio::test]
    async fn abort_during_join_fails_handshake() {
        let dispatcher = Dispatcher::new("test".to_owned());
        dispatcher.begin_connect().unwrap();
        let (join_tx, join_rx) = oneshot::channel();
        dispatcher
            .begin_join(Uri::try_from("com.example.realm").unwrap(), join_tx)
            .unwrap();
        assert_matches::assert_matches!(
            dispatcher.handle_message(Message::Abort(AbortMessage {
                details: Dictionary::from_iter([(
                    "message".to_owned(),
                    Value::from("no such realm")
                )]),
                reason: Uri::try_from("wamp.error.no_such_realm").unwrap(),
            })),
            Ok(MessageOutcome::Close)
        );
        assert_matches::assert_matches!(join_rx.await, Ok(Err(err)) => {
            assert_matches::assert_matches!(err.downcast_ref::<SessionError>(), Some(SessionError::Handshake { reason, message }) => {
                assert_eq!(reason, "wamp.error.no_such_realm");
                assert_eq!(message, "no such realm");
            });
        });
    }

    #[test]
    fn rejects_client_messages_from_router() {
        let (dispatcher, _) = joined_dispatcher();
        assert_matches::assert_matches!(
            dispatcher.handle_message(Message::Call(CallMessage::default())),
            Err(_)
        );
    }

    #[tokio::test]
    async fn resolves_errors_by_request_type() {
        let (dispatcher, _) = joined_dispatcher();
        let (result_tx, result_rx) = oneshot::channel();
        let request = dispatcher
            .requests()
            .insert_detached(PendingRequest::Call(result_tx))
            .unwrap();

        // An error for another request type leaves the call alone.
        let error = ErrorMessage {
            request_type: 32,
            request,
            error: Uri::try_from("com.example.failed").unwrap(),
            ..Default::default()
        };
        dispatcher.handle_message(Message::Error(error.clone())).unwrap();
        assert_eq!(dispatcher.requests().len(), 1);

        dispatcher
            .handle_message(Message::Error(ErrorMessage {
                request_type: 48,
                arguments: List::from_iter([Value::from("bad input")]),
                ..error
            }))
            .unwrap();
        assert_matches::assert_matches!(result_rx.await, Ok(Err(err)) => {
            assert_matches::assert_matches!(err.downcast_ref::<CallError>(), Some(error) => {
                assert_eq!(error.error.as_ref(), "com.example.failed");
                assert_eq!(error.message.as_deref(), Some("bad input"));
            });
        });
        assert_eq!(dispatcher.requests().len(), 0);
    }

    #[test]
    fn discards_unmatched_results() {
        let (dispatcher, _) = joined_dispatcher();
        assert_matches::assert_matches!(
            dispatcher.handle_message(Message::Result(ResultMessage {
                call_request: Id::try_from(99).unwrap(),
                ..Default::default()
            })),
            Ok(MessageOutcome::Continue)
        );
    }

    #[tokio::test]
    async fn releases_subscription_when_subscriber_stopped_waiting() {
        let (dispatcher, mut message_rx) = joined_dispatcher();
        let (event_tx, _event_rx) = unbounded_channel();
        let (response_tx, response_rx) = oneshot::channel();
        let request = dispatcher
            .requests()
            .insert_detached(PendingRequest::Subscribe {
                topic: WildcardUri::try_from("com.example.topic").unwrap(),
                key: dispatcher.next_subscription_key(),
                event_tx,
                response_tx,
            })
            .unwrap();
        drop(response_rx);

        dispatcher
            .handle_message(Message::Subscribed(SubscribedMessage {
                subscribe_request: request,
                subscription: Id::try_from(5).unwrap(),
            }))
            .unwrap();
        assert_matches::assert_matches!(message_rx.recv().await, Some(Message::Unsubscribe(message)) => {
            assert_eq!(message.subscribed_subscription, Id::try_from(5).unwrap());
        });
    }

    #[tokio::test]
    async fn delivers_events_to_every_local_handle() {
        let (dispatcher, _) = joined_dispatcher();
        let subscription = Id::try_from(5).unwrap();
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (event_tx, event_rx) = unbounded_channel();
            let (response_tx, _response_rx) = oneshot::channel();
            let request = dispatcher
                .requests()
                .insert_detached(PendingRequest::Subscribe {
                    topic: WildcardUri::try_from("com.example.topic").unwrap(),
                    key: dispatcher.next_subscription_key(),
                    event_tx,
                    response_tx,
                })
                .unwrap();
            dispatcher
                .handle_message(Message::Subscribed(SubscribedMessage {
                    subscribe_request: request,
                    subscription,
                }))
                .unwrap();
            receivers.push(event_rx);
        }

        dispatcher
            .handle_message(Message::Event(EventMessage {
                subscribed_subscription: subscription,
                published_publication: Id::try_from(1).unwrap(),
                publish_arguments: List::from_iter([Value::from(1i64)]),
                ..Default::default()
            }))
            .unwrap();
        for mut event_rx in receivers {
            assert_matches::assert_matches!(event_rx.recv().await, Some(event) => {
                assert_eq!(event.topic, Some(Uri::try_from("com.example.topic").unwrap()));
                assert_eq!(event.arguments, List::from_iter([Value::from(1i64)]));
            });
        }
    }

    #[tokio::test]
    async fn prunes_handles_whose_event_queue_closed() {
        let (dispatcher, mut message_rx) = joined_dispatcher();
        let subscription = Id::try_from(5).unwrap();
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (event_tx, event_rx) = unbounded_channel();
            let (response_tx, _response_rx) = oneshot::channel();
            let request = dispatcher
                .requests()
                .insert_detached(PendingRequest::Subscribe {
                    topic: WildcardUri::try_from("com.example.topic").unwrap(),
                    key: dispatcher.next_subscription_key(),
                    event_tx,
                    response_tx,
                })
                .unwrap();
            dispatcher
                .handle_message(Message::Subscribed(SubscribedMessage {
                    subscribe_request: request,
                    subscription,
                }))
                .unwrap();
            receivers.push(event_rx);
        }
        let event = || {
            Message::Event(EventMessage {
                subscribed_subscription: subscription,
                published_publication: Id::try_from(1).unwrap(),
                ..Default::default()
            })
        };

        // The handler task of the first handle ended.
        let mut remaining = receivers.pop().unwrap();
        drop(receivers);
        dispatcher.handle_message(event()).unwrap();
        assert_matches::assert_matches!(remaining.recv().await, Some(_));
        assert_matches::assert_matches!(message_rx.try_recv(), Err(_));

        drop(remaining);
        dispatcher.handle_message(event()).unwrap();
        assert_matches::assert_matches!(message_rx.recv().await, Some(Message::Unsubscribe(message)) => {
            assert_eq!(message.subscribed_subscription, subscription);
        });
    }

    #[tokio::test]
    async fn answers_unknown_invocations() {
        let (dispatcher, mut message_rx) = joined_dispatcher();
        dispatcher
            .handle_message(Message::Invocation(InvocationMessage {
                request: Id::try_from(3).unwrap(),
                registered_registration: Id::try_from(4).unwrap(),
                ..Default::default()
            }))
            .unwrap();
        assert_matches::assert_matches!(message_rx.recv().await, Some(Message::Error(message)) => {
            assert_eq!(message.request_type, 68);
            assert_eq!(message.error.as_ref(), "wamp.error.no_such_registration");
        });
    }

    #[tokio::test]
    async fn connection_lost_fails_everything_once() {
        let (dispatcher, _) = joined_dispatcher();
        let (result_tx, result_rx) = oneshot::channel();
        dispatcher
            .requests()
            .insert_detached(PendingRequest::Call(result_tx))
            .unwrap();

        dispatcher.connection_lost();
        dispatcher.connection_lost();
        assert!(dispatcher.closed());
        assert_eq!(dispatcher.state(), SessionState::Disconnected);
        assert_matches::assert_matches!(result_rx.await, Ok(Err(err)) => {
            assert_matches::assert_matches!(err.downcast_ref::<SessionError>(), Some(SessionError::ConnectionLost));
        });
        assert_matches::assert_matches!(
            dispatcher.ensure_established(),
            Err(SessionError::SessionClosed)
        );
        assert_matches::assert_matches!(dispatcher.begin_connect(), Err(SessionError::SessionClosed));
    }
}
