use anyhow::Error;
use test_utils::router::{
    TestRouter,
    joined_session,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    unbounded_channel,
};
use wampli::{
    core::{
        error::CallError,
        id::Id,
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
    message::message::{
        ErrorMessage,
        EventMessage,
        Message,
        PublishedMessage,
        SubscribeMessage,
        SubscribedMessage,
        UnsubscribedMessage,
    },
    session::{
        Event,
        PublishOptions,
        PublishedEvent,
        Session,
        SessionConfig,
        SubscriptionHandle,
        SubscriptionOptions,
    },
};

fn topic() -> Uri {
    Uri::try_from("com.example.topic").unwrap()
}

async fn subscribe(
    session: &Session,
    router: &mut TestRouter,
    topic: WildcardUri,
    options: SubscriptionOptions,
    subscription: u64,
) -> (SubscriptionHandle, SubscribeMessage, UnboundedReceiver<Event>) {
    let (event_tx, event_rx) = unbounded_channel();
    let subscribe = session.subscribe(topic, options, move |event: Event| {
        event_tx.send(event).ok();
    });
    let answer = async {
        let subscribe = match router.receive().await? {
            Message::Subscribe(subscribe) => subscribe,
            message => return Err(Error::msg(format!("unexpected {}", message.message_name()))),
        };
        router.send(Message::Subscribed(SubscribedMessage {
            subscribe_request: subscribe.request,
            subscription: Id::try_from(subscription)?,
        }))?;
        Ok(subscribe)
    };
    let (handle, message) = tokio::join!(subscribe, answer);
    (handle.unwrap(), message.unwrap(), event_rx)
}

fn event(subscription: Id, publication: u64, arguments: List) -> Message {
    Message::Event(EventMessage {
        subscribed_subscription: subscription,
        published_publication: Id::try_from(publication).unwrap(),
        details: Dictionary::default(),
        publish_arguments: arguments,
        publish_arguments_keyword: Dictionary::default(),
    })
}

#[tokio::test]
async fn delivers_events_in_order() {
    test_utils::setup::setup_test_environment();

    for count in [0, 1, 1000] {
        let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
        let (handle, _, mut event_rx) = subscribe(
            &session,
            &mut router,
            WildcardUri::from(topic()),
            SubscriptionOptions::default(),
            3,
        )
        .await;
        assert_eq!(handle.id(), Id::try_from(3).unwrap());

        for i in 0..count {
            router
                .send(event(handle.id(), i + 1, List::from_iter([Value::Integer(i as i64)])))
                .unwrap();
        }
        for i in 0..count {
            assert_matches::assert_matches!(event_rx.recv().await, Some(event) => {
                assert_eq!(event.publication, Id::try_from(i + 1).unwrap());
                assert_eq!(event.topic, Some(topic()));
                assert_eq!(event.arguments, List::from_iter([Value::Integer(i as i64)]));
            });
        }

        // Closing the session drops the handler, so nothing more can arrive.
        session.close().await.unwrap();
        assert_matches::assert_matches!(event_rx.recv().await, None);
    }
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    test_utils::setup::setup_test_environment();

    let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
    let (handle, _, mut event_rx) = subscribe(
        &session,
        &mut router,
        WildcardUri::from(topic()),
        SubscriptionOptions::default(),
        3,
    )
    .await;

    let unsubscribe = session.unsubscribe(&handle);
    let answer = async {
        let unsubscribe = match router.receive().await? {
            Message::Unsubscribe(unsubscribe) => unsubscribe,
            message => return Err(Error::msg(format!("unexpected {}", message.message_name()))),
        };
        assert_eq!(unsubscribe.subscribed_subscription, handle.id());
        router.send(Message::Unsubscribed(UnsubscribedMessage {
            unsubscribe_request: unsubscribe.request,
        }))
    };
    let (unsubscribed, answered) = tokio::join!(unsubscribe, answer);
    assert_matches::assert_matches!(answered, Ok(()));
    assert_matches::assert_matches!(unsubscribed, Ok(()));

    // Nothing is sent the second time.
    assert_matches::assert_matches!(session.unsubscribe(&handle).await, Ok(()));

    // Events still in flight from the router are dropped.
    router
        .send(event(handle.id(), 1, List::default()))
        .unwrap();
    assert_matches::assert_matches!(event_rx.recv().await, None);

    let (left, goodbye) = tokio::join!(session.leave(), router.accept_leave());
    assert_matches::assert_matches!(left, Ok(()));
    assert_matches::assert_matches!(goodbye, Ok(_));
}

#[tokio::test]
async fn keeps_router_subscription_until_last_handle_is_removed() {
    test_utils::setup::setup_test_environment();

    let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
    let (first, _, mut first_rx) = subscribe(
        &session,
        &mut router,
        WildcardUri::from(topic()),
        SubscriptionOptions::default(),
        3,
    )
    .await;
    let (second, _, mut second_rx) = subscribe(
        &session,
        &mut router,
        WildcardUri::from(topic()),
        SubscriptionOptions::default(),
        3,
    )
    .await;
    assert_eq!(first.id(), second.id());

    // The router still has a subscriber, so no UNSUBSCRIBE goes out.
    assert_matches::assert_matches!(session.unsubscribe(&first).await, Ok(()));
    assert_matches::assert_matches!(first_rx.recv().await, None);

    router
        .send(event(second.id(), 1, List::default()))
        .unwrap();
    assert_matches::assert_matches!(second_rx.recv().await, Some(_));

    let unsubscribe = session.unsubscribe(&second);
    let answer = async {
        let unsubscribe = match router.receive().await? {
            Message::Unsubscribe(unsubscribe) => unsubscribe,
            message => return Err(Error::msg(format!("unexpected {}", message.message_name()))),
        };
        router.send(Message::Unsubscribed(UnsubscribedMessage {
            unsubscribe_request: unsubscribe.request,
        }))
    };
    let (unsubscribed, answered) = tokio::join!(unsubscribe, answer);
    assert_matches::assert_matches!(answered, Ok(()));
    assert_matches::assert_matches!(unsubscribed, Ok(()));
}

#[tokio::test]
async fn subscribes_with_pattern() {
    test_utils::setup::setup_test_environment();

    let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
    let (handle, subscribe, mut event_rx) = subscribe(
        &session,
        &mut router,
        WildcardUri::try_from("com.example..updated").unwrap(),
        SubscriptionOptions {
            match_style: Some(MatchStyle::Wildcard),
        },
        4,
    )
    .await;
    assert_eq!(
        subscribe.options.get("match"),
        Some(&Value::from("wildcard"))
    );

    router
        .send(Message::Event(EventMessage {
            subscribed_subscription: handle.id(),
            published_publication: Id::try_from(1).unwrap(),
            details: Dictionary::from_iter([(
                "topic".to_owned(),
                Value::from("com.example.user.updated"),
            )]),
            ..Default::default()
        }))
        .unwrap();
    assert_matches::assert_matches!(event_rx.recv().await, Some(event) => {
        assert_eq!(event.topic, Some(Uri::try_from("com.example.user.updated").unwrap()));
    });
}

#[tokio::test]
async fn returns_subscribe_errors() {
    test_utils::setup::setup_test_environment();

    let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
    let subscribe = session.subscribe(
        WildcardUri::from(topic()),
        SubscriptionOptions::default(),
        |_: Event| {},
    );
    let answer = async {
        let subscribe = match router.receive().await? {
            Message::Subscribe(subscribe) => subscribe,
            message => return Err(Error::msg(format!("unexpected {}", message.message_name()))),
        };
        router.send(Message::Error(ErrorMessage {
            request_type: 32,
            request: subscribe.request,
            error: Uri::try_from("wamp.error.not_authorized")?,
            ..Default::default()
        }))
    };
    let (subscribed, answered) = tokio::join!(subscribe, answer);
    assert_matches::assert_matches!(answered, Ok(()));
    assert_matches::assert_matches!(subscribed, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<CallError>(), Some(error) => {
            assert_eq!(error.error.as_ref(), "wamp.error.not_authorized");
        });
    });
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn publishes_with_and_without_acknowledgement() {
    test_utils::setup::setup_test_environment();

    let (session, mut router) = joined_session(SessionConfig::default()).await.unwrap();
    assert_matches::assert_matches!(
        session
            .publish(
                topic(),
                PublishedEvent {
                    arguments: List::from_iter([Value::from("hello")]),
                    ..Default::default()
                },
            )
            .await,
        Ok(None)
    );
    assert_matches::assert_matches!(router.receive().await, Ok(Message::Publish(publish)) => {
        assert_eq!(publish.topic, topic());
        assert!(publish.options.is_empty());
        assert_eq!(publish.arguments, List::from_iter([Value::from("hello")]));
    });
    assert_eq!(session.pending_requests(), 0);

    let publish = session.publish(
        topic(),
        PublishedEvent {
            options: PublishOptions {
                acknowledge: true,
                exclude_me: Some(false),
            },
            ..Default::default()
        },
    );
    let answer = async {
        let publish = match router.receive().await? {
            Message::Publish(publish) => publish,
            message => return Err(Error::msg(format!("unexpected {}", message.message_name()))),
        };
        router.send(Message::Published(PublishedMessage {
            publish_request: publish.request,
            publication: Id::try_from(77)?,
        }))?;
        Ok(publish)
    };
    let (published, answered) = tokio::join!(publish, answer);
    assert_matches::assert_matches!(published, Ok(Some(publication)) => {
        assert_eq!(publication, Id::try_from(77).unwrap());
    });
    assert_matches::assert_matches!(answered, Ok(publish) => {
        assert_eq!(publish.options.get("acknowledge"), Some(&Value::Bool(true)));
        assert_eq!(publish.options.get("exclude_me"), Some(&Value::Bool(false)));
    });
}
