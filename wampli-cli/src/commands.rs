use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Context,
    Error,
    Result,
};
use futures_util::future::try_join_all;
use log::{
    info,
    warn,
};
use tokio::{
    io::BufReader,
    sync::{
        mpsc::{
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
    },
    task::JoinHandle,
};
use wampli::{
    core::uri::Uri,
    serializer::serializer::SerializerType,
    session::{
        Event,
        PublishOptions,
        PublishedEvent,
        RpcCall,
        Session,
        SessionConfig,
        SessionState,
        SubscriptionOptions,
    },
};

use crate::{
    args::{
        Aliases,
        parse_args,
        ready_uri,
    },
    format::{
        format_event,
        format_rpc_result,
    },
    shell::{
        INTRO,
        Shell,
    },
};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub realm: String,
    pub serializer: SerializerType,
    pub timeout: Option<Duration>,
}

impl ConnectionOptions {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name: "wampli".to_owned(),
            serializers: Vec::from_iter([self.serializer]),
            request_timeout: self.timeout,
            ..Default::default()
        }
    }
}

/// Connects to the router and joins the realm.
pub async fn open_session(options: &ConnectionOptions) -> Result<Arc<Session>> {
    let realm = Uri::try_from(options.realm.as_str()).context("invalid realm")?;
    let session = Session::new(options.session_config())?;
    session
        .connect(&options.url)
        .await
        .with_context(|| format!("failed to connect to {}", options.url))?;
    let id = session
        .join(realm.clone())
        .await
        .with_context(|| format!("failed to join realm {realm}"))?;
    info!("Joined realm {realm} as session {id}");
    Ok(Arc::new(session))
}

/// Leaves the session if it is still established, and closes the connection either way.
pub async fn finish_session(session: &Session) {
    if session.state() == SessionState::Established {
        if let Err(err) = session.leave().await {
            warn!("Failed to leave the session cleanly: {err:#}");
        }
    }
    if let Err(err) = session.close().await {
        warn!("Failed to close the session: {err:#}");
    }
}

/// Calls a procedure and returns the formatted result.
pub async fn call(session: &Session, procedure: &str, args: &[String]) -> Result<String> {
    let procedure = Uri::try_from(procedure)?;
    let (arguments, arguments_keyword) = parse_args(args)?;
    let result = session
        .call(
            procedure,
            RpcCall {
                arguments,
                arguments_keyword,
                ..Default::default()
            },
        )
        .await?;
    Ok(format_rpc_result(&result))
}

/// Publishes to a topic and waits for the router to acknowledge it.
pub async fn publish(session: &Session, topic: &str, args: &[String]) -> Result<String> {
    let topic = Uri::try_from(topic)?;
    let (arguments, arguments_keyword) = parse_args(args)?;
    session
        .publish(
            topic,
            PublishedEvent {
                arguments,
                arguments_keyword,
                options: PublishOptions {
                    acknowledge: true,
                    ..Default::default()
                },
            },
        )
        .await?;
    Ok("ok".to_owned())
}

/// Subscribes to every topic, writing events to the output as they arrive.
///
/// Returns the number of subscriptions made.
pub async fn subscribe(
    session: &Session,
    topics: &[String],
    output: UnboundedSender<String>,
) -> Result<usize> {
    if topics.is_empty() {
        return Err(Error::msg("please provide at least one topic"));
    }
    let patterns = topics
        .iter()
        .map(|topic| ready_uri(topic, &Aliases::default()))
        .collect::<Result<Vec<_>>>()?;
    let subscriptions = try_join_all(patterns.into_iter().map(|pattern| {
        let output = output.clone();
        session.subscribe(
            pattern.uri,
            SubscriptionOptions {
                match_style: pattern.match_style,
            },
            move |event: Event| {
                output.send(format_event(&event)).ok();
            },
        )
    }))
    .await?;
    Ok(subscriptions.len())
}

/// A task writing output entries as they arrive.
///
/// Event handlers keep senders until the session closes, so [`Printer::finish`] stops the task
/// instead of waiting for every sender to drop.
pub struct Printer {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Printer {
    /// Starts a printer that passes every entry to `write`.
    pub fn spawn<F>(mut write: F) -> (UnboundedSender<String>, Self)
    where
        F: FnMut(String) + Send + 'static,
    {
        let (output_tx, mut output_rx) = unbounded_channel::<String>();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    text = output_rx.recv() => match text {
                        Some(text) => write(text),
                        None => return,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            output_rx.close();
            while let Some(text) = output_rx.recv().await {
                write(text);
            }
        });
        (
            output_tx,
            Self {
                stop: stop_tx,
                task,
            },
        )
    }

    /// Writes everything already queued, then stops.
    pub async fn finish(self) {
        self.stop.send(()).ok();
        if let Err(err) = self.task.await {
            warn!("Output task failed: {err}");
        }
    }
}

/// Prints everything written to the returned channel to standard output, one entry per line.
pub fn stdout_printer() -> (UnboundedSender<String>, Printer) {
    Printer::spawn(|text| println!("{text}"))
}

/// Prints events until the session ends or the user interrupts.
pub async fn subscribe_until_interrupted(session: &Session, topics: &[String]) -> Result<()> {
    let (output, printer) = stdout_printer();
    let count = match subscribe(session, topics, output).await {
        Ok(count) => count,
        Err(err) => {
            printer.finish().await;
            return Err(err);
        }
    };
    println!("subscribed to {count} topic(s)");
    let result = tokio::select! {
        _ = session.wait_until_closed() => {
            warn!("The router closed the session");
            Ok(())
        }
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for interrupts").map(|()| info!("Interrupted"))
        }
    };
    printer.finish().await;
    result
}

/// Runs the interactive shell on standard input.
pub async fn run_shell(session: Arc<Session>, timeout: Option<Duration>) -> Result<()> {
    println!("{INTRO}");
    let (output, printer) = stdout_printer();
    let shell = Shell::new(session, output, timeout);
    let result = shell.run(BufReader::new(tokio::io::stdin())).await;
    printer.finish().await;
    result?;
    println!("Goodbye");
    Ok(())
}
