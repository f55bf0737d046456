use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::debug;
use parking_lot::Mutex;
use tokio::{
    io::{
        AsyncBufRead,
        AsyncBufReadExt,
    },
    sync::mpsc::UnboundedSender,
    task::JoinSet,
};
use wampli::{
    core::{
        error::CallError,
        types::{
            Dictionary,
            HashMap,
            List,
        },
        uri::Uri,
    },
    session::{
        Event,
        PublishOptions,
        PublishedEvent,
        RpcCall,
        Session,
        SubscriptionHandle,
        SubscriptionOptions,
    },
};

use crate::{
    args::{
        Aliases,
        UriPattern,
        parse_args,
        ready_uri,
        split_arg_string,
        split_function_style,
    },
    format::{
        format_event,
        format_rpc_result,
    },
};

pub const INTRO: &str = "Type 'help' or '?' to list all commands.\nUse 'exit' to exit the shell.";

const HELP: &str = "\
Commands:
  call <uri> [args...]         call a procedure
  <uri>(args...)               call a procedure, function style
  publish <uri> [args...]      publish to a topic
  subscribe <topic>            subscribe to a topic; `*` and a trailing `**` match patterns
  unsubscribe <topic>          remove a subscription
  alias [name [uri]]           list, show or define an alias; use it as `name` or `$name`
  help                         show this help
  exit                         leave the session and exit

Arguments are YAML values. Use key=value for keyword arguments.";

/// A command entered into the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Call {
        procedure: Uri,
        arguments: List,
        arguments_keyword: Dictionary,
    },
    Publish {
        topic: Uri,
        arguments: List,
        arguments_keyword: Dictionary,
    },
    Subscribe(UriPattern),
    Unsubscribe(UriPattern),
    Alias {
        name: Option<String>,
        uri: Option<String>,
    },
    Help,
    Exit,
    Nothing,
}

/// Resolves a URI that must name exactly one procedure or topic.
fn concrete_uri(uri: &str, aliases: &Aliases) -> Result<Uri> {
    let pattern = ready_uri(uri, aliases)?;
    if pattern.match_style.is_some() {
        return Err(Error::msg(format!(
            "{} is a pattern, which can only be subscribed to",
            pattern.uri
        )));
    }
    Ok(Uri::try_from(pattern.uri.as_ref())?)
}

/// Splits `uri args...` into the URI and its parsed arguments.
fn uri_and_args(args: Vec<String>, aliases: &Aliases) -> Result<(Uri, List, Dictionary)> {
    let mut args = args.into_iter();
    let uri = args
        .next()
        .ok_or_else(|| Error::msg("please provide a URI"))?;
    let uri = concrete_uri(&uri, aliases)?;
    let (arguments, arguments_keyword) = parse_args(args)?;
    Ok((uri, arguments, arguments_keyword))
}

/// Parses a line of shell input.
pub fn parse_command(line: &str, aliases: &Aliases) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    let (name, rest) = line
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((line, ""));
    match name {
        "call" => {
            let (procedure, arguments, arguments_keyword) =
                uri_and_args(split_arg_string(rest)?, aliases)?;
            Ok(Command::Call {
                procedure,
                arguments,
                arguments_keyword,
            })
        }
        "publish" => {
            let (topic, arguments, arguments_keyword) =
                uri_and_args(split_arg_string(rest)?, aliases)?;
            Ok(Command::Publish {
                topic,
                arguments,
                arguments_keyword,
            })
        }
        "subscribe" => Ok(Command::Subscribe(ready_uri(rest, aliases)?)),
        "unsubscribe" => Ok(Command::Unsubscribe(ready_uri(rest, aliases)?)),
        "alias" => {
            let mut args = split_arg_string(rest)?.into_iter();
            let command = Command::Alias {
                name: args.next(),
                uri: args.next(),
            };
            if args.next().is_some() {
                return Err(Error::msg("usage: alias [name [uri]]"));
            }
            Ok(command)
        }
        "help" | "?" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        _ => match split_function_style(line) {
            Some(args) => {
                let (procedure, arguments, arguments_keyword) = uri_and_args(args, aliases)?;
                Ok(Command::Call {
                    procedure,
                    arguments,
                    arguments_keyword,
                })
            }
            None => Err(Error::msg(format!("unknown command: {name}"))),
        },
    }
}

fn describe_error(error: &Error) -> String {
    match error.downcast_ref::<CallError>() {
        Some(error) => format!("error: {error}"),
        None => format!("error: {error:#}"),
    }
}

fn describe_pattern(pattern: &UriPattern) -> String {
    match pattern.match_style {
        Some(match_style) => format!("{} ({match_style})", pattern.uri),
        None => pattern.uri.to_string(),
    }
}

/// Interactive shell over a joined session.
///
/// Every line is handled as soon as it is entered, and operations run concurrently. Results and
/// events are written to the output channel as they arrive.
pub struct Shell {
    session: Arc<Session>,
    aliases: Aliases,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionHandle>>>,
    output: UnboundedSender<String>,
    timeout: Option<Duration>,
    tasks: JoinSet<()>,
}

impl Shell {
    pub fn new(
        session: Arc<Session>,
        output: UnboundedSender<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            aliases: Aliases::default(),
            subscriptions: Arc::new(Mutex::new(HashMap::default())),
            output,
            timeout,
            tasks: JoinSet::new(),
        }
    }

    fn print<S>(&self, text: S)
    where
        S: Into<String>,
    {
        self.output.send(text.into()).ok();
    }

    /// Handles one line of input.
    ///
    /// Returns `false` when the shell should exit.
    pub fn handle_line(&mut self, line: &str) -> bool {
        let command = match parse_command(line, &self.aliases) {
            Ok(command) => command,
            Err(err) => {
                self.print(describe_error(&err));
                return true;
            }
        };
        debug!("Shell command: {command:?}");
        match command {
            Command::Call {
                procedure,
                arguments,
                arguments_keyword,
            } => self.call(procedure, arguments, arguments_keyword),
            Command::Publish {
                topic,
                arguments,
                arguments_keyword,
            } => self.publish(topic, arguments, arguments_keyword),
            Command::Subscribe(pattern) => self.subscribe(pattern),
            Command::Unsubscribe(pattern) => self.unsubscribe(pattern),
            Command::Alias { name, uri } => self.alias(name, uri),
            Command::Help => self.print(HELP),
            Command::Exit => return false,
            Command::Nothing => (),
        }
        true
    }

    fn call(&mut self, procedure: Uri, arguments: List, arguments_keyword: Dictionary) {
        let session = self.session.clone();
        let output = self.output.clone();
        let timeout = self.timeout;
        self.tasks.spawn(async move {
            let result = session
                .call(
                    procedure,
                    RpcCall {
                        arguments,
                        arguments_keyword,
                        timeout,
                    },
                )
                .await;
            let text = match result {
                Ok(result) => format_rpc_result(&result),
                Err(err) => describe_error(&err),
            };
            output.send(text).ok();
        });
    }

    fn publish(&mut self, topic: Uri, arguments: List, arguments_keyword: Dictionary) {
        let session = self.session.clone();
        let output = self.output.clone();
        self.tasks.spawn(async move {
            let result = session
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
                .await;
            let text = match result {
                Ok(_) => "ok".to_owned(),
                Err(err) => describe_error(&err),
            };
            output.send(text).ok();
        });
    }

    fn subscribe(&mut self, pattern: UriPattern) {
        let key = describe_pattern(&pattern);
        if self.subscriptions.lock().contains_key(&key) {
            self.print(format!("already subscribed to {key}"));
            return;
        }
        let session = self.session.clone();
        let subscriptions = self.subscriptions.clone();
        let output = self.output.clone();
        self.tasks.spawn(async move {
            let event_output = output.clone();
            let subscribed = session
                .subscribe(
                    pattern.uri,
                    SubscriptionOptions {
                        match_style: pattern.match_style,
                    },
                    move |event: Event| {
                        event_output
                            .send(format!("received event: {}", format_event(&event)))
                            .ok();
                    },
                )
                .await;
            let subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(err) => {
                    output.send(describe_error(&err)).ok();
                    return;
                }
            };
            // Another subscribe for the same topic may have finished first.
            let duplicate = {
                let mut subscriptions = subscriptions.lock();
                if subscriptions.contains_key(&key) {
                    Some(subscription)
                } else {
                    subscriptions.insert(key.clone(), subscription);
                    None
                }
            };
            match duplicate {
                Some(subscription) => {
                    session.unsubscribe(&subscription).await.ok();
                    output.send(format!("already subscribed to {key}")).ok();
                }
                None => {
                    output.send(format!("subscribed to {key}")).ok();
                }
            }
        });
    }

    fn unsubscribe(&mut self, pattern: UriPattern) {
        let key = describe_pattern(&pattern);
        let subscription = match self.subscriptions.lock().remove(&key) {
            Some(subscription) => subscription,
            None => {
                self.print(format!("not subscribed to {key}"));
                return;
            }
        };
        let session = self.session.clone();
        let output = self.output.clone();
        self.tasks.spawn(async move {
            let text = match session.unsubscribe(&subscription).await {
                Ok(()) => format!("unsubscribed from {key}"),
                Err(err) => describe_error(&err),
            };
            output.send(text).ok();
        });
    }

    fn alias(&mut self, name: Option<String>, uri: Option<String>) {
        match (name, uri) {
            (None, _) => {
                let mut aliases = self.aliases.iter().collect::<Vec<_>>();
                if aliases.is_empty() {
                    self.print("no aliases defined");
                    return;
                }
                aliases.sort();
                let text = aliases
                    .into_iter()
                    .map(|(name, uri)| format!("{name} = {uri}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.print(text);
            }
            (Some(name), None) => match self.aliases.get(&name) {
                Some(uri) => self.print(format!("{name} = {uri}")),
                None => self.print(format!("no alias named {name}")),
            },
            (Some(name), Some(uri)) => {
                self.print(format!("{name} = {uri}"));
                self.aliases.insert(name, uri);
            }
        }
    }

    /// Reads commands from the input until it ends, the user exits, or the session closes.
    ///
    /// Operations still in flight are awaited before returning, unless the session closed.
    pub async fn run<R>(mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let session = self.session.clone();
        let mut lines = input.lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => if !self.handle_line(&line) {
                        break;
                    },
                    None => break,
                },
                _ = session.wait_until_closed() => {
                    self.print("connection closed");
                    self.tasks.shutdown().await;
                    return Ok(());
                }
                // Reap finished operations so the set does not grow without bound.
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => (),
            }
        }
        tokio::select! {
            _ = async { while self.tasks.join_next().await.is_some() {} } => (),
            _ = session.wait_until_closed() => self.tasks.shutdown().await,
        }
        Ok(())
    }
}
