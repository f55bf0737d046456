use std::time::Duration;

use anyhow::Result;
use clap::{
    Parser,
    Subcommand,
    ValueEnum,
};
use tracing_subscriber::EnvFilter;
use wampli::serializer::serializer::SerializerType;
use wampli_cli::commands::{
    self,
    ConnectionOptions,
};

/// A command line interface for the WAMP protocol.
#[derive(Parser)]
#[command(name = "wampli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// URL of the WAMP router to connect to.
    #[arg(short, long, env = "WAMPLI_URL")]
    url: String,

    /// Realm to join.
    #[arg(short, long, env = "WAMPLI_REALM")]
    realm: String,

    /// Serializer to use on the connection.
    #[arg(short, long, value_enum, default_value_t = Serializer::Json)]
    serializer: Serializer,

    /// Timeout for calls and acknowledgements, in seconds.
    #[arg(short, long)]
    timeout: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Serializer {
    Json,
    Msgpack,
}

impl From<Serializer> for SerializerType {
    fn from(value: Serializer) -> Self {
        match value {
            Serializer::Json => Self::Json,
            Serializer::Msgpack => Self::MessagePack,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Call a procedure.
    Call {
        /// WAMP URI.
        uri: String,
        /// Arguments to provide. Use key=value for keyword arguments.
        args: Vec<String>,
    },
    /// Publish to a topic.
    Publish {
        /// WAMP URI.
        uri: String,
        /// Arguments to provide. Use key=value for keyword arguments.
        args: Vec<String>,
    },
    /// Subscribe to topics and print events until interrupted.
    Subscribe {
        /// WAMP URIs, optionally with `*` and a trailing `**`.
        #[arg(required = true)]
        uri: Vec<String>,
    },
    /// Start the interactive shell.
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let timeout = match cli.timeout {
        Some(seconds) => Some(Duration::try_from_secs_f64(seconds)?),
        None => None,
    };
    let options = ConnectionOptions {
        url: cli.url,
        realm: cli.realm,
        serializer: cli.serializer.into(),
        timeout,
    };

    let session = match commands::open_session(&options).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    };
    let result = match cli.command {
        Command::Call { uri, args } => commands::call(&session, &uri, &args)
            .await
            .map(|text| println!("{text}")),
        Command::Publish { uri, args } => commands::publish(&session, &uri, &args)
            .await
            .map(|text| println!("{text}")),
        Command::Subscribe { uri } => commands::subscribe_until_interrupted(&session, &uri).await,
        Command::Shell => commands::run_shell(session.clone(), timeout).await,
    };
    commands::finish_session(&session).await;

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}
