//! Elohim Duplex CLI
//!
//! ## Usage
//!
//! ```bash
//! # Ask the API what it is
//! elohim-duplex --url https://api.example.com --token $TOKEN request info
//!
//! # Fetch one object
//! elohim-duplex --config duplex.toml request retrieve host --id h1
//!
//! # Create an object from a JSON payload
//! elohim-duplex request create host --payload '{"name": "web-1"}'
//!
//! # Stream events for two identities
//! elohim-duplex --namespace /acme watch --identity host --identity service
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use elohim_duplex::{Config, CredentialStore, DuplexClient, DuplexError, EventType, Operation, PushFilter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-duplex")]
#[command(about = "Duplex client for the object API")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the object API
    #[arg(long, env = "DUPLEX_URL")]
    url: Option<String>,

    /// Namespace to operate in
    #[arg(long, env = "DUPLEX_NAMESPACE")]
    namespace: Option<String>,

    /// Credential sent with every request
    #[arg(long, env = "DUPLEX_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the response
    Request {
        #[arg(value_enum)]
        operation: OperationArg,

        /// Kind of object to operate on
        #[arg(default_value = "root")]
        identity: String,

        /// Object id (retrieve, update, delete)
        #[arg(long)]
        id: Option<String>,

        /// JSON payload (create, update)
        #[arg(long)]
        payload: Option<String>,
    },

    /// Stream push events until interrupted
    Watch {
        /// Only these identities (repeatable, default all)
        #[arg(long = "identity")]
        identities: Vec<String>,

        /// Include child namespaces
        #[arg(long)]
        recursive: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OperationArg {
    Create,
    Retrieve,
    RetrieveMany,
    Update,
    Delete,
    Info,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Create => Operation::Create,
            OperationArg::Retrieve => Operation::Retrieve,
            OperationArg::RetrieveMany => Operation::RetrieveMany,
            OperationArg::Update => Operation::Update,
            OperationArg::Delete => Operation::Delete,
            OperationArg::Info => Operation::Info,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env();

    // CLI overrides
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(token) = args.token {
        config.token = token;
    }

    match args.command {
        Command::Request {
            operation,
            identity,
            id,
            payload,
        } => run_request(&config, operation.into(), identity, id, payload).await,
        Command::Watch {
            identities,
            recursive,
        } => {
            config.recursive = config.recursive || recursive;
            run_watch(&config, identities).await
        }
    }
}

async fn run_request(
    config: &Config,
    operation: Operation,
    identity: String,
    id: Option<String>,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let credentials = CredentialStore::new(config.token.clone());
    let client = DuplexClient::connect_websocket(config.client_config()?, credentials)
        .await
        .with_context(|| format!("Failed to connect to {}", config.url))?;

    let mut request = client.request(operation, identity);
    if let Some(id) = id {
        request = request.with_object_id(id);
    }
    if let Some(payload) = payload {
        let value: serde_json::Value =
            serde_json::from_str(&payload).context("Payload is not valid JSON")?;
        request = request.with_payload(&value)?;
    }

    let result = client.send(&request).await;
    client.close().await?;

    let response = result?;
    info!(status = response.status_code, total = response.total, "Request completed");
    println!("{}", serde_json::to_string_pretty(&response.payload)?);
    Ok(())
}

async fn run_watch(config: &Config, identities: Vec<String>) -> anyhow::Result<()> {
    let credentials = CredentialStore::new(config.token.clone());
    let client = DuplexClient::connect_websocket(config.client_config()?, credentials)
        .await
        .with_context(|| format!("Failed to connect to {}", config.url))?;

    let filter = identities
        .iter()
        .fold(PushFilter::new(), |filter, identity| {
            filter.filter_identity(identity.clone(), &[] as &[EventType])
        });

    // Rewritten on every reconnect, the server forgets it with the connection
    let filter = (!filter.identities.is_empty()).then_some(filter);

    let subscription = client.subscribe(Some(config.subscriber_options()?), filter, None);
    let (handle, mut events, mut errors, mut status) = subscription.into_parts();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            Some(state) = status.recv() => info!(status = ?state, "Subscription status"),
            Some(err) = errors.recv() => {
                error!(error = %err, "Subscription error");
                if matches!(err, DuplexError::DialFailure { .. }) {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    handle.unsubscribe().await?;
    client.close().await?;
    Ok(())
}
