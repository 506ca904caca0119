//! pubsub-cli - command line front end for the resilient publish/subscribe client

use clap::{Parser, Subcommand};
use resilient_pubsub::config::ClientConfig;
use resilient_pubsub::observability::init_default_logging;
use resilient_pubsub::{ClientEvent, DeliveryMode, Payload, StreamingClient};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info};

/// Publish to and tail topics on a durable streaming broker
#[derive(Parser)]
#[command(name = "pubsub-cli")]
#[command(about = "Resilient publish/subscribe client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message; JSON payloads are sent as structured documents
    Publish {
        topic: String,
        payload: String,
    },
    /// Print every message delivered on a topic until Ctrl-C
    Tail {
        topic: String,
        /// Join the topic's shared queue group instead of receiving everything
        #[arg(long)]
        queue: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish { topic, payload } => publish(&config, &topic, &payload).await,
        Commands::Tail { topic, queue } => tail(&config, &topic, queue).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_configuration(path: Option<&PathBuf>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            let default_path = PathBuf::from("pubsub.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                return Ok(ClientConfig::load_from_file(&default_path)?);
            }
            let config = ClientConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Interpret CLI text as JSON when it parses, otherwise as a plain string
fn parse_payload(raw: &str) -> Payload {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => Payload::Structured(value),
        Err(_) => Payload::from(raw),
    }
}

async fn publish(
    config: &ClientConfig,
    topic: &str,
    raw: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = StreamingClient::mqtt(config);
    client.connected().await?;
    client.publish(topic, parse_payload(raw)).await?;
    info!(topic, "Published");
    client.close().await;
    Ok(())
}

async fn tail(
    config: &ClientConfig,
    topic: &str,
    queue: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = StreamingClient::mqtt(config);
    let mut events = client.events();

    let mode = if queue {
        DeliveryMode::SharedQueue
    } else {
        DeliveryMode::Exclusive
    };
    let mut messages = client.subscribe_channel(topic, mode).await?;

    loop {
        tokio::select! {
            Some(message) = messages.recv() => println!("{}", render(&message)),
            event = events.recv() => {
                if matches!(event, Ok(ClientEvent::End)) {
                    return Err("gave up reconnecting".into());
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, closing");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

fn render(message: &Payload) -> String {
    match message {
        Payload::Structured(value) => value.to_string(),
        Payload::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    println!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
