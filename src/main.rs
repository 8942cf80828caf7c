//! brokerlink command-line tool
//!
//! Connects to the configured broker to listen on or publish to topics, or
//! validates a configuration file.

use brokerlink::observability::{init_default_logging, init_logging, LogFormat};
use brokerlink::{BrokerClient, ClientConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: &[&str] = &["brokerlink.toml", "config/brokerlink.toml"];

/// Resilient publish/subscribe broker client
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Resilient publish/subscribe broker client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to topics and log inbound messages until Ctrl-C
    Listen {
        /// Topic filter to subscribe to (repeatable)
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
    },
    /// Publish a payload and exit
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        payload: String,
        /// Number of copies to send
        #[arg(long, default_value_t = 1)]
        count: u32,
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

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { topics } => listen(&config, topics).await,
        Commands::Publish {
            topic,
            payload,
            count,
        } => publish(&config, &topic, payload, count).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(ClientConfig::default())
}

async fn listen(config: &ClientConfig, topics: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let client = BrokerClient::from_config(config)?;

    client.on_status_change(|event| {
        info!(state = ?event.state, reason = ?event.reason, "Status changed");
    });

    for topic in &topics {
        client
            .subscribe(topic, |message| match message.payload_str() {
                Some(text) => info!(topic = %message.topic(), payload = %text, "Message received"),
                None => info!(
                    topic = %message.topic(),
                    bytes = message.payload().len(),
                    "Binary message received"
                ),
            })
            .await?;
    }

    client.connect().await?;
    info!("Listening on {} topic filter(s), press Ctrl-C to stop", topics.len());

    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to wait for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    client.shutdown().await;
    Ok(())
}

async fn publish(
    config: &ClientConfig,
    topic: &str,
    payload: String,
    count: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = BrokerClient::from_config(config)?;
    client.connect().await?;

    let payload = bytes::Bytes::from(payload);
    let mut result = Ok(());
    for _ in 0..count {
        if let Err(e) = client.publish(topic, payload.clone()).await {
            result = Err(e);
            break;
        }
    }

    client.shutdown().await;
    result?;
    info!("Published {} message(s) to {}", count, topic);
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
