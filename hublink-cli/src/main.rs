//! hublink-cli - Command-line client for hublink
//!
//! Negotiates a connection, runs one command against the hub and prints the
//! outcome.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use hublink_connection::{ConnectionOptions, HubClient};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hublink-cli")]
#[command(about = "Command-line client for hublink hub servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "HUBLINK_SERVER", default_value = "127.0.0.1:7411")]
    server: SocketAddr,

    /// Payload protocol to negotiate (json or cbor)
    #[arg(short, long, env = "HUBLINK_PROTOCOL", default_value = "json")]
    protocol: String,

    /// Seconds to wait for a reply
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a target and print its result
    Invoke {
        /// Target name
        target: String,

        /// Arguments, each inline JSON or @file.json
        args: Vec<String>,
    },

    /// Invoke a streaming target and print every item
    Stream {
        /// Target name
        target: String,

        /// Arguments, each inline JSON or @file.json
        args: Vec<String>,
    },

    /// Invoke a target without waiting for a reply
    Send {
        /// Target name
        target: String,

        /// Arguments, each inline JSON or @file.json
        args: Vec<String>,
    },

    /// Send a ping
    Ping,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let options = ConnectionOptions::new()
        .with_protocol(&cli.protocol)
        .with_request_timeout(Duration::from_secs(cli.timeout));

    let client = HubClient::connect(cli.server, options)
        .await
        .map_err(|e| {
            eprintln!("{}: {}", "Connection failed".red(), e);
            e
        })?;

    match commands::execute(&client, cli.command).await {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            let _ = client.close().await;
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
