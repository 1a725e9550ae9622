// rendezvous — discovery and relay server plus a minimal swarm client
//
// `serve` runs the websocket server; `join` announces topics and pipes
// stdin/stdout through every relay connection it is handed.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rendezvous_core::{CloudSwarm, RelayConnection, RendezvousService};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "rendezvous")]
#[command(about = "Rendezvous — channel discovery and socket relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/rendezvous/config.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Serve {
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
        #[arg(long)]
        host: Option<IpAddr>,
    },
    /// Join topics and relay stdin/stdout with every paired peer
    Join {
        /// Root websocket URL, e.g. ws://localhost:8080
        #[arg(short, long)]
        url: Option<String>,
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(config, port, host).await,
        Commands::Join { url, topics } => cmd_join(config, url, topics).await,
        Commands::Config { action } => cmd_config(config, cli.config.as_deref(), action),
    }
}

async fn cmd_serve(config: config::Config, port: Option<u16>, host: Option<IpAddr>) -> Result<()> {
    let mut server_config = config.server_config();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(host) = host {
        server_config.host = host;
    }

    let service = RendezvousService::new(&server_config);
    let (addr, server) = service
        .bind(server_config.listen_addr())
        .context("Failed to start server")?;

    eprintln!("{} ws://{}", "Rendezvous server listening on".bold(), addr.to_string().bright_cyan());
    eprintln!("  discovery: {}", format!("ws://{}/discovery", addr).bright_green());
    eprintln!("  relay:     {}", format!("ws://{}/connect/<id>", addr).bright_green());

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => {
            let rendezvous = service.rendezvous_stats();
            let broker = service.broker_stats();
            eprintln!();
            eprintln!("{}", "Shutting down".bold());
            eprintln!("  pairings sent:  {}", rendezvous.pairings_sent);
            eprintln!("  tunnels opened: {}", broker.tunnels_opened);
            eprintln!("  evicted relays: {}", broker.evicted);
            eprintln!("  hung-up relays: {}", broker.abandoned);
        }
    }
    Ok(())
}

async fn cmd_join(config: config::Config, url: Option<String>, topics: Vec<String>) -> Result<()> {
    let mut client_config = config.client_config();
    if let Some(url) = url {
        client_config.url = url;
    }

    let (swarm, mut connections) = CloudSwarm::new(client_config.clone())
        .with_context(|| format!("Cannot use server {}", client_config.url))?;
    for topic in &topics {
        let channel = swarm.join(topic.as_bytes());
        eprintln!("  {} {} ({})", "✓".green(), topic, channel.to_string().bright_yellow());
    }

    tracing::info!("Joined {} topic(s) via {}", topics.len(), client_config.url);

    let (lines_tx, _) = broadcast::channel::<String>(256);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(conn) = connections.recv() => {
                spawn_relay_session(conn, lines_tx.subscribe());
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let _ = lines_tx.send(line);
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    eprintln!("{}", "Leaving swarm".bold());
    swarm.destroy().await;
    Ok(())
}

/// Print what the peer sends; forward stdin lines to it
fn spawn_relay_session(conn: RelayConnection, mut lines: broadcast::Receiver<String>) {
    let RelayConnection { stream, details } = conn;
    let peer = details.connect_id.to_string();
    let role = if details.is_client { "client" } else { "server" };
    eprintln!("{} {} as {}", "Connected".green(), peer.bright_cyan(), role);

    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut incoming = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                line = incoming.next_line() => match line {
                    Ok(Some(line)) => println!("[{}] {}", peer, line),
                    Ok(None) | Err(_) => break,
                },
                outgoing = lines.recv() => match outgoing {
                    Ok(line) => {
                        if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Relay session {} ended", peer);
        eprintln!("{} {}", "Disconnected".yellow(), peer);
    });
}

fn cmd_config(
    mut config: config::Config,
    path: Option<&std::path::Path>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            let file = config.save(path)?;
            println!("{} {} = {} ({})", "✓".green(), key, value, file.display());
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
