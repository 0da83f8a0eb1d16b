//! chatrelay command-line entry point.
//!
//! `chatrelay serve` runs a relay and prints its display events;
//! `chatrelay chat` joins a relay as an interactive client.

use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chatrelay::constants::ENV_LOG_FILE;
use chatrelay::{ConfigLayer, RelayConfig, RelayEvent, RelayServer, Session, SessionEvent};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Version from Cargo.toml.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(version = VERSION)]
#[command(about = "Real-time TCP chat relay with slot-based admission")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Connection settings shared by both commands.
#[derive(clap::Args)]
struct ConnectArgs {
    /// Config file (two-line `host`/`port` text, or `.json`)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Host override
    #[arg(long)]
    host: Option<String>,
    /// Port override
    #[arg(long, short)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        #[command(flatten)]
        connect: ConnectArgs,
        /// Number of routing slots (concurrent users)
        #[arg(long)]
        slots: Option<usize>,
        /// Seconds a new connection may take to identify
        #[arg(long)]
        handshake_timeout: Option<u64>,
        /// Only display messages, do not forward them to other clients
        #[arg(long)]
        no_forward: bool,
        /// Print the effective configuration as JSON and exit
        #[arg(long)]
        print_config: bool,
    },
    /// Join a relay as a chat client
    Chat {
        #[command(flatten)]
        connect: ConnectArgs,
        /// Display name
        #[arg(long, short)]
        name: String,
    },
}

impl ConnectArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            host: self.host.clone(),
            port: self.port,
            ..ConfigLayer::default()
        }
    }
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var(ENV_LOG_FILE) {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            connect,
            slots,
            handshake_timeout,
            no_forward,
            print_config,
        } => {
            let cli_layer = ConfigLayer {
                slots,
                handshake_timeout_secs: handshake_timeout,
                forward_to_peers: no_forward.then_some(false),
                ..connect.layer()
            };
            let config = RelayConfig::load(connect.config.as_deref(), cli_layer)?;
            if print_config {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            run_serve(&config).await
        }
        Commands::Chat { connect, name } => {
            let config = RelayConfig::load(connect.config.as_deref(), connect.layer())?;
            run_chat(&config, &name).await
        }
    }
}

async fn run_serve(config: &RelayConfig) -> Result<()> {
    let (relay, mut events) = RelayServer::start(config).await?;
    println!("Relay listening on {}", relay.local_addr());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            Some(event) = events.recv() => print_relay_event(&event),
        }
    }

    relay.shutdown();
    let count = relay.join().await;
    while let Ok(event) = events.try_recv() {
        print_relay_event(&event);
    }
    println!("Relay stopped. Messages delivered: {count}");
    Ok(())
}

fn print_relay_event(event: &RelayEvent) {
    match event {
        RelayEvent::Text { message, slot } => println!("[slot {slot}] {message}"),
        RelayEvent::Presence { users } => println!("Online: {}", users.join(", ")),
    }
}

async fn run_chat(config: &RelayConfig, name: &str) -> Result<()> {
    let mut session = Session::connect(&config.address()).await?;
    let mut incoming = session.spawn_receiver()?;
    session.identify(name).await?;
    println!("Connected to {} as {name}. Type /quit to leave.", session.peer_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.is_empty() => {}
                Some(line) => session.send_message(&line).await?,
                None => break,
            },
            event = incoming.recv() => match event {
                Some(SessionEvent::Message { name, body }) => println!("{name}: {body}"),
                Some(SessionEvent::Closed) | None => {
                    println!("Relay closed the connection.");
                    return Ok(());
                }
            },
        }
    }

    session.go_offline().await?;
    println!("Offline.");
    Ok(())
}
