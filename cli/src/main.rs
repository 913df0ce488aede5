// tangle-cli — command-line client for tangle relays
//
// Tail live queries, publish pre-signed events, and inspect relay
// connectivity from a terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::time::Duration;
use tangle_core::{
    CacheUsage, Client, ClientConfig, Event, Filter, RelayUrl, SubscriptionOptions,
    SubscriptionUpdate,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tangle")]
#[command(about = "Tangle — relay network client", long_about = None)]
#[command(version)]
struct Cli {
    /// Relay URLs (repeatable)
    #[arg(short, long = "relay", global = true)]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a query and print matching events as JSON lines
    Tail {
        /// Event kinds to match (repeatable)
        #[arg(short, long = "kind")]
        kinds: Vec<u32>,
        /// Author public keys to match (repeatable)
        #[arg(short, long = "author")]
        authors: Vec<String>,
        /// Stop after the stored backlog instead of following live
        #[arg(long)]
        backlog_only: bool,
    },
    /// Publish a pre-signed event (JSON argument, or stdin with "-")
    Publish {
        event: String,
        /// Fail unless at least this many relays acknowledge
        #[arg(long, default_value_t = 1)]
        required: usize,
    },
    /// Connect and print per-relay connectivity
    Status,
}

fn parse_relays(raw: &[String]) -> Result<Vec<RelayUrl>> {
    raw.iter()
        .map(|r| RelayUrl::parse(r).with_context(|| format!("invalid relay URL: {r}")))
        .collect()
}

async fn build_client(relays: Vec<RelayUrl>) -> Result<Client> {
    anyhow::ensure!(!relays.is_empty(), "at least one --relay is required");
    let config = ClientConfig {
        explicit_relays: relays,
        connect_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let client = Client::builder().config(config).build();
    client.connect().await;
    let stats = client.pool_stats();
    info!(connected = stats.connected, total = stats.total, "pool connected");
    Ok(client)
}

async fn run_tail(
    client: &Client,
    kinds: Vec<u32>,
    authors: Vec<String>,
    backlog_only: bool,
) -> Result<()> {
    let mut filter = Filter::new();
    if !kinds.is_empty() {
        filter = filter.kinds(kinds);
    }
    if !authors.is_empty() {
        filter = filter.authors(authors);
    }

    let mut handle = client.subscribe(
        vec![filter],
        SubscriptionOptions {
            groupable: false,
            close_on_eose: backlog_only,
            cache_usage: CacheUsage::RelayOnly,
            ..SubscriptionOptions::default()
        },
    );

    loop {
        tokio::select! {
            update = handle.recv() => match update {
                Some(SubscriptionUpdate::Event { event, relay }) => {
                    let line = serde_json::to_string(&event)?;
                    match relay {
                        Some(relay) => println!("{line} # {relay}"),
                        None => println!("{line}"),
                    }
                }
                Some(SubscriptionUpdate::Eose) => eprintln!("-- end of stored events --"),
                Some(SubscriptionUpdate::Closed { message }) => {
                    eprintln!("-- closed: {message} --");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                handle.stop();
                break;
            }
        }
    }
    Ok(())
}

async fn run_publish(client: &Client, raw: String, required: usize) -> Result<()> {
    let raw = if raw == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading event from stdin")?;
        buffer
    } else {
        raw
    };
    let event: Event = serde_json::from_str(&raw).context("parsing event JSON")?;

    let relays = client.pool().urls();
    match client.publish_to(&event, &relays, required).await {
        Ok(report) => {
            println!("accepted by {} of {} relays", report.ack_count(), relays.len());
            for (relay, reason) in &report.failed {
                eprintln!("  {relay}: {reason}");
            }
            Ok(())
        }
        Err(e) => {
            if let tangle_core::PublishError::RequiredAcksNotMet { report } = &e {
                for (relay, reason) in &report.failed {
                    eprintln!("  {relay}: {reason}");
                }
            }
            Err(e.into())
        }
    }
}

async fn run_status(client: &Client) -> Result<()> {
    for relay in client.pool().all_relays() {
        let stats = relay.connection_stats();
        println!(
            "{}  {:?}  attempts={} successes={}",
            relay.url(),
            relay.status(),
            stats.attempts,
            stats.successes
        );
        if let Ok(info) = relay.ensure_info().await {
            let name = info.name.as_deref().unwrap_or("?");
            println!("    {name}  auth_required={}", info.requires_auth());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let relays = parse_relays(&cli.relays)?;
    let client = build_client(relays).await?;

    match cli.command {
        Commands::Tail {
            kinds,
            authors,
            backlog_only,
        } => run_tail(&client, kinds, authors, backlog_only).await,
        Commands::Publish { event, required } => run_publish(&client, event, required).await,
        Commands::Status => run_status(&client).await,
    }
}
