//! peermq CLI
//!
//! Thin wrapper around peermq-core for command-line usage over iroh.
//!
//! ## Usage
//!
//! ```bash
//! # Show this node's mailbox address and endpoint id
//! peermq id
//!
//! # Authorize a correspondent
//! peermq peers add <hex>
//!
//! # Tell this node how to reach a mailbox
//! peermq route <mailbox-hex> <endpoint-hex> --addr 192.168.1.20:4433
//!
//! # Send a message and wait until the recipient fetched it
//! peermq send --to <hex> "hello"
//!
//! # Serve inbound sessions and print unread messages as they arrive
//! peermq listen
//!
//! # Inspect and consume received messages
//! peermq read unread
//! peermq archive <from-hex> <seq>
//! peermq clear <from-hex> <seq>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use peermq_core::transport::{Incoming, RawStream};
use peermq_core::{
    AddressBook, IrohTransport, Mailbox, MailboxConfig, MqError, MqResult, PeerId, ReadOptions,
    Route, SessionEvent, Transport,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// File in the data directory holding the address book
const ROUTES_FILE: &str = "routes.json";

/// peermq - peer-to-peer mailboxes
#[derive(Parser)]
#[command(name = "peermq")]
#[command(version = "0.1.0")]
#[command(about = "peermq - peer-to-peer mailboxes over replicated logs")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.peermq/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mailbox address and transport endpoint id
    Id,

    /// Authorized peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Append a message to the send-log for a peer
    Send {
        /// Recipient mailbox address (hex)
        #[arg(long)]
        to: String,
        /// Message text
        message: String,
        /// Seconds to keep replicating while waiting for the recipient
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Serve inbound sessions and print unread messages as they arrive
    Listen,

    /// Print locally stored messages through a view
    Read {
        /// unread, archive or read
        #[arg(default_value = "unread")]
        view: String,
    },

    /// Mark a message read and archived
    Archive {
        /// Author mailbox address (hex)
        from: String,
        seq: u64,
    },

    /// Delete a message and reclaim its storage
    Clear {
        /// Author mailbox address (hex)
        from: String,
        seq: u64,
    },

    /// Store how to reach a mailbox
    Route {
        /// Mailbox address (hex)
        mailbox: String,
        /// iroh endpoint id of that node (hex)
        endpoint: String,
        /// Relay URL
        #[arg(long)]
        relay: Option<String>,
        /// Direct socket address, may be repeated
        #[arg(long = "addr")]
        addrs: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// Authorize peers
    Add {
        /// Mailbox addresses (hex)
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Revoke peers
    Remove {
        /// Mailbox addresses (hex)
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List authorized peers
    List,
}

/// Transport bound once the mailbox identity is known.
///
/// The iroh endpoint key is the mailbox transport key, which only exists
/// after the mailbox has been opened.
#[derive(Default)]
struct DeferredTransport {
    inner: OnceCell<Arc<IrohTransport>>,
}

impl DeferredTransport {
    fn bound(&self) -> MqResult<&Arc<IrohTransport>> {
        self.inner
            .get()
            .ok_or_else(|| MqError::Network("transport not bound".into()))
    }

    async fn bind(&self, secret: [u8; 32], book: AddressBook) -> MqResult<Arc<IrohTransport>> {
        self.inner
            .get_or_try_init(|| async move { IrohTransport::bind(secret, book).await.map(Arc::new) })
            .await
            .cloned()
    }
}

impl Transport for DeferredTransport {
    fn listen(&self, id: PeerId) -> BoxFuture<'_, MqResult<Incoming>> {
        async move { self.bound()?.listen(id).await }.boxed()
    }

    fn connect(&self, id: PeerId) -> BoxFuture<'_, MqResult<RawStream>> {
        async move { self.bound()?.connect(id).await }.boxed()
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.peermq/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peermq")
        .join("data")
}

/// Parse a mailbox address from hex
fn parse_peer(s: &str) -> Result<PeerId> {
    PeerId::from_key(s.as_bytes()).with_context(|| format!("Invalid mailbox address '{}'", s))
}

fn routes_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ROUTES_FILE)
}

/// Bind the iroh endpoint with the mailbox transport key.
async fn bring_online(
    mailbox: &Mailbox,
    transport: &DeferredTransport,
) -> Result<Arc<IrohTransport>> {
    let keys = mailbox.key_pairs().await?;
    let book = AddressBook::load(routes_path(mailbox.data_dir()))?;
    let iroh = transport.bind(keys.transport.secret_bytes(), book).await?;
    info!(endpoint_id = %iroh.endpoint_id(), "Transport online");
    Ok(iroh)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let transport = Arc::new(DeferredTransport::default());
    let mailbox = Mailbox::open(MailboxConfig::new(&data_dir), transport.clone()).await?;
    debug!(data_dir = %data_dir.display(), "Mailbox opened");

    match cli.command {
        Commands::Id => {
            let keys = mailbox.key_pairs().await?;
            println!("Mailbox: {}", keys.public_key().to_hex());
            println!("Endpoint: {}", keys.transport.public_key().to_hex());
        }

        Commands::Peers { action } => match action {
            PeersAction::Add { keys } => {
                let peers = keys.iter().map(|k| parse_peer(k)).collect::<Result<Vec<_>>>()?;
                mailbox.add_peers(&peers).await?;
                for peer in &peers {
                    println!("Added {}", peer.to_hex());
                }
            }
            PeersAction::Remove { keys } => {
                let peers = keys.iter().map(|k| parse_peer(k)).collect::<Result<Vec<_>>>()?;
                mailbox.remove_peers(&peers).await?;
                for peer in &peers {
                    println!("Removed {}", peer.to_hex());
                }
            }
            PeersAction::List => {
                let peers = mailbox.list_peers().await?;
                if peers.is_empty() {
                    println!("No authorized peers.");
                } else {
                    println!("Authorized peers ({}):", peers.len());
                    for peer in peers {
                        println!("  {}", peer.to_hex());
                    }
                }
            }
        },

        Commands::Send {
            to,
            message,
            timeout,
        } => {
            let to = parse_peer(&to)?;
            bring_online(&mailbox, &transport).await?;

            let session = mailbox.session_for(to)?;
            let mut events = session.events();
            let seq = mailbox.send(to, message.as_bytes()).await?;
            println!("Sent {}@{}", to.short(), seq);

            let acked = tokio::time::timeout(Duration::from_secs(timeout), async {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::Ack { seq: acked }) if acked == seq => return Ok(()),
                        Ok(SessionEvent::Error(e)) => debug!(error = %e, "Session error"),
                        Ok(SessionEvent::Closed) => {
                            return Err(anyhow::anyhow!("Session ended: {:?}", session.status()))
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return Err(anyhow::anyhow!("Session closed"))
                        }
                    }
                }
            })
            .await;

            match acked {
                Ok(result) => {
                    result?;
                    println!("Delivered.");
                }
                Err(_) => println!("Not yet fetched; the message stays queued in the send log."),
            }
        }

        Commands::Listen => {
            let iroh = bring_online(&mailbox, &transport).await?;
            mailbox.listen().await?;

            let route = iroh.local_route();
            println!("Mailbox: {}", mailbox.id().await?.to_hex());
            println!("Endpoint: {}", route.endpoint);
            for addr in &route.addrs {
                println!("  Addr: {}", addr);
            }
            println!();
            println!("Listening. Press Ctrl+C to stop.");
            println!();

            let mut unread = mailbox.create_read_stream("unread", ReadOptions::live());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    item = unread.next() => match item {
                        Some(Ok(msg)) => {
                            println!("{}@{} {}", msg.from.to_hex(), msg.seq, String::from_utf8_lossy(&msg.data));
                            mailbox.mark_read(msg.from, msg.seq).await?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
            }

            mailbox.close();
            iroh.shutdown().await;
        }

        Commands::Read { view } => {
            let mut stream = mailbox.create_read_stream(&view, ReadOptions::default());
            let mut count = 0usize;
            while let Some(item) = stream.next().await {
                let msg = item?;
                println!("{}@{} {}", msg.from.to_hex(), msg.seq, String::from_utf8_lossy(&msg.data));
                count += 1;
            }
            if count == 0 {
                println!("No messages.");
            }
        }

        Commands::Archive { from, seq } => {
            let from = parse_peer(&from)?;
            mailbox.archive(from, seq).await?;
            println!("Archived {}@{}", from.short(), seq);
        }

        Commands::Clear { from, seq } => {
            let from = parse_peer(&from)?;
            mailbox.clear(from, seq).await?;
            println!("Cleared {}@{}", from.short(), seq);
        }

        Commands::Route {
            mailbox: target,
            endpoint,
            relay,
            addrs,
        } => {
            let target = parse_peer(&target)?;
            let mut route = Route::new(endpoint);
            if let Some(relay) = relay {
                route = route.with_relay(relay);
            }
            for addr in addrs {
                route = route.with_addr(addr);
            }

            let path = routes_path(mailbox.data_dir());
            let mut book = AddressBook::load(&path)?;
            book.insert(target, route)?;
            book.save(&path)?;
            println!("Route saved for {} ({} total)", target.short(), book.len());
        }
    }

    Ok(())
}
