//! # PeerTalk Chat Demo
//!
//! A minimal interactive driver for [`peertalk::Context`]: finds other
//! instances on the LAN via discovery, connects to an explicit peer if one
//! is given on the command line, and broadcasts a message to everyone it is
//! connected to. Demonstrates the single-threaded poll-loop usage pattern
//! spec.md §6.4 describes — there is no background thread here, `main`
//! itself is the poll loop.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use peertalk::{Config, Context, PeerState, Priority};
use tracing::{error, info};

/// Join a PeerTalk LAN, announce yourself, and optionally broadcast a message.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name this instance announces itself under.
    #[arg(short, long, default_value = "peertalk-chat")]
    name: String,

    /// TCP port to listen on for peer connections.
    #[arg(long, default_value_t = peertalk::config::DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// UDP port used for the discovery protocol.
    #[arg(long, default_value_t = peertalk::config::DEFAULT_UDP_PORT)]
    udp_port: u16,

    /// Port discovery broadcasts are sent/received on.
    #[arg(long, default_value_t = peertalk::config::DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Skip discovery entirely and only use explicit --connect addresses.
    #[arg(long)]
    no_discovery: bool,

    /// Connect directly to a peer at this address (host:port) instead of, or
    /// in addition to, waiting for discovery.
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Message to broadcast to all connected peers once at least one is
    /// connected. Runs forever listening if omitted.
    #[arg(short, long)]
    message: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all logging below warnings.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.quiet {
        tracing::Level::WARN
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    peertalk::logging::init_tracing(level);

    if let Err(e) = run(args) {
        error!("peertalk-chat exited with error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> peertalk::Result<()> {
    let config = Config {
        local_name: args.name.clone(),
        tcp_port: args.tcp_port,
        udp_port: args.udp_port,
        discovery_port: args.discovery_port,
        ..Config::default()
    }
    .validated()?;

    let mut ctx = Context::init(config)?;

    let mut callbacks = peertalk::Callbacks::default();
    callbacks.on_discovered = Some(Box::new(|id, name| {
        info!("discovered peer {} ({name})", id.0);
    }));
    callbacks.on_connected = Some(Box::new(|id| {
        info!("peer {} connected", id.0);
    }));
    callbacks.on_disconnected = Some(Box::new(|id, err| {
        info!("peer {} disconnected: {err}", id.0);
    }));
    callbacks.on_lost = Some(Box::new(|id| {
        info!("peer {} lost (no longer seen)", id.0);
    }));
    callbacks.on_message_received = Some(Box::new(|id, data| {
        info!("[{}] {}", id.0, String::from_utf8_lossy(data));
    }));
    ctx.set_callbacks(callbacks)?;

    if !args.no_discovery {
        ctx.start_discovery()?;
    }
    ctx.start_listening()?;

    if let Some(addr) = args.connect {
        match ctx.connect(addr, &args.name) {
            Ok(id) => info!("connecting to {addr} as peer {}", id.0),
            Err(e) => error!("failed to connect to {addr}: {e}"),
        }
    }

    info!("peertalk-chat running as \"{}\" on tcp/{} udp/{}", args.name, args.tcp_port, args.udp_port);

    let mut sent = args.message.is_none();
    loop {
        ctx.poll(Duration::from_millis(100))?;

        if !sent {
            let connected = ctx
                .get_peers()
                .into_iter()
                .filter(|p| p.state == PeerState::Connected)
                .count();
            if connected > 0 {
                if let Some(message) = &args.message {
                    ctx.broadcast(message.as_bytes(), Priority::Normal)?;
                    info!("broadcast sent to {connected} peer(s)");
                }
                sent = true;
            }
        }
    }
}
