//! Link relay and peer binary.
//!
//! `link relay` runs the message relay. `link client` connects a peer to it,
//! answers `/echo` requests, and optionally sends periodic echo requests to
//! another peer.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use link_session::{PendingResponse, Relay, ResponseStatus, SessionManager, ConnectionState};
use link_wire::{status, PeerId, Request, Response};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::LinkConfig;
use logging::LinkLogFormatter;

/// Path the client answers by echoing the request content
const ECHO_PATH: &str = "/echo";

/// Wait between reconnect attempts after the relay connection fails
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Request/response messaging through a central relay
#[derive(Parser, Debug)]
#[command(name = "link", version, about = "Request/response messaging through a central relay")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "link.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay
    Relay {
        /// Listen port (defaults to the configured relay port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a peer connected to the relay
    Client {
        /// Relay address, e.g. 127.0.0.1:7373
        #[arg(long)]
        relay: Option<String>,

        /// Peer ID to send periodic echo requests to
        #[arg(long)]
        peer: Option<u16>,

        /// Echo request interval, e.g. 1s
        #[arg(long, default_value = "1s")]
        interval: humantime::Duration,

        /// Request timeout, e.g. 5s
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("link={}", args.log_level).parse()?)
        .add_directive(format!("link_session={}", args.log_level).parse()?)
        .add_directive(format!("link_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(LinkLogFormatter::new("link"))
        .init();

    info!("Starting link v{}", env!("CARGO_PKG_VERSION"));

    let mut config = LinkConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Relay { port } => {
            if let Some(port) = port {
                config.relay_port = port;
            }
            run_relay(&config).await
        }
        Command::Client {
            relay,
            peer,
            interval,
            timeout,
        } => {
            if let Some(relay) = relay {
                apply_relay_override(&mut config, &relay)?;
            }
            if let Some(timeout) = timeout {
                config.request_timeout = timeout.into();
            }
            run_client(&config, peer.map(PeerId), interval.into()).await
        }
    }
}

/// Apply a `host:port` relay address from the command line
fn apply_relay_override(config: &mut LinkConfig, relay: &str) -> Result<()> {
    let (host, port) = relay
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("relay address {:?} must be host:port", relay))?;
    config.relay_port = port
        .parse()
        .with_context(|| format!("invalid relay port in {:?}", relay))?;
    config.relay_host = host.to_string();
    Ok(())
}

async fn run_relay(config: &LinkConfig) -> Result<()> {
    let mut relay = Relay::bind(config.relay_config())?;
    component_info!("relay", "Relay ready on {}", relay.local_addr()?);

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => relay.update(),
            _ = &mut shutdown => break,
        }
    }

    component_info!(
        "relay",
        "Shutting down with {} peers connected ({} messages forwarded)",
        relay.client_count(),
        relay.stats().messages_forwarded
    );
    Ok(())
}

async fn run_client(config: &LinkConfig, peer: Option<PeerId>, interval: Duration) -> Result<()> {
    let mut manager = SessionManager::new(config.session_config()?);
    manager.register_path(ECHO_PATH);
    manager.connect_to_relay();

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last_tick = Instant::now();
    let mut since_send = Duration::ZERO;
    let mut retry_in = Duration::ZERO;
    let mut sequence = 0u64;
    let mut outstanding: Vec<(u64, PendingResponse)> = Vec::new();
    let mut was_connected = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }
        let now = Instant::now();
        let dt = now - last_tick;
        last_tick = now;

        manager.update(dt);

        match manager.state() {
            ConnectionState::Failed => {
                component_warn!(
                    "client",
                    "Relay connection failed, retrying in {:?}",
                    RECONNECT_DELAY
                );
                manager.reset();
                retry_in = RECONNECT_DELAY;
            }
            ConnectionState::Disconnected => {
                retry_in = retry_in.saturating_sub(dt);
                if retry_in.is_zero() {
                    manager.connect_to_relay();
                }
            }
            _ => {}
        }

        if manager.is_connected() != was_connected {
            was_connected = manager.is_connected();
            if was_connected {
                component_info!("client", "Connected to relay as peer {}", manager.local_id());
            }
        }

        answer_echo_requests(&mut manager);

        if let Some(peer) = peer {
            since_send += dt;
            if manager.is_connected() && since_send >= interval {
                since_send = Duration::ZERO;
                sequence += 1;
                let request = Request::new(
                    peer,
                    format!("{}/{}", ECHO_PATH, sequence),
                    format!("echo {}", sequence),
                );
                match manager.send_request_default(request) {
                    Ok(pending) => outstanding.push((sequence, pending)),
                    Err(e) => component_warn!("client", "Could not send echo {}: {}", sequence, e),
                }
            }
        }

        outstanding.retain(|(sequence, pending)| report_outcome(*sequence, pending));
    }

    let stats = manager.stats();
    component_info!(
        "client",
        "Shutting down: {} sent, {} answered, {} timed out",
        stats.requests_sent,
        stats.responses_obtained,
        stats.timeouts
    );
    Ok(())
}

fn answer_echo_requests(manager: &mut SessionManager) {
    for request in manager.drain_incoming(ECHO_PATH) {
        component_debug!(
            "client",
            "Echoing {} for peer {}",
            request.target,
            request.source()
        );
        let reply = Response::reply_to(&request, status::OK, request.content.clone());
        if let Err(e) = manager.send_response(reply) {
            component_warn!("client", "Could not answer {}: {}", request.target, e);
        }
    }
}

/// Log a finished echo request; returns whether it is still pending
fn report_outcome(sequence: u64, pending: &PendingResponse) -> bool {
    match pending.status() {
        ResponseStatus::Pending => true,
        ResponseStatus::Obtained => {
            if let Some(response) = pending.response() {
                component_info!(
                    "client",
                    "Echo {} answered by peer {}: {} {:?}",
                    sequence,
                    response.source(),
                    response.status_code(),
                    String::from_utf8_lossy(&response.content)
                );
            }
            false
        }
        ResponseStatus::TimedOut => {
            component_warn!(
                "client",
                "Echo {} to peer {} timed out",
                sequence,
                pending.expected_source()
            );
            false
        }
    }
}
