//! spiceway-client: entry point.
//!
//! ```text
//! spiceway-client                       Connect with spiceway.toml
//! spiceway-client --config <path>       Use a custom config TOML
//! spiceway-client --host h --port 5900  Override the endpoint
//! spiceway-client --gen-config          Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use spiceway_core::{ChannelEvent, Session, SessionEvent};
use spiceway_client::config::ClientConfig;

/// Payload messages buffered between channel tasks and the logger.
const PAYLOAD_BUFFER: usize = 64;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "spiceway-client", about = "SPICE remote display client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "spiceway.toml")]
    config: PathBuf,

    /// Server host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Plain TCP port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS port (overrides config).
    #[arg(long)]
    tls_port: Option<u16>,

    /// Ticket password (overrides config).
    #[arg(long)]
    password: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(self, config: &mut ClientConfig) {
        let session = &mut config.session;
        if let Some(host) = self.host {
            session.host = host;
        }
        if self.port.is_some() {
            session.port = self.port;
        }
        if self.tls_port.is_some() {
            session.tls_port = self.tls_port;
        }
        if self.password.is_some() {
            session.password = self.password;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    cli.apply(&mut config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("spiceway-client v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Build the session ────────────────────────────────────

    let (payload_tx, mut payload_rx) = mpsc::channel(PAYLOAD_BUFFER);
    let session = Session::builder(config.session)
        .payload_sink(payload_tx)
        .build();
    let mut events = session.subscribe();

    // ── 2. Connect ──────────────────────────────────────────────

    let main_channel = session.connect()?;
    info!(host = %session.host(), channel = %main_channel.name(), "connecting");

    // ── 3. Event loop ───────────────────────────────────────────

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !log_event(&event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {n} session events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some((id, msg)) = payload_rx.recv() => {
                debug!(
                    channel = ?id,
                    msg_type = msg.msg_type(),
                    size = msg.size(),
                    "payload"
                );
            }
        }
    }

    // ── 4. Shutdown ─────────────────────────────────────────────

    info!("shutting down");
    session.disconnect();
    Ok(())
}

/// Log one session event. Returns `false` once the session is unusable.
fn log_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::ChannelNew(id) => debug!(channel = ?id, "channel created"),
        SessionEvent::ChannelDestroy(id) => debug!(channel = ?id, "channel destroyed"),
        SessionEvent::Channel { id, event } if event.is_error() => {
            error!(channel = ?id, %event, "channel failed");
            if id.channel_type == spiceway_core::ChannelType::Main {
                return false;
            }
        }
        SessionEvent::Channel { id, event: ChannelEvent::Closed } => {
            info!(channel = ?id, "channel closed");
            if id.channel_type == spiceway_core::ChannelType::Main {
                return false;
            }
        }
        SessionEvent::Channel { id, event } => info!(channel = ?id, %event, "channel event"),
        SessionEvent::MigrationState(state) => info!(?state, "migration state"),
        SessionEvent::MigrationStarted => info!("migration started"),
        SessionEvent::OpenFdRequested { id, tls } => {
            warn!(channel = ?id, tls, "server requested a caller-provided socket");
        }
    }
    true
}
