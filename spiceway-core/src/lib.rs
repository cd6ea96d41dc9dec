//! # spiceway-core
//!
//! Channel protocol engine for SPICE remote-display clients.
//!
//! This crate contains:
//! - **Wire format**: link handshake records, data headers and `MessageCodec`
//!   for framed I/O via `tokio_util`
//! - **Channels**: per-channel tasks, handshake, base protocol and the main
//!   channel (`Channel`, `ChannelKind`, `MainKind`)
//! - **Session**: channel registry, configuration, events and migration
//! - **Network**: TCP / TLS / Unix transports and SASL security layers
//! - **Auth**: RSA-OAEP ticket encryption and SASL mechanisms
//! - **Task**: `MainContext`, the serialised event context shared by a session
//! - **Error**: `SpiceError`, a `thiserror`-based error hierarchy

pub mod auth;
pub mod caps;
pub mod channel;
pub mod codec;
pub mod error;
pub mod event;
pub mod flags;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod state;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────

pub use auth::{DefaultSaslProvider, SaslCredentials, SaslMechanism, SaslProvider};
pub use caps::{CapabilityFilter, CapabilitySet, ChannelCaps};
pub use channel::{Channel, ChannelContext, ChannelId, ChannelKind, GenericKind, MainKind};
pub use codec::MessageCodec;
pub use error::SpiceError;
pub use event::{ChannelEvent, SessionEvent};
pub use flags::{MigrateFlags, VerifyFlags};
pub use header::{DataHeader, HeaderMode, LinkHeader, LinkMess, LinkReply};
pub use message::ChannelType;
pub use network::{BoxedStream, TlsSettings, boxed};
pub use packet::{IncomingMessage, MAX_MESSAGE_SIZE, OutgoingMessage};
pub use session::{PayloadSink, ServerInfo, Session, SessionBuilder, SessionConfig};
pub use state::{ChannelState, MigrationState};
pub use task::{MainContext, WaitCanceller};
