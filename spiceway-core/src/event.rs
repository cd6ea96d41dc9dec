//! Notifications a session publishes to its owner.

use std::fmt;

use crate::channel::ChannelId;
use crate::state::MigrationState;

// ── ChannelEvent ─────────────────────────────────────────────────

/// Lifecycle notification for a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// Disconnect without a reported reason.
    None,
    /// Handshake finished; the channel is `Ready`.
    Opened,
    /// The channel is being moved to another host.
    Switching,
    /// A `Ready` channel was closed cleanly.
    Closed,
    ErrorConnect,
    ErrorTls,
    ErrorLink,
    ErrorAuth,
    ErrorIo,
}

impl ChannelEvent {
    /// `true` for the `Error*` variants.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ChannelEvent::ErrorConnect
                | ChannelEvent::ErrorTls
                | ChannelEvent::ErrorLink
                | ChannelEvent::ErrorAuth
                | ChannelEvent::ErrorIo
        )
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelEvent::None => "none",
            ChannelEvent::Opened => "opened",
            ChannelEvent::Switching => "switching",
            ChannelEvent::Closed => "closed",
            ChannelEvent::ErrorConnect => "error-connect",
            ChannelEvent::ErrorTls => "error-tls",
            ChannelEvent::ErrorLink => "error-link",
            ChannelEvent::ErrorAuth => "error-auth",
            ChannelEvent::ErrorIo => "error-io",
        };
        f.write_str(s)
    }
}

// ── SessionEvent ─────────────────────────────────────────────────

/// Everything a session broadcasts to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A channel was created and registered.
    ChannelNew(ChannelId),
    /// A channel was removed from the session.
    ChannelDestroy(ChannelId),
    /// A channel reported a lifecycle change.
    Channel { id: ChannelId, event: ChannelEvent },
    /// The session's migration state changed.
    MigrationState(MigrationState),
    /// A shadow session was created for a migration.
    MigrationStarted,
    /// Client-provided sockets are in use and this channel needs one.
    OpenFdRequested { id: ChannelId, tls: bool },
}
