//! Channel connection state machine.
//!
//! Provides a `ChannelState` enum that models the full lifecycle of one
//! channel connection, with validated transitions that return `Result`
//! instead of panicking.

use crate::error::SpiceError;

// ── ChannelState ─────────────────────────────────────────────────

/// The current state of a channel connection.
///
/// ```text
///  Unconnected ──► Connecting ──► [TlsHandshake] ──► LinkSent ──► LinkHeaderRecv
///       ▲                                                               │
///       │                                                               ▼
///       │          Ready ◄──────────── Authenticating ◄──────────── LinkMsgRecv
///       │        ▲   │   │
///       │        │   │   └──► MigrationHandshake ──► Migrating
///       │        │   ▼                                   │
///       │        └─ Migrating ◄──────────────────────────┘
///       │
///       └───────── Switching   (and from any state on fatal error)
/// ```
///
/// Variants are ordered so that "connecting or further" is
/// `state >= ChannelState::Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ChannelState {
    /// No transport. Initial and terminal state.
    #[default]
    Unconnected,

    /// The task was scheduled and is opening the transport.
    Connecting,

    /// Transport is up; TLS handshake in progress.
    TlsHandshake,

    /// Link header and message written.
    LinkSent,

    /// Peer's link header read and accepted.
    LinkHeaderRecv,

    /// Peer's link reply read; capabilities known.
    LinkMsgRecv,

    /// Ticket or SASL exchange in progress.
    Authenticating,

    /// Handshake complete; messages flow.
    Ready,

    /// A shadow channel is finishing a seamless migration handshake.
    MigrationHandshake,

    /// Parked while its live connection is swapped.
    Migrating,

    /// Being moved to another host.
    Switching,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unconnected => "Unconnected",
            Self::Connecting => "Connecting",
            Self::TlsHandshake => "TlsHandshake",
            Self::LinkSent => "LinkSent",
            Self::LinkHeaderRecv => "LinkHeaderRecv",
            Self::LinkMsgRecv => "LinkMsgRecv",
            Self::Authenticating => "Authenticating",
            Self::Ready => "Ready",
            Self::MigrationHandshake => "MigrationHandshake",
            Self::Migrating => "Migrating",
            Self::Switching => "Switching",
        };
        f.write_str(s)
    }
}

impl ChannelState {
    /// `true` between `Connecting` and `Authenticating` inclusive.
    pub fn is_handshaking(self) -> bool {
        self >= Self::Connecting && self < Self::Ready
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Returns `true` when a connection attempt is under way or done.
    pub fn is_connecting_or_further(self) -> bool {
        self >= Self::Connecting
    }

    /// Whether `self → next` is a legal step.
    pub fn can_transition(self, next: Self) -> bool {
        use ChannelState::*;
        match (self, next) {
            (_, Unconnected) | (_, Switching) => true,
            (Unconnected, Connecting) => true,
            (Connecting, TlsHandshake | LinkSent) => true,
            (TlsHandshake, LinkSent) => true,
            (LinkSent, LinkHeaderRecv) => true,
            (LinkHeaderRecv, LinkMsgRecv) => true,
            (LinkMsgRecv, Authenticating) => true,
            (Authenticating, Ready) => true,
            (Ready, MigrationHandshake | Migrating) => true,
            (MigrationHandshake, Migrating | Ready) => true,
            (Migrating, Ready) => true,
            (Switching, Connecting) => true,
            (a, b) => a == b,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Move to `next` if the step is legal.
    pub fn transition(&mut self, next: Self) -> Result<(), SpiceError> {
        if !self.can_transition(next) {
            return Err(SpiceError::ProtocolViolation(
                "illegal channel state transition",
            ));
        }
        *self = next;
        Ok(())
    }

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Unconnected`, `Switching`.
    pub fn begin_connect(&mut self) -> Result<(), SpiceError> {
        self.transition(Self::Connecting)
    }

    /// Force-reset to `Unconnected` regardless of current state.
    pub fn force_unconnected(&mut self) {
        *self = Self::Unconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────
