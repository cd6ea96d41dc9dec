//! Session-level migration state.

/// Where a session is in a live server handoff.
///
/// ```text
///  None ──► Connecting ──► Migrating ──► None
///    │          │              │
///    │          └──── (error / cancel) ──► None
///    └──► Switching ──► None
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MigrationState {
    #[default]
    None,
    /// The shadow session is connecting to the destination.
    Connecting,
    /// Channels are being swapped onto the destination connections.
    Migrating,
    /// The main channel is reconnecting to a new host.
    Switching,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Switching => write!(f, "Switching"),
        }
    }
}
