//! Bit flags carried on the wire or in the session configuration.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags of the base `Migrate` message.
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct MigrateFlags: u32 {
        /// Drain the transmit queue and send a flush mark first.
        const NEED_FLUSH = 1 << 0;
        /// Relay the next `MigrateData` message to the new server.
        const NEED_DATA_TRANSFER = 1 << 1;
    }
}

bitflags! {
    /// Which properties of the server certificate a TLS connection checks.
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct VerifyFlags: u32 {
        /// The certificate's public key must equal the configured key.
        const PUBKEY = 1 << 0;
        /// Chain to a trusted CA and match the host name.
        const HOSTNAME = 1 << 1;
        /// Chain to a trusted CA and match the configured subject.
        const SUBJECT = 1 << 2;
    }
}

impl Default for VerifyFlags {
    fn default() -> Self {
        VerifyFlags::HOSTNAME
    }
}
