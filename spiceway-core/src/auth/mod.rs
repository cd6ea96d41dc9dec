//! Authentication mechanisms run at the end of the link handshake.

pub mod sasl;
pub mod ticket;

pub use sasl::{
    DefaultSaslProvider, PlainMechanism, SaslCredentials, SaslMechanism, SaslProvider, SaslStep,
    SecurityLayer,
};
pub use ticket::encrypt_ticket;
