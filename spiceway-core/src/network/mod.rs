//! Transport layers under a channel: raw socket, TLS and SASL protection.

pub mod connection;
pub mod der;
pub mod sasl_stream;
pub mod stream;
pub mod tls;

pub use connection::{CONNECT_TIMEOUT, Endpoint, open};
pub use sasl_stream::SaslStream;
pub use stream::{AsyncStream, BoxedStream, boxed};
pub use tls::{SpiceCertVerifier, TlsSettings, client_config, load_ca_file};
