//! # spiceway-client
//!
//! Command-line SPICE client. Connects a `spiceway-core` session to a
//! server and logs session and channel events until interrupted.

pub mod config;
