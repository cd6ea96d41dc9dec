pub mod channel;
pub mod migration;

pub use channel::ChannelState;
pub use migration::MigrationState;
