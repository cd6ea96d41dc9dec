//! Channel kinds and their message handler tables.
//!
//! A [`ChannelKind`] describes one type of channel: which messages it
//! handles, which capabilities it advertises and what it does once the
//! link is up. Kinds are shared by every channel of their type, so all
//! per-connection state lives in the [`ChannelContext`] handed to each
//! handler.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::context::ChannelContext;
use crate::caps::{CapabilityFilter, CapabilitySet};
use crate::error::SpiceError;
use crate::message::ChannelType;
use crate::packet::{IncomingMessage, blocked_when_read_only};
use crate::protocol::WireDecode;
use crate::state::ChannelState;

// ── Handler table ────────────────────────────────────────────────

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), SpiceError>>;

/// Runs inside the channel task with exclusive access to its context.
pub type HandleFn = for<'a> fn(&'a mut ChannelContext, Arc<IncomingMessage>) -> HandlerFuture<'a>;

/// Decodes a payload into the value attached to the message.
pub type ParseFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, SpiceError>;

#[derive(Clone, Copy)]
pub struct MessageHandler {
    pub name: &'static str,
    pub parse: Option<ParseFn>,
    pub handle: HandleFn,
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("name", &self.name)
            .field("parses", &self.parse.is_some())
            .finish()
    }
}

fn parse_as<T>(data: &[u8]) -> Result<Box<dyn Any + Send + Sync>, SpiceError>
where
    T: WireDecode + Send + Sync + 'static,
{
    Ok(Box::new(T::from_bytes(data)?))
}

/// Message type → handler, built once per kind.
#[derive(Debug, Default)]
pub struct HandlerTable {
    handlers: HashMap<u16, MessageHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler whose payload is decoded as `T` first.
    pub fn with<T>(mut self, msg_type: u16, handle: HandleFn) -> Self
    where
        T: WireDecode + Send + Sync + 'static,
    {
        self.handlers.insert(
            msg_type,
            MessageHandler {
                name: T::NAME,
                parse: Some(parse_as::<T>),
                handle,
            },
        );
        self
    }

    /// Register a handler that reads the raw payload itself.
    pub fn with_raw(mut self, msg_type: u16, name: &'static str, handle: HandleFn) -> Self {
        self.handlers.insert(
            msg_type,
            MessageHandler {
                name,
                parse: None,
                handle,
            },
        );
        self
    }

    pub fn get(&self, msg_type: u16) -> Option<&MessageHandler> {
        self.handlers.get(&msg_type)
    }

    pub fn contains(&self, msg_type: u16) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── ChannelKind ──────────────────────────────────────────────────

/// Behaviour shared by every channel of one type.
#[async_trait]
pub trait ChannelKind: Send + Sync + fmt::Debug {
    fn channel_type(&self) -> ChannelType;

    /// Kind-specific handlers. They take precedence over the base table.
    fn handlers(&self) -> &HandlerTable;

    /// Fill in the kind capabilities advertised at link time.
    fn reset_capabilities(&self, _caps: &mut CapabilitySet, _filter: &CapabilityFilter) {}

    /// Called once the channel is `Ready` and not migrating.
    async fn on_up(&self, _ctx: &mut ChannelContext) -> Result<(), SpiceError> {
        Ok(())
    }

    /// Called instead of [`on_up`](Self::on_up) on a shadow channel whose
    /// seamless migration handshake is pending.
    async fn send_migration_handshake(&self, ctx: &mut ChannelContext) -> Result<(), SpiceError> {
        ctx.channel().set_state(ChannelState::Migrating);
        Ok(())
    }

    /// `false` drops the message before dispatch.
    fn filter(&self, _state: ChannelState, _msg_type: u16) -> bool {
        true
    }

    fn allowed_while_read_only(&self, msg_type: u16) -> bool {
        !blocked_when_read_only(self.channel_type(), msg_type)
    }

    /// Whether messages without a handler go to the session payload sink.
    fn forward_unhandled(&self) -> bool {
        false
    }
}

// ── GenericKind ──────────────────────────────────────────────────

static NO_HANDLERS: LazyLock<HandlerTable> = LazyLock::new(HandlerTable::new);

/// Default kind for every non-main channel: base protocol only, payload
/// messages are forwarded to the session sink.
#[derive(Debug, Clone, Copy)]
pub struct GenericKind {
    channel_type: ChannelType,
}

impl GenericKind {
    pub fn new(channel_type: ChannelType) -> Self {
        Self { channel_type }
    }
}

#[async_trait]
impl ChannelKind for GenericKind {
    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn handlers(&self) -> &HandlerTable {
        &NO_HANDLERS
    }

    fn forward_unhandled(&self) -> bool {
        true
    }
}
