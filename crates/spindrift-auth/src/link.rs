//! The transport handle the auth subsystem speaks through. Framing, TLS,
//! and keepalive live with the transport; this is the surface it exposes
//! to us.

use std::sync::Arc;

use spindrift_core::ids::AccountId;
use spindrift_core::msg::{self, Message};

/// One live client connection. Implementations must deliver messages in
/// the order they were sent and make `disconnect` idempotent.
pub trait Link: Send + Sync {
    /// Process-unique connection ID.
    fn id(&self) -> u64;
    /// Remote address, for logging.
    fn addr(&self) -> String;
    /// Serialize and enqueue a message.
    fn send(&self, msg: &Message) -> anyhow::Result<()>;
    /// Tear the connection down.
    fn disconnect(&self);
}

/// A raw route handler, as registered with the transport.
pub type MsgHandler = Arc<dyn Fn(Arc<dyn Link>, &Message) -> Option<msg::Error> + Send + Sync>;

/// An authenticated route handler: the connection has already been
/// resolved to its account.
pub type AuthRouteHandler = Arc<dyn Fn(AccountId, &Message) -> Option<msg::Error> + Send + Sync>;

/// Registers a route handler with the transport layer.
pub type RouteRegistrar = Arc<dyn Fn(&str, MsgHandler) + Send + Sync>;
