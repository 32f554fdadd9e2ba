//! The minimal message-passing contract everything else builds on.
//!
//! An endpoint can post a message to its peer and hand out subscriptions to
//! inbound messages. Subscriptions are tokio broadcast receivers: dropping
//! the receiver unsubscribes, and a closed endpoint surfaces as
//! `RecvError::Closed`. Delivery semantics (ordering, loss, echo) are
//! whatever the underlying transport provides.

use serde_json::Value;
use tokio::sync::broadcast;

/// Buffer depth for endpoint subscriptions. A subscriber that falls more
/// than this many messages behind starts losing the oldest ones.
pub const ENDPOINT_BUFFER: usize = 1024;

/// A bidirectional structured-message capability.
///
/// `post` is fire-and-forget: the core neither acknowledges nor retries, and
/// posting into a closed transport is a silent no-op (transports log it).
pub trait Endpoint: Send + Sync {
    /// Send one message to the peer.
    fn post(&self, message: Value);

    /// Subscribe to inbound messages. Only messages arriving after the call
    /// are observed; there is no replay.
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

/// A text-only transport surface: frames are opaque strings.
///
/// Wrap one in [`crate::framing::JsonFraming`] to get an [`Endpoint`].
pub trait TextEndpoint: Send + Sync {
    /// Send one text frame to the peer.
    fn post_text(&self, frame: String);

    /// Subscribe to inbound text frames.
    fn subscribe_text(&self) -> broadcast::Receiver<String>;
}
