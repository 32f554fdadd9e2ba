//! In-process endpoints, linked pairwise or as a shared bus.

use crate::endpoint::{ENDPOINT_BUFFER, Endpoint, TextEndpoint};
use serde_json::Value;
use tokio::sync::broadcast;

/// An in-memory structured endpoint.
///
/// [`MemoryEndpoint::pair`] links two so that each side's posts surface on
/// the other side only. [`MemoryEndpoint::bus`] creates a broadcast bus
/// where every participant — including the poster — observes every message,
/// which is the topology the realm guard exists for.
#[derive(Clone)]
pub struct MemoryEndpoint {
    outbound: broadcast::Sender<Value>,
    inbound: broadcast::Sender<Value>,
}

impl MemoryEndpoint {
    /// Two linked endpoints; what one posts, the other receives.
    pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
        let (a_to_b, _) = broadcast::channel(ENDPOINT_BUFFER);
        let (b_to_a, _) = broadcast::channel(ENDPOINT_BUFFER);
        (
            MemoryEndpoint {
                outbound: a_to_b.clone(),
                inbound: b_to_a.clone(),
            },
            MemoryEndpoint {
                outbound: b_to_a,
                inbound: a_to_b,
            },
        )
    }

    /// A shared bus endpoint: posts are delivered to every subscriber,
    /// the posting side included. Clone it to add participants.
    pub fn bus() -> MemoryEndpoint {
        let (shared, _) = broadcast::channel(ENDPOINT_BUFFER);
        MemoryEndpoint {
            outbound: shared.clone(),
            inbound: shared,
        }
    }
}

impl Endpoint for MemoryEndpoint {
    fn post(&self, message: Value) {
        if self.outbound.send(message).is_err() {
            log::trace!("posted into a memory endpoint with no subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.inbound.subscribe()
    }
}

/// Text-frame twin of [`MemoryEndpoint`], for exercising the JSON framing
/// layer.
#[derive(Clone)]
pub struct MemoryTextEndpoint {
    outbound: broadcast::Sender<String>,
    inbound: broadcast::Sender<String>,
}

impl MemoryTextEndpoint {
    pub fn pair() -> (MemoryTextEndpoint, MemoryTextEndpoint) {
        let (a_to_b, _) = broadcast::channel(ENDPOINT_BUFFER);
        let (b_to_a, _) = broadcast::channel(ENDPOINT_BUFFER);
        (
            MemoryTextEndpoint {
                outbound: a_to_b.clone(),
                inbound: b_to_a.clone(),
            },
            MemoryTextEndpoint {
                outbound: b_to_a,
                inbound: a_to_b,
            },
        )
    }

    /// Post a frame into this side (used by tests to inject raw traffic).
    pub fn post_text(&self, frame: String) {
        TextEndpoint::post_text(self, frame);
    }
}

impl TextEndpoint for MemoryTextEndpoint {
    fn post_text(&self, frame: String) {
        if self.outbound.send(frame).is_err() {
            log::trace!("posted into a memory text endpoint with no subscribers");
        }
    }

    fn subscribe_text(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}
