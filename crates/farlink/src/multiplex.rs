//! Channel multiplexing: many virtual endpoints over one raw endpoint.
//!
//! A [`Multiplexer`] owns one raw [`Endpoint`] and a pump task. Outbound
//! posts from a [`ChannelEndpoint`] are wrapped in `{channelID, data}`
//! envelopes; the pump unwraps inbound envelopes and routes `data` to the
//! listener set registered for that channel id. Envelopes for unknown
//! channels are dropped.
//!
//! Channel listener sets are weakly held: when every [`ChannelEndpoint`] for
//! an id has been dropped, its registry entry dies and subsequent traffic
//! for that id is discarded. If the raw endpoint closes, the pump stops and
//! every virtual endpoint is closed with it.
//!
//! The multiplexer is also the session root: it carries the realm id that
//! all consumers and providers of this side stamp into their requests, and
//! it is the only component that writes to the raw endpoint (everything
//! else goes through a [`ChannelEndpoint`]).

use crate::endpoint::{ENDPOINT_BUFFER, Endpoint};
use crate::realm;
use crate::wire::MuxEnvelope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The well-known channel id that the root provider claims and the root
/// consumer addresses.
pub const ROOT_CHANNEL: &str = "root";

type ChannelRegistry = Arc<Mutex<HashMap<String, Weak<ChannelState>>>>;

struct ChannelState {
    id: String,
    tx: broadcast::Sender<Value>,
}

/// One side of a multiplexed session. Cheap to clone; the underlying pump
/// task lives as long as any clone (or any consumer/provider built from it).
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

struct MuxShared {
    raw: Arc<dyn Endpoint>,
    channels: ChannelRegistry,
    realm_id: String,
    pump: JoinHandle<()>,
}

impl Drop for MuxShared {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl Multiplexer {
    /// Take ownership of a raw endpoint and start routing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(raw: Arc<dyn Endpoint>) -> Self {
        let channels: ChannelRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut inbound = raw.subscribe();
        let registry = channels.clone();
        let pump = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => route(&registry, message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("multiplex pump lagged, {} messages lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // Raw endpoint gone: every virtual channel is closed with it.
            registry.lock().clear();
            log::debug!("multiplex pump stopped (raw endpoint closed)");
        });
        Multiplexer {
            shared: Arc::new(MuxShared {
                raw,
                channels,
                realm_id: realm::next_realm_id(),
                pump,
            }),
        }
    }

    /// The realm id of this side of the session.
    pub fn realm_id(&self) -> &str {
        &self.shared.realm_id
    }

    /// Open (or re-open) the virtual endpoint for `channel_id`.
    ///
    /// Opening the same id twice yields endpoints that share one listener
    /// set; later subscribers see subsequent messages only, never a replay.
    pub fn open_channel(&self, channel_id: &str) -> ChannelEndpoint {
        let mut channels = self.shared.channels.lock();
        if let Some(state) = channels.get(channel_id).and_then(Weak::upgrade) {
            return ChannelEndpoint {
                raw: Arc::clone(&self.shared.raw),
                state,
            };
        }
        let (tx, _) = broadcast::channel(ENDPOINT_BUFFER);
        let state = Arc::new(ChannelState {
            id: channel_id.to_string(),
            tx,
        });
        channels.insert(channel_id.to_string(), Arc::downgrade(&state));
        log::trace!("opened channel {}", channel_id);
        ChannelEndpoint {
            raw: Arc::clone(&self.shared.raw),
            state,
        }
    }

    /// Open a sub-channel under a freshly generated id.
    pub fn open_fresh_channel(&self) -> ChannelEndpoint {
        let id = Uuid::new_v4().to_string();
        self.open_channel(&id)
    }
}

fn route(registry: &ChannelRegistry, message: Value) {
    let envelope: MuxEnvelope = match serde_json::from_value(message) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("dropping inbound message that is not an envelope: {}", e);
            return;
        }
    };
    let target = {
        let mut channels = registry.lock();
        match channels.get(&envelope.channel_id).and_then(Weak::upgrade) {
            Some(state) => Some(state),
            None => {
                // Stale weak entries are pruned as traffic reveals them.
                channels.remove(&envelope.channel_id);
                None
            }
        }
    };
    match target {
        Some(state) => {
            let _ = state.tx.send(envelope.data);
        }
        None => {
            log::trace!("dropping envelope for unknown channel {}", envelope.channel_id);
        }
    }
}

/// A virtual endpoint scoped to one channel id.
#[derive(Clone)]
pub struct ChannelEndpoint {
    raw: Arc<dyn Endpoint>,
    state: Arc<ChannelState>,
}

impl ChannelEndpoint {
    /// The channel id this endpoint posts and listens on.
    pub fn channel_id(&self) -> &str {
        &self.state.id
    }
}

impl Endpoint for ChannelEndpoint {
    fn post(&self, message: Value) {
        let envelope = MuxEnvelope {
            channel_id: self.state.id.clone(),
            data: message,
        };
        match serde_json::to_value(&envelope) {
            Ok(wrapped) => self.raw.post(wrapped),
            Err(e) => log::error!("failed to build envelope for {}: {}", self.state.id, e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.state.tx.subscribe()
    }
}
