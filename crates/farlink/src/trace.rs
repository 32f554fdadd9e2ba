//! Optional side-channel tracing of wire traffic.
//!
//! When a consumer or provider is configured with a [`TraceTap`], every
//! message it sends or receives is cloned and forwarded to the trace
//! endpoint, annotated with enough context to reconstruct the conversation
//! in an inspector. Without a tap, tracing is a no-op and costs nothing on
//! the hot path.

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Which half of the conversation emitted a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceSide {
    Consumer,
    Provider,
}

/// Direction of the traced message relative to the emitting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    Inbound,
    Outbound,
}

/// One traced message with its envelope of context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub side: TraceSide,
    #[serde(rename = "objectID")]
    pub object_id: String,
    #[serde(rename = "realmID")]
    pub realm_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub direction: TraceDirection,
    pub message: Value,
}

/// Handle to a trace endpoint. Cheap to clone; share one tap across all the
/// consumers and providers of a session to interleave their events.
#[derive(Clone)]
pub struct TraceTap {
    endpoint: Arc<dyn Endpoint>,
}

impl TraceTap {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        TraceTap { endpoint }
    }

    pub(crate) fn emit(
        &self,
        side: TraceSide,
        direction: TraceDirection,
        object_id: &str,
        realm_id: &str,
        message: &Value,
    ) {
        let event = TraceEvent {
            trace_id: Uuid::new_v4().to_string(),
            side,
            object_id: object_id.to_string(),
            realm_id: realm_id.to_string(),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            direction,
            message: message.clone(),
        };
        match serde_json::to_value(&event) {
            Ok(v) => self.endpoint.post(v),
            Err(e) => log::error!("failed to serialize trace event: {}", e),
        }
    }
}

/// Emit through an optional tap; the `None` case compiles down to nothing.
pub(crate) fn emit(
    tap: &Option<TraceTap>,
    side: TraceSide,
    direction: TraceDirection,
    object_id: &str,
    realm_id: &str,
    message: &Value,
) {
    if let Some(tap) = tap {
        tap.emit(side, direction, object_id, realm_id, message);
    }
}
