//! Wire types for the remote-call protocol.
//!
//! Everything that crosses an endpoint is one of:
//!
//! - a multiplex envelope `{channelID, data}`,
//! - a call request `{requestID, consumerID, realmID, operationType, propertyPath, args}`,
//! - a call response `{type: "response", requestID, providerID, resultType, result}`,
//! - a channel reference `{kind: "channel-ref", channelID}` standing in for a
//!   non-clonable argument or result,
//! - a release notice `{type: "release"}` posted on a sub-channel when the
//!   consumer-side proxy goes away.
//!
//! Field names are part of the protocol and must survive JSON framing
//! unchanged, hence the explicit `rename` attributes.

use crate::error::{ErrorDescriptor, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Property names that are never traversed and never produce sub-proxies.
///
/// The first three guard against prototype pollution; the last three would
/// make a proxy look thenable to an async layer on the original wire peers,
/// so they stay forbidden here for protocol compatibility.
pub const FORBIDDEN_SEGMENTS: [&str; 6] = [
    "__proto__",
    "prototype",
    "constructor",
    "then",
    "catch",
    "finally",
];

/// Whether `segment` is on the forbidden list.
pub fn is_forbidden_segment(segment: &str) -> bool {
    FORBIDDEN_SEGMENTS.contains(&segment)
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Multiplex envelope tagging a payload with its virtual channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxEnvelope {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub data: Value,
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// The four remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Call,
    Construct,
    Set,
    Await,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Call => "call",
            OperationType::Construct => "construct",
            OperationType::Set => "set",
            OperationType::Await => "await",
        }
    }

    pub fn parse(tag: &str) -> Option<OperationType> {
        match tag {
            "call" => Some(OperationType::Call),
            "construct" => Some(OperationType::Construct),
            "set" => Some(OperationType::Set),
            "await" => Some(OperationType::Await),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote call request.
///
/// `property_path` is the `/`-joined path from the provider root; the empty
/// string addresses the root itself. `args` elements are either raw clonable
/// values or channel references.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteCallRequest {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "consumerID")]
    pub consumer_id: String,
    #[serde(rename = "realmID")]
    pub realm_id: String,
    #[serde(rename = "operationType")]
    pub operation_type: String,
    #[serde(rename = "propertyPath")]
    pub property_path: String,
    pub args: Vec<Value>,
}

impl RemoteCallRequest {
    /// Typed view of `operation_type`; `None` for unrecognised tags.
    pub fn operation(&self) -> Option<OperationType> {
        OperationType::parse(&self.operation_type)
    }

    /// Path split into segments; empty path means the root (zero segments).
    pub fn segments(&self) -> Vec<&str> {
        if self.property_path.is_empty() {
            Vec::new()
        } else {
            self.property_path.split('/').collect()
        }
    }
}

/// Outcome of leniently parsing an inbound value as a request.
///
/// Lenient so that shape violations can still be answered when a
/// `requestID` is recoverable, instead of being silently dropped.
pub enum ParsedRequest {
    Ok(RemoteCallRequest),
    /// Malformed, but we know who asked.
    Invalid { request_id: String, error: RpcError },
    /// Malformed beyond recovery; drop it.
    Garbage,
}

/// Parse an inbound payload as a remote call request.
///
/// Responses and release notices are not requests; callers are expected to
/// check for those first.
pub fn parse_request(value: &Value) -> ParsedRequest {
    let Some(obj) = value.as_object() else {
        return ParsedRequest::Garbage;
    };
    let Some(request_id) = obj.get("requestID").and_then(Value::as_str) else {
        return ParsedRequest::Garbage;
    };
    let request_id = request_id.to_string();

    let field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);
    let (Some(consumer_id), Some(realm_id), Some(operation_type), Some(property_path)) = (
        field("consumerID"),
        field("realmID"),
        field("operationType"),
        field("propertyPath"),
    ) else {
        return ParsedRequest::Invalid {
            request_id,
            error: RpcError::InvalidMessage {
                reason: "missing or non-string request field".to_string(),
            },
        };
    };

    let Some(args) = obj.get("args").and_then(Value::as_array) else {
        return ParsedRequest::Invalid {
            request_id,
            error: RpcError::InvalidMessage {
                reason: "args is not an ordered sequence".to_string(),
            },
        };
    };

    ParsedRequest::Ok(RemoteCallRequest {
        request_id,
        consumer_id,
        realm_id,
        operation_type,
        property_path,
        args: args.clone(),
    })
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Discriminates a successful result from an error descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Result,
    Error,
}

/// A remote call response, correlated to its request by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCallResponse {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "resultType")]
    pub result_type: ResultType,
    pub result: Value,
}

impl RemoteCallResponse {
    pub fn result(request_id: &str, provider_id: &str, result: Value) -> Self {
        RemoteCallResponse {
            msg_type: RESPONSE_TYPE.to_string(),
            request_id: request_id.to_string(),
            provider_id: provider_id.to_string(),
            result_type: ResultType::Result,
            result,
        }
    }

    pub fn error(request_id: &str, provider_id: &str, descriptor: &ErrorDescriptor) -> Self {
        RemoteCallResponse {
            msg_type: RESPONSE_TYPE.to_string(),
            request_id: request_id.to_string(),
            provider_id: provider_id.to_string(),
            result_type: ResultType::Error,
            result: serde_json::to_value(descriptor).unwrap_or(Value::Null),
        }
    }
}

const RESPONSE_TYPE: &str = "response";
const RELEASE_TYPE: &str = "release";

/// Whether an inbound payload is a call response.
pub fn is_response(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(RESPONSE_TYPE)
}

/// Whether an inbound payload is a release notice.
pub fn is_release(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(RELEASE_TYPE)
}

/// Release notice posted on a sub-channel when its consumer proxy goes away.
pub fn release_notice() -> Value {
    json!({ "type": RELEASE_TYPE })
}

// ── Channel references ────────────────────────────────────────────────────────

const CHANNEL_REF_KIND: &str = "channel-ref";

/// Wire form of a non-clonable argument or result: a reference to a freshly
/// opened sub-channel with a provider on the far side.
pub fn channel_ref(channel_id: &str) -> Value {
    json!({ "kind": CHANNEL_REF_KIND, "channelID": channel_id })
}

/// Extract the channel id if `value` is a channel reference.
pub fn as_channel_ref(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.get("kind").and_then(Value::as_str) != Some(CHANNEL_REF_KIND) {
        return None;
    }
    obj.get("channelID").and_then(Value::as_str)
}
