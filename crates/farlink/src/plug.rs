//! Argument and result wrapping.
//!
//! Sits between the multiplexer and the two ends of a call. Outbound:
//! clonable values pass through as raw data; anything else gets a fresh
//! sub-provider on a newly opened channel and travels as
//! `{kind: "channel-ref", channelID}`. Inbound: channel references are
//! materialised into sub-consumer proxies whose drop posts the release
//! notice that tears the counterpart sub-provider down.
//!
//! The same transformation applies to request arguments and response
//! results, in both directions.

use crate::consumer::{ConsumerConfig, RemoteObject, spawn_consumer};
use crate::error::RpcError;
use crate::exposed::{Arg, Exposed, Incoming};
use crate::multiplex::Multiplexer;
use crate::provider::{ProviderConfig, SubProviders, spawn_provider};
use crate::trace::TraceTap;
use crate::wire;
use serde_json::Value;

/// Wrap one outbound value: by value when clonable, else by reference to a
/// fresh sub-provider registered in `owned`.
pub(crate) fn wrap_outbound(
    mux: &Multiplexer,
    owned: &SubProviders,
    template: &ProviderConfig,
    exposed: Exposed,
) -> Value {
    if let Some(value) = exposed.clonable_value() {
        return value;
    }
    let endpoint = mux.open_fresh_channel();
    let channel_id = endpoint.channel_id().to_string();
    log::debug!(
        "sub-channeling non-clonable value on channel {} ({})",
        channel_id,
        template.name.as_deref().unwrap_or("unnamed")
    );
    let handle = spawn_provider(mux.clone(), endpoint, exposed, template.clone());
    owned.register(&handle);
    wire::channel_ref(&channel_id)
}

/// Wrap a whole argument list for an outbound request.
pub(crate) fn wrap_args(
    mux: &Multiplexer,
    owned: &SubProviders,
    template: &ProviderConfig,
    args: Vec<Arg>,
) -> Vec<Value> {
    args.into_iter()
        .map(|arg| match arg {
            Arg::Value(v) => v,
            Arg::Exposed(e) => wrap_outbound(mux, owned, template, e),
        })
        .collect()
}

/// Invert the wrapping on one inbound value: channel references become live
/// sub-consumer proxies; everything else is plain data.
pub(crate) fn unwrap_inbound(
    mux: &Multiplexer,
    config: &ConsumerConfig,
    value: &Value,
) -> Result<Incoming, RpcError> {
    match wire::as_channel_ref(value) {
        Some(channel_id) => {
            if channel_id.is_empty() {
                return Err(RpcError::ChannelIdInvalid {
                    channel_id: channel_id.to_string(),
                });
            }
            Ok(Incoming::Remote(spawn_consumer(
                mux,
                channel_id,
                config.clone(),
                true,
            )))
        }
        None => Ok(Incoming::Value(value.clone())),
    }
}

/// Provider template for sub-providers carrying outbound arguments.
///
/// Arguments are served read-only regardless of the originating side's own
/// policy.
pub(crate) fn arg_provider_template(consumer_id: &str, trace: Option<TraceTap>) -> ProviderConfig {
    ProviderConfig {
        allow_write: false,
        name: Some(format!("{}:arg", consumer_id)),
        verbosity: Default::default(),
        trace,
    }
}

/// Consumer config for sub-consumers materialised from channel references.
pub(crate) fn sub_consumer_config(trace: Option<TraceTap>) -> ConsumerConfig {
    let mut config = ConsumerConfig::default();
    config.trace = trace;
    config
}
