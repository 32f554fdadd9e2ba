//! farlink — transparent remote object access over message-passing endpoints.
//!
//! # Overview
//! One side *provides* an object tree — data, async functions, constructors —
//! bound to a channel; the other side *consumes* it through a proxy. Property
//! access walks the proxy tree locally; calling, constructing, assigning, or
//! fetching puts a correlated request on the wire and suspends the caller
//! until the response arrives. Composite results stay on the providing side
//! and come back as nested proxies; arguments that cannot travel by value are
//! automatically served over fresh sub-channels.
//!
//! # Architecture
//! Four layers, bottom up:
//!
//! - **Endpoints** ([`endpoint`], [`framing`], [`transports`]) — the thinnest
//!   message-passing contract, JSON framing for text transports, and the
//!   in-process / byte-stream adapters.
//! - **Multiplexing** ([`multiplex`]) — any number of virtual channels over
//!   one endpoint, each with its own listener set.
//! - **Wrapping** ([`plug`], [`exposed`]) — decides what travels by value and
//!   what travels by reference, and couples sub-channel lifetimes to proxy
//!   lifetimes.
//! - **Calling** ([`consumer`], [`provider`], [`wire`]) — the proxy engine
//!   with request correlation and timeouts, and the dispatcher with path
//!   resolution and the write policy.
//!
//! # Example
//! ```rust,no_run
//! use farlink::{Arg, ConsumerConfig, Exposed, Multiplexer, ProviderConfig};
//! use farlink::transports::MemoryEndpoint;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), farlink::RpcError> {
//! let (host_end, client_end) = MemoryEndpoint::pair();
//!
//! let host = Multiplexer::new(Arc::new(host_end));
//! let _provider = host.provide(
//!     Exposed::object([(
//!         "add",
//!         Exposed::function(|args| async move {
//!             let a: i64 = args[0].deserialize()?;
//!             let b: i64 = args[1].deserialize()?;
//!             Ok(Exposed::value(a + b))
//!         }),
//!     )]),
//!     ProviderConfig::default(),
//! );
//!
//! let client = Multiplexer::new(Arc::new(client_end));
//! let remote = client.consume(ConsumerConfig::default());
//! let sum: i64 = remote
//!     .get("add")?
//!     .call(vec![Arg::value(2), Arg::value(3)])
//!     .await?
//!     .deserialize()?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

/// The consumer proxy engine.
pub mod consumer;

/// The minimal endpoint contract.
pub mod endpoint;

/// Error taxonomy and wire descriptors.
pub mod error;

/// Values that cross the boundary: exposed trees, arguments, results.
pub mod exposed;

/// JSON framing for text-only transports.
pub mod framing;

/// Virtual channels over a shared endpoint.
pub mod multiplex;

/// Argument/result wrapping between value and reference semantics.
mod plug;

/// The provider dispatcher.
pub mod provider;

mod realm;

/// Optional wire-level tracing.
pub mod trace;

/// Concrete endpoint adapters.
pub mod transports;

/// Protocol message types.
pub mod wire;

pub use consumer::{ConsumerConfig, DEFAULT_TIMEOUT, RemoteObject};
pub use endpoint::{Endpoint, TextEndpoint};
pub use error::{ErrorDescriptor, ErrorKind, ErrorVerbosity, RpcError};
pub use exposed::{Arg, CallError, Exposed, HostFunction, HostResult, Incoming};
pub use framing::JsonFraming;
pub use multiplex::{ChannelEndpoint, Multiplexer, ROOT_CHANNEL};
pub use provider::{ProviderConfig, ProviderHandle};
pub use trace::{TraceDirection, TraceEvent, TraceSide, TraceTap};
