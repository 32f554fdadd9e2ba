//! The consumer proxy engine.
//!
//! [`Multiplexer::consume`] yields a [`RemoteObject`] — the root proxy.
//! Property access ([`RemoteObject::get`]) is purely local: it returns a
//! cached sub-proxy keyed by its canonical `/`-joined path and sends
//! nothing. Only the terminal operations — [`call`](RemoteObject::call),
//! [`construct`](RemoteObject::construct), [`set`](RemoteObject::set),
//! [`fetch`](RemoteObject::fetch) — put a request on the wire and suspend
//! the caller until the correlated response arrives or the timeout fires.
//!
//! Responses are matched by request id only; no arrival order is assumed.
//! Inbound traffic carrying this side's own realm id is ignored, which is
//! what keeps a shared-bus transport from feeding a consumer its own
//! requests.
//!
//! Proxies are reference counted. When the last handle of a sub-consumer
//! materialised for a channel reference is dropped, a release notice goes
//! out on its channel and the counterpart sub-provider tears itself down.

use crate::endpoint::Endpoint;
use crate::error::{ErrorDescriptor, RpcError};
use crate::exposed::{Arg, Incoming};
use crate::multiplex::{ChannelEndpoint, Multiplexer, ROOT_CHANNEL};
use crate::plug;
use crate::provider::SubProviders;
use crate::trace::{self, TraceDirection, TraceSide, TraceTap};
use crate::wire::{self, OperationType, RemoteCallRequest, RemoteCallResponse, ResultType};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default time a terminal operation waits for its response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Tuning for a consumer.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// How long terminal operations wait before rejecting with a timeout.
    pub timeout: Duration,
    /// Optional trace tap for wire-level inspection.
    pub trace: Option<TraceTap>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            timeout: DEFAULT_TIMEOUT,
            trace: None,
        }
    }
}

impl ConsumerConfig {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn trace(mut self, tap: TraceTap) -> Self {
        self.trace = Some(tap);
        self
    }
}

impl Multiplexer {
    /// Consume the provider on the well-known root channel of this session.
    pub fn consume(&self, config: ConsumerConfig) -> RemoteObject {
        self.consume_on(ROOT_CHANNEL, config)
    }

    /// Consume a provider bound to an explicit channel id.
    pub fn consume_on(&self, channel_id: &str, config: ConsumerConfig) -> RemoteObject {
        spawn_consumer(self, channel_id, config, false)
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

type PendingMap = HashMap<String, oneshot::Sender<Result<Incoming, RpcError>>>;

struct ConsumerShared {
    consumer_id: String,
    endpoint: ChannelEndpoint,
    mux: Multiplexer,
    config: ConsumerConfig,
    pending: Mutex<PendingMap>,
    proxies: Mutex<HashMap<String, Weak<ProxyNode>>>,
    disposed: AtomicBool,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    subproviders: SubProviders,
    /// Set for sub-consumers materialised from channel references: tells the
    /// counterpart sub-provider to tear down when this consumer goes away.
    release_on_drop: bool,
}

impl ConsumerShared {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        let pending: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };
        if !pending.is_empty() {
            log::debug!(
                "consumer {} disposed with {} pending requests",
                self.consumer_id,
                pending.len()
            );
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::Disposed));
        }
        self.subproviders.dispose_all();
        if self.release_on_drop {
            self.endpoint.post(wire::release_notice());
        }
        log::debug!("consumer {} disposed", self.consumer_id);
    }
}

impl Drop for ConsumerShared {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct ProxyNode {
    path: String,
    shared: Arc<ConsumerShared>,
}

pub(crate) fn spawn_consumer(
    mux: &Multiplexer,
    channel_id: &str,
    config: ConsumerConfig,
    release_on_drop: bool,
) -> RemoteObject {
    let endpoint = mux.open_channel(channel_id);
    let consumer_id = Uuid::new_v4().to_string();
    // Subscribe before spawning so no response can slip past the loop.
    let inbound = endpoint.subscribe();
    let shared = Arc::new(ConsumerShared {
        consumer_id: consumer_id.clone(),
        endpoint,
        mux: mux.clone(),
        config,
        pending: Mutex::new(HashMap::new()),
        proxies: Mutex::new(HashMap::new()),
        disposed: AtomicBool::new(false),
        dispatch_task: Mutex::new(None),
        subproviders: SubProviders::new(),
        release_on_drop,
    });
    log::debug!("consumer {} addressing channel {}", consumer_id, channel_id);
    let task = tokio::spawn(dispatch(Arc::downgrade(&shared), inbound));
    shared.dispatch_task.lock().replace(task);
    let root = Arc::new(ProxyNode {
        path: String::new(),
        shared,
    });
    RemoteObject { node: root }
}

/// Response pump. Holds only a weak reference so that dropping every proxy
/// actually tears the consumer down.
async fn dispatch(weak: Weak<ConsumerShared>, mut inbound: broadcast::Receiver<Value>) {
    loop {
        match inbound.recv().await {
            Ok(message) => {
                let Some(shared) = weak.upgrade() else { break };
                handle_inbound(&shared, message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("consumer dispatch lagged, {} messages lost", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Transport gone: everything in flight fails as disposed.
                if let Some(shared) = weak.upgrade() {
                    log::debug!(
                        "consumer {} channel closed, rejecting in-flight requests",
                        shared.consumer_id
                    );
                    let pending: Vec<_> = shared.pending.lock().drain().collect();
                    for (_, tx) in pending {
                        let _ = tx.send(Err(RpcError::Disposed));
                    }
                }
                break;
            }
        }
    }
}

fn handle_inbound(shared: &Arc<ConsumerShared>, message: Value) {
    trace::emit(
        &shared.config.trace,
        TraceSide::Consumer,
        TraceDirection::Inbound,
        &shared.consumer_id,
        shared.mux.realm_id(),
        &message,
    );
    // Realm guard: on a bus transport we hear our own requests echoed back.
    if message.get("realmID").and_then(Value::as_str) == Some(shared.mux.realm_id()) {
        log::trace!("consumer {} ignoring self-originated message", shared.consumer_id);
        return;
    }
    if !wire::is_response(&message) {
        return;
    }
    let response: RemoteCallResponse = match serde_json::from_value(message) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("dropping malformed response: {}", e);
            return;
        }
    };
    let Some(tx) = shared.pending.lock().remove(&response.request_id) else {
        log::debug!(
            "consumer {} has no pending request {} (late or foreign response)",
            shared.consumer_id,
            response.request_id
        );
        return;
    };
    let outcome = match response.result_type {
        ResultType::Result => plug::unwrap_inbound(
            &shared.mux,
            &plug::sub_consumer_config(shared.config.trace.clone())
                .timeout(shared.config.timeout),
            &response.result,
        ),
        ResultType::Error => {
            let descriptor: ErrorDescriptor =
                serde_json::from_value(response.result).unwrap_or(ErrorDescriptor {
                    message: "unstructured remote error".to_string(),
                    code: None,
                });
            Err(RpcError::from_descriptor(&descriptor))
        }
    };
    let _ = tx.send(outcome);
}

/// Removes a pending entry on every exit path of a terminal operation,
/// including cancellation of the caller's future.
struct PendingGuard {
    shared: Arc<ConsumerShared>,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}

// ── Public proxy type ─────────────────────────────────────────────────────────

/// A proxy for a value inside a remote provider's tree.
///
/// Cheap to clone; clones share the same cached node. Equal paths obtained
/// from the same consumer return the same node until every handle to it has
/// been dropped.
#[derive(Clone)]
pub struct RemoteObject {
    node: Arc<ProxyNode>,
}

impl RemoteObject {
    /// The canonical `/`-joined path of this proxy; empty for the root.
    pub fn path(&self) -> &str {
        &self.node.path
    }

    /// Identifier of the consumer instance this proxy belongs to.
    pub fn consumer_id(&self) -> &str {
        &self.node.shared.consumer_id
    }

    pub fn is_disposed(&self) -> bool {
        self.node.shared.disposed.load(Ordering::SeqCst)
    }

    /// Number of live sub-providers currently serving this consumer's
    /// by-reference arguments.
    pub fn subprovider_count(&self) -> usize {
        self.node.shared.subproviders.live_count()
    }

    /// Tear down the whole consumer this proxy belongs to: stop listening,
    /// reject every pending request as disposed, and dispose sub-providers
    /// created for outbound arguments. Idempotent.
    pub fn dispose(&self) {
        self.node.shared.dispose();
    }

    /// A sub-proxy for a child property. Purely local: nothing is sent.
    ///
    /// Forbidden names (`__proto__`, `prototype`, `constructor`, `then`,
    /// `catch`, `finally`) never produce a sub-proxy.
    pub fn get(&self, segment: &str) -> Result<RemoteObject, RpcError> {
        if segment.is_empty() || segment.contains('/') {
            return Err(RpcError::InvalidMessage {
                reason: format!("invalid path segment {:?}", segment),
            });
        }
        if wire::is_forbidden_segment(segment) {
            return Err(RpcError::ForbiddenProperty {
                segment: segment.to_string(),
            });
        }
        let child_path = if self.node.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.node.path, segment)
        };
        let shared = &self.node.shared;
        let mut proxies = shared.proxies.lock();
        if let Some(node) = proxies.get(&child_path).and_then(Weak::upgrade) {
            return Ok(RemoteObject { node });
        }
        // Read miss: prune entries whose proxies have been collected.
        proxies.retain(|_, weak| weak.strong_count() > 0);
        let node = Arc::new(ProxyNode {
            path: child_path.clone(),
            shared: Arc::clone(shared),
        });
        proxies.insert(child_path, Arc::downgrade(&node));
        Ok(RemoteObject { node })
    }

    /// Convenience: `get` chained over a `/`-joined path.
    pub fn at(&self, path: &str) -> Result<RemoteObject, RpcError> {
        let mut cursor = self.clone();
        for segment in path.split('/') {
            cursor = cursor.get(segment)?;
        }
        Ok(cursor)
    }

    /// Invoke the remote value at this path as a function.
    pub async fn call(&self, args: Vec<Arg>) -> Result<Incoming, RpcError> {
        self.request(OperationType::Call, args).await
    }

    /// Invoke the remote value at this path as a constructor.
    pub async fn construct(&self, args: Vec<Arg>) -> Result<Incoming, RpcError> {
        self.request(OperationType::Construct, args).await
    }

    /// Assign a value to this path. Subject to the provider's write policy;
    /// the root path is never assignable.
    pub async fn set(&self, value: impl Into<Arg>) -> Result<(), RpcError> {
        self.request(OperationType::Set, vec![value.into()])
            .await
            .map(|_| ())
    }

    /// Resolve the remote value at this path.
    ///
    /// Clonable values arrive as data; anything else arrives as a proxy.
    pub async fn fetch(&self) -> Result<Incoming, RpcError> {
        self.request(OperationType::Await, vec![]).await
    }

    /// [`fetch`](RemoteObject::fetch) and deserialize into a typed value.
    pub async fn fetch_as<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.fetch().await?.deserialize()
    }

    #[tracing::instrument(
        name = "consumer.request",
        skip(self, args),
        fields(path = %self.node.path, operation = %operation)
    )]
    async fn request(
        &self,
        operation: OperationType,
        args: Vec<Arg>,
    ) -> Result<Incoming, RpcError> {
        let shared = &self.node.shared;
        if shared.disposed.load(Ordering::SeqCst) {
            return Err(RpcError::Disposed);
        }

        let request_id = Uuid::new_v4().to_string();
        let wire_args = plug::wrap_args(
            &shared.mux,
            &shared.subproviders,
            &plug::arg_provider_template(&shared.consumer_id, shared.config.trace.clone()),
            args,
        );
        let request = RemoteCallRequest {
            request_id: request_id.clone(),
            consumer_id: shared.consumer_id.clone(),
            realm_id: shared.mux.realm_id().to_string(),
            operation_type: operation.as_str().to_string(),
            property_path: self.node.path.clone(),
            args: wire_args,
        };
        let message = serde_json::to_value(&request)?;

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            shared: Arc::clone(shared),
            request_id,
        };

        trace::emit(
            &shared.config.trace,
            TraceSide::Consumer,
            TraceDirection::Outbound,
            &shared.consumer_id,
            shared.mux.realm_id(),
            &message,
        );
        shared.endpoint.post(message);

        match tokio::time::timeout(shared.config.timeout, rx).await {
            // The guard clears the pending entry when the timer fires or the
            // caller's future is dropped mid-flight.
            Err(_elapsed) => Err(RpcError::Timeout {
                millis: shared.config.timeout.as_millis() as u64,
            }),
            Ok(Err(_sender_dropped)) => Err(RpcError::Disposed),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("path", &self.node.path)
            .field("consumer_id", &self.node.shared.consumer_id)
            .finish()
    }
}
