//! The provider dispatcher: serves an [`Exposed`] tree over one channel.
//!
//! Each inbound request is validated, its path resolved against the root,
//! the operation executed, and the result sent back — by value when
//! clonable, as a fresh sub-channel reference otherwise. Inbound dispatch
//! is serialised on the serving task; each accepted request is then served
//! on its own task so a slow call cannot deadlock re-entrant callbacks
//! through sub-channels.
//!
//! A provider stops serving when it is disposed, when its channel closes,
//! or when a release notice arrives on its channel (the consumer-side proxy
//! went away).

use crate::endpoint::Endpoint;
use crate::error::{ErrorVerbosity, RpcError};
use crate::exposed::{Exposed, Incoming};
use crate::multiplex::{ChannelEndpoint, Multiplexer, ROOT_CHANNEL};
use crate::plug;
use crate::trace::{self, TraceDirection, TraceSide, TraceTap};
use crate::wire::{
    self, OperationType, ParsedRequest, RemoteCallRequest, RemoteCallResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Policy and diagnostics for a provider.
#[derive(Clone, Default)]
pub struct ProviderConfig {
    /// Whether `set` operations are honoured. Off by default.
    pub allow_write: bool,
    /// Diagnostics name; shows up in logs and derived sub-provider names.
    pub name: Option<String>,
    /// How much detail error descriptors carry on the wire.
    pub verbosity: ErrorVerbosity,
    /// Optional trace tap for wire-level inspection.
    pub trace: Option<TraceTap>,
}

impl ProviderConfig {
    pub fn allow_write(mut self, allow: bool) -> Self {
        self.allow_write = allow;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn verbosity(mut self, verbosity: ErrorVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn trace(mut self, tap: TraceTap) -> Self {
        self.trace = Some(tap);
        self
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Disposer handle for a running provider.
///
/// Dropping the handle does not stop the provider — it keeps serving until
/// disposed, released by its peer, or cut off by channel closure.
pub struct ProviderHandle {
    shared: Arc<ProviderShared>,
}

impl ProviderHandle {
    pub fn provider_id(&self) -> &str {
        &self.shared.provider_id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Number of live sub-providers currently serving this provider's
    /// non-clonable results.
    pub fn subprovider_count(&self) -> usize {
        self.shared.subproviders.live_count()
    }

    /// Stop serving and tear down any sub-providers created for results.
    /// Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

/// Registry of the sub-providers an owner has spun up for non-clonable
/// values.
///
/// Entries are weak: a sub-provider stays alive through its own serving
/// task, so one that disposes itself (release notice, channel closure) is
/// reclaimed immediately instead of lingering until the owner disposes.
/// Stale entries are pruned on each registration.
pub(crate) struct SubProviders {
    entries: Mutex<Vec<Weak<ProviderShared>>>,
}

impl SubProviders {
    pub(crate) fn new() -> Self {
        SubProviders {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, handle: &ProviderHandle) {
        let mut entries = self.entries.lock();
        entries.retain(|weak| weak.strong_count() > 0);
        entries.push(Arc::downgrade(&handle.shared));
    }

    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn dispose_all(&self) {
        let entries: Vec<_> = self.entries.lock().drain(..).collect();
        for entry in entries {
            if let Some(shared) = entry.upgrade() {
                shared.dispose();
            }
        }
    }
}

struct ProviderShared {
    provider_id: String,
    name: String,
    config: ProviderConfig,
    root: Mutex<Exposed>,
    endpoint: ChannelEndpoint,
    mux: Multiplexer,
    disposed: AtomicBool,
    subproviders: SubProviders,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderShared {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("provider '{}' disposed", self.name);
        if let Some(task) = self.serve_task.lock().take() {
            task.abort();
        }
        self.subproviders.dispose_all();
    }
}

// ── Binding ───────────────────────────────────────────────────────────────────

impl Multiplexer {
    /// Bind `root` to the well-known root channel of this session.
    pub fn provide(&self, root: Exposed, config: ProviderConfig) -> ProviderHandle {
        self.provide_on(ROOT_CHANNEL, root, config)
    }

    /// Bind `root` to an explicit channel id.
    pub fn provide_on(
        &self,
        channel_id: &str,
        root: Exposed,
        config: ProviderConfig,
    ) -> ProviderHandle {
        let endpoint = self.open_channel(channel_id);
        spawn_provider(self.clone(), endpoint, root, config)
    }
}

pub(crate) fn spawn_provider(
    mux: Multiplexer,
    endpoint: ChannelEndpoint,
    root: Exposed,
    config: ProviderConfig,
) -> ProviderHandle {
    let provider_id = Uuid::new_v4().to_string();
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| format!("provider-{}", &provider_id[..8]));
    // Subscribe before spawning so no request can slip past the loop.
    let inbound = endpoint.subscribe();
    let shared = Arc::new(ProviderShared {
        provider_id,
        name: name.clone(),
        config,
        root: Mutex::new(root),
        endpoint,
        mux,
        disposed: AtomicBool::new(false),
        subproviders: SubProviders::new(),
        serve_task: Mutex::new(None),
    });
    log::debug!(
        "provider '{}' serving on channel {}",
        name,
        shared.endpoint.channel_id()
    );
    let task = tokio::spawn(serve(Arc::clone(&shared), inbound));
    shared.serve_task.lock().replace(task);
    ProviderHandle { shared }
}

// ── Serving loop ──────────────────────────────────────────────────────────────

async fn serve(shared: Arc<ProviderShared>, mut inbound: broadcast::Receiver<Value>) {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("provider '{}' lagged, {} messages lost", shared.name, skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("provider '{}' channel closed", shared.name);
                shared.dispose();
                break;
            }
        };
        if shared.disposed.load(Ordering::SeqCst) {
            break;
        }
        trace::emit(
            &shared.config.trace,
            TraceSide::Provider,
            TraceDirection::Inbound,
            &shared.provider_id,
            shared.mux.realm_id(),
            &message,
        );
        if wire::is_release(&message) {
            log::debug!("provider '{}' released by its consumer", shared.name);
            shared.dispose();
            break;
        }
        if wire::is_response(&message) {
            // Our own responses echoed back on a bus transport.
            continue;
        }
        match wire::parse_request(&message) {
            ParsedRequest::Garbage => {
                log::warn!("provider '{}' dropping unparseable request", shared.name);
            }
            ParsedRequest::Invalid { request_id, error } => {
                respond_error(&shared, &request_id, &error);
            }
            ParsedRequest::Ok(request) => {
                if request.realm_id == shared.mux.realm_id() {
                    log::trace!("ignoring self-originated request {}", request.request_id);
                    continue;
                }
                let span = tracing::info_span!(
                    "provider.request",
                    provider = %shared.name,
                    request_id = %request.request_id,
                    operation = %request.operation_type,
                    path = %request.property_path,
                );
                let task_shared = Arc::clone(&shared);
                tokio::spawn(
                    async move {
                        handle_request(task_shared, request).await;
                    }
                    .instrument(span),
                );
            }
        }
    }
}

async fn handle_request(shared: Arc<ProviderShared>, request: RemoteCallRequest) {
    let response = match execute(&shared, &request).await {
        Ok(result) => {
            RemoteCallResponse::result(&request.request_id, &shared.provider_id, result)
        }
        Err(error) => {
            log::debug!(
                "provider '{}' request {} failed: {}",
                shared.name,
                request.request_id,
                error
            );
            RemoteCallResponse::error(
                &request.request_id,
                &shared.provider_id,
                &error.descriptor(shared.config.verbosity),
            )
        }
    };
    respond(&shared, &response);
}

fn respond_error(shared: &ProviderShared, request_id: &str, error: &RpcError) {
    let response = RemoteCallResponse::error(
        request_id,
        &shared.provider_id,
        &error.descriptor(shared.config.verbosity),
    );
    respond(shared, &response);
}

fn respond(shared: &ProviderShared, response: &RemoteCallResponse) {
    if shared.disposed.load(Ordering::SeqCst) {
        return;
    }
    match serde_json::to_value(response) {
        Ok(message) => {
            trace::emit(
                &shared.config.trace,
                TraceSide::Provider,
                TraceDirection::Outbound,
                &shared.provider_id,
                shared.mux.realm_id(),
                &message,
            );
            shared.endpoint.post(message);
        }
        Err(e) => log::error!("provider '{}' failed to serialize response: {}", shared.name, e),
    }
}

// ── Request execution ─────────────────────────────────────────────────────────

async fn execute(
    shared: &Arc<ProviderShared>,
    request: &RemoteCallRequest,
) -> Result<Value, RpcError> {
    let Some(operation) = request.operation() else {
        return Err(RpcError::UnknownOperation {
            operation: request.operation_type.clone(),
        });
    };
    let segments = request.segments();
    for segment in &segments {
        if segment.is_empty() {
            return Err(RpcError::InvalidMessage {
                reason: format!("empty segment in path {:?}", request.property_path),
            });
        }
        if wire::is_forbidden_segment(segment) {
            return Err(RpcError::ForbiddenProperty {
                segment: (*segment).to_string(),
            });
        }
    }

    // The root is never settable; this wins over the write policy.
    if operation == OperationType::Set {
        if segments.is_empty() {
            return Err(RpcError::RootNotSettable);
        }
        if !shared.config.allow_write {
            return Err(RpcError::WriteDenied);
        }
    }

    let mut args = Vec::with_capacity(request.args.len());
    for raw in &request.args {
        args.push(plug::unwrap_inbound(
            &shared.mux,
            &plug::sub_consumer_config(shared.config.trace.clone()),
            raw,
        )?);
    }

    if operation == OperationType::Set {
        return execute_set(shared, request, &segments, args).await;
    }

    let resolved = {
        let root = shared.root.lock();
        resolve(&root, &segments, &request.property_path)?
    };

    let result = match operation {
        OperationType::Call => match resolved {
            Resolved::Local(Exposed::Function(host)) => host
                .invoke(args)
                .await
                .map_err(|e| RpcError::UserThrown {
                    message: e.to_string(),
                })?,
            Resolved::Local(_) => {
                return Err(RpcError::NotAFunction {
                    path: request.property_path.clone(),
                });
            }
            Resolved::Remote(remote) => {
                from_incoming(remote.call(args.into_iter().map(Into::into).collect()).await?)
            }
        },
        OperationType::Construct => match resolved {
            Resolved::Local(Exposed::Constructor(host)) => host
                .invoke(args)
                .await
                .map_err(|e| RpcError::UserThrown {
                    message: e.to_string(),
                })?,
            Resolved::Local(_) => {
                return Err(RpcError::NotAFunction {
                    path: request.property_path.clone(),
                });
            }
            Resolved::Remote(remote) => from_incoming(
                remote
                    .construct(args.into_iter().map(Into::into).collect())
                    .await?,
            ),
        },
        OperationType::Await => match resolved {
            Resolved::Local(exposed) => exposed,
            Resolved::Remote(remote) => from_incoming(remote.fetch().await?),
        },
        OperationType::Set => unreachable!("set handled above"),
    };

    Ok(wrap_result(shared, &request.property_path, result))
}

/// Pass a clonable result through by value; sub-channel anything else.
fn wrap_result(shared: &Arc<ProviderShared>, path: &str, result: Exposed) -> Value {
    let template = ProviderConfig {
        allow_write: shared.config.allow_write,
        name: Some(format!("{}/{}", shared.name, if path.is_empty() { "root" } else { path })),
        verbosity: shared.config.verbosity,
        trace: shared.config.trace.clone(),
    };
    plug::wrap_outbound(&shared.mux, &shared.subproviders, &template, result)
}

fn from_incoming(incoming: Incoming) -> Exposed {
    match incoming {
        Incoming::Value(v) => Exposed::Value(v),
        Incoming::Remote(r) => Exposed::Remote(r),
    }
}

// ── Path resolution ───────────────────────────────────────────────────────────

enum Resolved {
    Local(Exposed),
    Remote(crate::consumer::RemoteObject),
}

fn no_such_property(path: &str) -> RpcError {
    RpcError::ResolutionFailed {
        path: path.to_string(),
        reason: "no such property".to_string(),
    }
}

fn not_traversable(path: &str) -> RpcError {
    RpcError::ResolutionFailed {
        path: path.to_string(),
        reason: "access denied: segment is not traversable".to_string(),
    }
}

/// Walk `segments` from the root, switching to plain-data lookup inside
/// JSON leaves and to proxy chaining when the walk reaches a re-exposed
/// remote.
fn resolve(root: &Exposed, segments: &[&str], path: &str) -> Result<Resolved, RpcError> {
    let mut cursor = root;
    for (i, segment) in segments.iter().enumerate() {
        match cursor {
            Exposed::Object(children) => {
                cursor = children.get(*segment).ok_or_else(|| no_such_property(path))?;
            }
            Exposed::Value(value) => {
                let mut data = value;
                for inner in &segments[i..] {
                    data = json_child(data, inner).ok_or_else(|| no_such_property(path))?;
                }
                return Ok(Resolved::Local(Exposed::Value(data.clone())));
            }
            Exposed::Remote(remote) => {
                let mut chained = remote.clone();
                for inner in &segments[i..] {
                    chained = chained.get(inner)?;
                }
                return Ok(Resolved::Remote(chained));
            }
            Exposed::Function(_) | Exposed::Constructor(_) => {
                return Err(not_traversable(path));
            }
        }
    }
    Ok(match cursor {
        Exposed::Remote(remote) => Resolved::Remote(remote.clone()),
        other => Resolved::Local(other.clone()),
    })
}

/// Ordinary property lookup inside plain data: object fields by name,
/// array elements by decimal index.
fn json_child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|ix| items.get(ix)),
        _ => None,
    }
}

fn json_child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => {
            let ix = segment.parse::<usize>().ok()?;
            items.get_mut(ix)
        }
        _ => None,
    }
}

// ── Set ───────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum SetOutcome {
    Done,
    Relay(crate::consumer::RemoteObject),
}

async fn execute_set(
    shared: &Arc<ProviderShared>,
    request: &RemoteCallRequest,
    segments: &[&str],
    mut args: Vec<Incoming>,
) -> Result<Value, RpcError> {
    if args.is_empty() {
        return Err(RpcError::InvalidMessage {
            reason: "set requires a value argument".to_string(),
        });
    }
    let value = args.remove(0);

    let outcome = {
        let mut root = shared.root.lock();
        assign(&mut root, segments, &value, &request.property_path)?
    };
    match outcome {
        SetOutcome::Done => Ok(Value::Null),
        SetOutcome::Relay(target) => {
            target.set(value).await?;
            Ok(Value::Null)
        }
    }
}

/// Assign `value` at the final segment, resolving the parent first.
fn assign(
    root: &mut Exposed,
    segments: &[&str],
    value: &Incoming,
    path: &str,
) -> Result<SetOutcome, RpcError> {
    let readonly = || RpcError::ReadonlyViolation {
        path: path.to_string(),
    };
    let (last, parent_segments) = match segments.split_last() {
        Some(split) => split,
        None => return Err(RpcError::RootNotSettable),
    };

    let mut cursor = root;
    for (i, segment) in parent_segments.iter().enumerate() {
        match cursor {
            Exposed::Object(children) => {
                cursor = children
                    .get_mut(*segment)
                    .ok_or_else(|| no_such_property(path))?;
            }
            Exposed::Value(data) => {
                let mut inner = data;
                for s in &parent_segments[i..] {
                    inner = json_child_mut(inner, s).ok_or_else(|| no_such_property(path))?;
                }
                return assign_into_json(inner, last, value, path);
            }
            Exposed::Remote(remote) => {
                let mut chained = remote.clone();
                for s in &parent_segments[i..] {
                    chained = chained.get(s)?;
                }
                return Ok(SetOutcome::Relay(chained.get(last)?));
            }
            Exposed::Function(_) | Exposed::Constructor(_) => {
                return Err(not_traversable(path));
            }
        }
    }

    match cursor {
        Exposed::Object(children) => {
            children.insert((*last).to_string(), from_incoming(value.clone()));
            Ok(SetOutcome::Done)
        }
        Exposed::Value(data) => assign_into_json(data, last, value, path),
        Exposed::Remote(remote) => Ok(SetOutcome::Relay(remote.get(last)?)),
        Exposed::Function(_) | Exposed::Constructor(_) => Err(readonly()),
    }
}

/// Assignment into plain data: only clonable values fit, and only object
/// containers accept new fields.
fn assign_into_json(
    parent: &mut Value,
    last: &str,
    value: &Incoming,
    path: &str,
) -> Result<SetOutcome, RpcError> {
    let readonly = || RpcError::ReadonlyViolation {
        path: path.to_string(),
    };
    let Incoming::Value(clonable) = value else {
        return Err(readonly());
    };
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), clonable.clone());
            Ok(SetOutcome::Done)
        }
        Value::Array(items) => {
            let ix = last.parse::<usize>().map_err(|_| readonly())?;
            let slot = items.get_mut(ix).ok_or_else(|| no_such_property(path))?;
            *slot = clonable.clone();
            Ok(SetOutcome::Done)
        }
        _ => Err(readonly()),
    }
}
