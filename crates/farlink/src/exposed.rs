//! Values that cross the boundary.
//!
//! A provider exposes an [`Exposed`] tree: JSON leaves, named children,
//! async host functions, and constructors. Whether a subtree travels by
//! value or by reference is decided by *clonability*: a subtree is clonable
//! iff it bottoms out in JSON leaves. Functions, constructors, and remote
//! handles are never clonable and are always sub-channeled by the wrapping
//! layer.
//!
//! Host code receives its arguments as [`Incoming`] values — plain data, or
//! live [`RemoteObject`] proxies for whatever the caller passed by
//! reference — and returns more [`Exposed`].

use crate::consumer::RemoteObject;
use crate::error::RpcError;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by host code during `call`, `construct`, or `await`.
///
/// Reported to the remote caller as a `user-thrown` error.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CallError(String);

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        CallError(message.into())
    }
}

impl From<&str> for CallError {
    fn from(s: &str) -> Self {
        CallError(s.to_string())
    }
}

impl From<String> for CallError {
    fn from(s: String) -> Self {
        CallError(s)
    }
}

impl From<RpcError> for CallError {
    fn from(e: RpcError) -> Self {
        CallError(e.to_string())
    }
}

/// What host functions return.
pub type HostResult = Result<Exposed, CallError>;

/// An async callable exposed through a provider.
///
/// Usually constructed from a closure via [`Exposed::function`] /
/// [`Exposed::constructor`]; implement it directly for stateful callables.
#[async_trait]
pub trait HostFunction: Send + Sync {
    async fn invoke(&self, args: Vec<Incoming>) -> HostResult;
}

struct ClosureHost<F> {
    f: F,
}

#[async_trait]
impl<F> HostFunction for ClosureHost<F>
where
    F: Fn(Vec<Incoming>) -> BoxFuture<'static, HostResult> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Incoming>) -> HostResult {
        (self.f)(args).await
    }
}

/// A node of the tree a provider serves.
#[derive(Clone)]
pub enum Exposed {
    /// Structurally clonable data; travels by value.
    Value(Value),
    /// Named children, addressed by path segments.
    Object(HashMap<String, Exposed>),
    /// Async callable; the target of `call`.
    Function(Arc<dyn HostFunction>),
    /// Async callable invoked via `construct` only.
    Constructor(Arc<dyn HostFunction>),
    /// A proxy received from elsewhere, re-exposed here. Operations on it
    /// are relayed to its origin.
    Remote(RemoteObject),
}

impl Exposed {
    /// A clonable leaf.
    pub fn value(v: impl Into<Value>) -> Exposed {
        Exposed::Value(v.into())
    }

    pub fn null() -> Exposed {
        Exposed::Value(Value::Null)
    }

    /// An object node from `(name, child)` pairs.
    pub fn object<K, I>(entries: I) -> Exposed
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Exposed)>,
    {
        Exposed::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// A function node from an async closure.
    pub fn function<F, Fut>(f: F) -> Exposed
    where
        F: Fn(Vec<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HostResult> + Send + 'static,
    {
        Exposed::Function(Arc::new(ClosureHost {
            f: move |args| f(args).boxed(),
        }))
    }

    /// A constructor node from an async closure.
    pub fn constructor<F, Fut>(f: F) -> Exposed
    where
        F: Fn(Vec<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HostResult> + Send + 'static,
    {
        Exposed::Constructor(Arc::new(ClosureHost {
            f: move |args| f(args).boxed(),
        }))
    }

    /// Re-expose a proxy obtained from another channel.
    pub fn remote(remote: RemoteObject) -> Exposed {
        Exposed::Remote(remote)
    }

    /// Whether this subtree can travel by value.
    ///
    /// Ownership makes the tree acyclic, so a plain recursive walk suffices.
    pub fn is_clonable(&self) -> bool {
        match self {
            Exposed::Value(_) => true,
            Exposed::Object(children) => children.values().all(Exposed::is_clonable),
            Exposed::Function(_) | Exposed::Constructor(_) | Exposed::Remote(_) => false,
        }
    }

    /// Collapse a clonable subtree into plain data; `None` when any node is
    /// non-clonable.
    pub fn clonable_value(&self) -> Option<Value> {
        match self {
            Exposed::Value(v) => Some(v.clone()),
            Exposed::Object(children) => {
                let mut out = serde_json::Map::with_capacity(children.len());
                for (name, child) in children {
                    out.insert(name.clone(), child.clonable_value()?);
                }
                Some(Value::Object(out))
            }
            Exposed::Function(_) | Exposed::Constructor(_) | Exposed::Remote(_) => None,
        }
    }
}

impl fmt::Debug for Exposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exposed::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Exposed::Object(children) => {
                f.debug_map().entries(children.keys().map(|k| (k, "…"))).finish()
            }
            Exposed::Function(_) => f.write_str("Function"),
            Exposed::Constructor(_) => f.write_str("Constructor"),
            Exposed::Remote(r) => f.debug_tuple("Remote").field(&r.path()).finish(),
        }
    }
}

// ── Boundary values ───────────────────────────────────────────────────────────

/// A value received across the boundary: plain data, or a live proxy for
/// something the peer passed by reference.
#[derive(Clone)]
pub enum Incoming {
    Value(Value),
    Remote(RemoteObject),
}

impl Incoming {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Incoming::Value(v) => Some(v),
            Incoming::Remote(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Incoming::Value(v) => Some(v),
            Incoming::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            Incoming::Value(_) => None,
            Incoming::Remote(r) => Some(r),
        }
    }

    pub fn into_remote(self) -> Option<RemoteObject> {
        match self {
            Incoming::Value(_) => None,
            Incoming::Remote(r) => Some(r),
        }
    }

    /// Deserialize a plain-data value into any owned type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        match self {
            Incoming::Value(v) => Ok(serde_json::from_value(v.clone())?),
            Incoming::Remote(_) => Err(RpcError::InvalidMessage {
                reason: "value is a remote reference, not clonable data".to_string(),
            }),
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incoming::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Incoming::Remote(r) => f.debug_tuple("Remote").field(&r.path()).finish(),
        }
    }
}

/// An argument for an outbound `call` / `construct` / `set`.
///
/// Plain data passes through the wire untouched; an [`Exposed`] argument is
/// sub-channeled and arrives on the far side as a proxy.
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Exposed(Exposed),
}

impl Arg {
    pub fn value(v: impl Into<Value>) -> Arg {
        Arg::Value(v.into())
    }

    pub fn exposed(e: Exposed) -> Arg {
        Arg::Exposed(e)
    }

    /// Pass an async closure by reference.
    pub fn function<F, Fut>(f: F) -> Arg
    where
        F: Fn(Vec<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HostResult> + Send + 'static,
    {
        Arg::Exposed(Exposed::function(f))
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<Exposed> for Arg {
    fn from(e: Exposed) -> Self {
        Arg::Exposed(e)
    }
}

impl From<RemoteObject> for Arg {
    fn from(r: RemoteObject) -> Self {
        Arg::Exposed(Exposed::Remote(r))
    }
}

impl From<Incoming> for Arg {
    fn from(incoming: Incoming) -> Self {
        match incoming {
            Incoming::Value(v) => Arg::Value(v),
            Incoming::Remote(r) => Arg::Exposed(Exposed::Remote(r)),
        }
    }
}
