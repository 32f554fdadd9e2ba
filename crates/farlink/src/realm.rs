//! Realm identifiers.
//!
//! A realm is one execution context on one side of a channel. Realm ids are
//! opaque strings built from a process-wide random seed (created lazily on
//! first use, never mutated) plus a per-session counter, so every
//! multiplexer session gets a distinct id even when several live in one
//! process. Requests carry the originating realm id; a side that sees its
//! own realm id on an inbound message treats it as self-originated and
//! drops it.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static PROCESS_SEED: Lazy<String> = Lazy::new(|| Uuid::new_v4().simple().to_string());
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh realm id for a new multiplexer session.
pub(crate) fn next_realm_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", *PROCESS_SEED, n)
}
