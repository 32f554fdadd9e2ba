//! Concrete endpoint adapters.
//!
//! Only the adapters the core needs in-process live here: linked in-memory
//! pairs (the test transport) and a newline-delimited text adapter over any
//! `AsyncRead`/`AsyncWrite` pair, which covers pipes, sockets, and
//! child-process stdio once wrapped in JSON framing. Heavier transports
//! (websockets, browser messaging) are external adapters built on the same
//! two traits.

mod io;
mod memory;

pub use io::IoEndpoint;
pub use memory::{MemoryEndpoint, MemoryTextEndpoint};
