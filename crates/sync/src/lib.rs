//! # Mima Sync
//!
//! Moves credentials between browsing contexts and the authority process.
//!
//! ```text
//!  tab ── BrowsingContext ─┐                       ┌── conn ──┐
//!  tab ── BrowsingContext ─┼── SyncBridge ══ IPC ══┤          ├── Authority ── AuthorityStore
//!  tab ── BrowsingContext ─┘       │               └── conn ──┘
//!              ▲                   │ invalidate
//!              └── TabBroadcaster ◄┘
//! ```
//!
//! Each context runs one event loop that owns its cache and settle window.
//! The bridge multiplexes every context's requests over a single connection
//! and republishes the authority's `invalidate` pushes to all of them.

mod authority;
mod bridge;
mod connector;
mod context;
mod error;
mod store;

pub use authority::{bind_socket, Authority};
pub use bridge::SyncBridge;
pub use connector::{BoxedReader, BoxedWriter, Connector, UnixConnector};
pub use context::{BrowsingContext, ContextEvent, ContextId};
pub use error::{ContextError, Result, SyncError};
pub use store::{
    AuthorityStore, HistoryEntry, MemoryStore, RecordUpdate, StoreError, StoreResult,
};
