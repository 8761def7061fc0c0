//! # Mima Protocol
//!
//! Shared data model and the wire format spoken between browser-side
//! contexts and the authority process.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ len: u32 LE  │ JSON payload (len bytes, max 1 MiB)      │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The payload is a [`SyncMessage`]: `query`, `query_result`, `mutate`,
//! `mutate_result`, `invalidate` or `error`, discriminated by its `type` tag.

mod codec;
mod error;
mod message;
mod types;

pub use codec::{
    encode_frame, read_frame, write_frame, FRAME_HEADER_BYTES, MAX_MESSAGE_BYTES,
};
pub use error::{ErrorKind, ProtocolError, Result};
pub use message::{decode_payload, encode_payload, SyncMessage, MESSAGE_TYPES, UNSOLICITED};
pub use types::{CanonicalKey, Category, CredentialRecord, MutateAction, RecordId, Secret};

/// Milliseconds since the unix epoch; 0 if the clock is before it.
#[must_use]
pub fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
