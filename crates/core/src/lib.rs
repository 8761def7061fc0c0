//! # Mima Core
//!
//! Browser-side credential logic: everything a browsing context decides
//! without talking to the authority.
//!
//! ## Flow
//!
//! ```text
//! form submit ──> SettleWindow (debounce per domain)
//!                     │
//!                     └─> normalize ──> CredentialCache (per context, LRU)
//!                                            │
//!                          ┌─────────────────┴──────────────┐
//!                          │                                │
//!                    classify (save?)                 match (autofill)
//!                          │                                │
//!              SaveNew / UpdatePassword / NoAction   None / Single / Multiple
//!
//! TabBroadcaster ──> Invalidation ──> CredentialCache::invalidate
//! ```
//!
//! ## Example
//!
//! ```
//! use mima_core::{classify, Action, FormObservation};
//!
//! let observation = FormObservation::login("https://www.Shop.Example/login", "Alice", "p1");
//! let action = classify(&observation, &[]).unwrap();
//! assert!(matches!(action, Action::SaveNew { .. }));
//! ```

mod broadcast;
mod cache;
mod config;
mod decision;
mod error;
mod matcher;
mod normalize;
mod observation;
mod password_gen;
mod settle;

pub use broadcast::{Invalidation, Subscription, TabBroadcaster};
pub use cache::{CacheEntry, CacheLookup, CredentialCache};
pub use config::{
    SyncConfig, ENV_MAX_CACHED_DOMAINS, ENV_QUERY_TIMEOUT_MS, ENV_SETTLE_WINDOW_MS,
};
pub use decision::{classify, classify_against, matching_records, Action, Mutation};
pub use error::{CoreError, Result};
pub use matcher::{match_domain, match_records, MatchResult};
pub use normalize::{normalize, normalize_domain, normalize_username};
pub use observation::{FormKind, FormObservation};
pub use password_gen::{generate_password, PasswordPolicy, DEFAULT_LENGTH, LENGTH_RANGE};
pub use settle::SettleWindow;
