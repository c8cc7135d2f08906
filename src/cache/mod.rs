//! List cache synchronization.
//!
//! [`CacheSyncEngine`] owns one paginated entity list and reconciles three
//! input sources into it:
//! - Fetched pages, which may reorder within their page window
//! - Pushed entities, which merge in place or insert at the head
//! - Optimistic local edits, which stay visible until confirmed or rolled
//!   back
//!
//! While an edit is pending, pushes for the same entity update the server
//! value underneath it, so the user's own change is never visibly
//! overwritten by the server's broadcast of that change.

mod engine;
mod token;

pub use engine::{CacheEntry, CacheSyncEngine, Mutator};
pub use token::{OptimisticToken, Resolution, TokenId, TokenState};
