//! # Grantwire
//!
//! Realtime streaming and synchronization core for grant discovery.
//!
//! ## Core Concepts
//!
//! - **Decoder**: Turns incrementally delivered event-stream text into
//!   ordered [`StreamEvent`]s
//! - **Insight streams**: One request carrying two named sub-streams
//!   (`eligibility`, `writing`) into cancellable content buffers
//! - **Push channel**: A persistent connection with bounded reconnection
//!   fanning pushed messages out to per-topic subscribers
//! - **Cache sync**: A paginated list cache reconciling fetched pages,
//!   pushed entities and optimistic local edits
//!
//! ## Example
//!
//! ```ignore
//! use grantwire::{CacheSyncEngine, Entity, PushChannel, PushTopic, SyncConfig};
//!
//! let config = SyncConfig::from_env()?;
//! let cache = Arc::new(CacheSyncEngine::new());
//! let channel = PushChannel::new(Arc::new(WebSocketConnector::new(&config.push)), config.push);
//!
//! let sink = Arc::clone(&cache);
//! let _sub = channel.subscribe(PushTopic::NewMatch, move |message| {
//!     if let Ok(entity) = Entity::from_value(message.payload.clone()) {
//!         sink.apply_push(entity);
//!     }
//! });
//! channel.connect(credential)?;
//!
//! // Save a grant optimistically
//! let token = cache.apply_optimistic(&id, |grant| grant.set("saved", true))?;
//! cache.settle(&token, api.save(&id));
//! ```

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod insight;
pub mod push;
pub mod types;

// Re-exports
pub use cache::{CacheEntry, CacheSyncEngine, OptimisticToken, Resolution, TokenState};
pub use config::{InsightConfig, PushConfig, SyncConfig};
pub use decoder::{decode, DecodeStats, StreamDecoder, StreamEvent};
pub use error::{Result, SyncError};
pub use insight::{
    ContentBuffer, InsightRun, InsightStreamController, InsightTopic, Pump, StreamStatus,
};
pub use push::{ChannelState, PushChannel, PushMessage, PushTopic, Subscription};
pub use types::*;
