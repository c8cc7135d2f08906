//! Push notification channel.
//!
//! A [`PushChannel`] owns one persistent duplex connection authenticated
//! with a caller-supplied [`Credential`](crate::types::Credential) and fans
//! named messages out to per-topic subscribers:
//! - Multiple callbacks per topic, invoked in registration order
//! - Bounded reconnection with a fixed delay between attempts
//! - No buffering or replay of messages missed while disconnected
//!
//! # Example
//!
//! ```
//! use grantwire::push::{ChannelConnector, ChannelState, PushChannel, PushMessage, PushTopic};
//! use grantwire::{Credential, PushConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let connector = Arc::new(ChannelConnector::new());
//! let channel = PushChannel::new(connector.clone(), PushConfig::default());
//!
//! let sub = channel.subscribe(PushTopic::NewMatch, |message| {
//!     println!("new match: {}", message.payload);
//! });
//!
//! channel.connect(Credential::new("token")).unwrap();
//! assert!(channel.wait_for(Duration::from_secs(1), |s| s == ChannelState::Connected));
//!
//! sub.unsubscribe();
//! channel.disconnect();
//! ```

mod channel;
mod connection;
mod registry;
mod types;

pub use channel::PushChannel;
#[cfg(feature = "websocket")]
pub use connection::WebSocketConnector;
pub use connection::{ChannelConnector, Connector, DuplexConnection, Incoming, PushServer};
pub use registry::{PushCallback, Subscription, SubscriptionId, SubscriptionRegistry};
pub use types::{ChannelState, PushMessage, PushTopic};
