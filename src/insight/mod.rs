//! Streaming insight requests.
//!
//! One request multiplexes two named sub-streams (`eligibility` and
//! `writing`) over a single event-stream response. The controller keeps a
//! [`ContentBuffer`] per topic and guarantees that, once a request is
//! cancelled or superseded, nothing it reads afterwards is applied.
//!
//! # Example
//!
//! ```
//! use grantwire::insight::{ChannelTransport, InsightStreamController, InsightTopic, StreamStatus};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let controller = InsightStreamController::new(transport.clone());
//!
//! let sender = transport.expect("req-1");
//! let run = controller.start("req-1").unwrap();
//! sender.send("event: eligibility_start\ndata: {}\n\n");
//! sender.send("event: eligibility_chunk\ndata: {\"content\":\"Yes\"}\n\n");
//! sender.close();
//! run.run().unwrap();
//!
//! // The body ended before `eligibility_end`, so the topic failed.
//! let buffer = controller.buffer(InsightTopic::Eligibility);
//! assert_eq!(buffer.text, "Yes");
//! assert_eq!(buffer.status, StreamStatus::Error);
//! ```

mod controller;
mod state;
mod transport;

pub use controller::{InsightRun, InsightSnapshot, InsightStreamController, Pump};
pub use state::{
    apply_event, apply_transport_failure, ContentBuffer, InsightEvent, InsightState, InsightTopic,
    StreamStatus, STREAM_CLOSED_EARLY,
};
#[cfg(feature = "http")]
pub use transport::HttpInsightTransport;
pub use transport::{AbortSignal, ChannelTransport, ChunkSender, ChunkSource, InsightTransport};
