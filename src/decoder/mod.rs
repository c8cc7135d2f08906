//! Incremental decoder for the event-stream framing used by the insight
//! endpoint.
//!
//! The wire format is a sequence of records, each made of `field: value`
//! lines and terminated by a blank line:
//!
//! ```text
//! event: eligibility_chunk
//! data: {"content":"Yes"}
//!
//! ```
//!
//! Chunks may be split anywhere, including in the middle of a line or of a
//! `\r\n` pair. Everything after the last complete record is handed back as
//! a carry-over string which must be passed to the next call.
//!
//! # Example
//!
//! ```
//! use grantwire::decoder::decode;
//!
//! let (events, carry) = decode("event: writing_start\ndata: {}\n\nevent: wri", "");
//! assert_eq!(events.len(), 1);
//! assert_eq!(carry, "event: wri");
//! ```

mod frame;

pub use frame::{decode, DecodeStats, StreamDecoder, StreamEvent};
