//! Record framing and payload decoding.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded stream record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Value of the record's `event:` line.
    pub event: String,
    /// Parsed `data:` payload. JSON `null` is represented as `None`.
    pub payload: Option<Value>,
}

impl StreamEvent {
    pub fn new(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Read a string field out of an object payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }
}

/// Counters for records the decoder dropped.
///
/// Dropping is never an error; these exist so callers can export them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Records decoded into events.
    pub records: u64,
    /// `data:` lines seen before any `event:` line of their record.
    pub orphan_data: u64,
    /// Records with an `event:` line but no `data:` line.
    pub missing_data: u64,
    /// Records whose payload was not valid JSON.
    pub malformed_payloads: u64,
}

impl DecodeStats {
    /// Total number of dropped records or lines.
    pub fn dropped(&self) -> u64 {
        self.orphan_data + self.missing_data + self.malformed_payloads
    }
}

/// Decode a chunk of stream text.
///
/// `carry` is the carry-over returned by the previous call (empty for the
/// first chunk). Returns the events completed by this chunk, in the order
/// their terminating blank line was seen, and the new carry-over.
pub fn decode(chunk: &str, carry: &str) -> (Vec<StreamEvent>, String) {
    let mut stats = DecodeStats::default();
    decode_counted(chunk, carry, &mut stats)
}

fn decode_counted(chunk: &str, carry: &str, stats: &mut DecodeStats) -> (Vec<StreamEvent>, String) {
    let mut buffer = String::with_capacity(carry.len() + chunk.len());
    buffer.push_str(carry);
    buffer.push_str(chunk);

    let mut events = Vec::new();
    let mut record_start = 0;
    let mut record_lines: Vec<&str> = Vec::new();
    let mut cursor = 0;

    while let Some(newline) = buffer[cursor..].find('\n') {
        let line_end = cursor + newline;
        let line = buffer[cursor..line_end]
            .strip_suffix('\r')
            .unwrap_or(&buffer[cursor..line_end]);
        cursor = line_end + 1;

        if line.is_empty() {
            if !record_lines.is_empty() {
                if let Some(event) = parse_record(&record_lines, stats) {
                    events.push(event);
                }
                record_lines.clear();
            }
            record_start = cursor;
        } else {
            record_lines.push(line);
        }
    }

    let rest = buffer[record_start..].to_string();
    (events, rest)
}

/// Turn the lines of one complete record into an event, if it forms one.
fn parse_record(lines: &[&str], stats: &mut DecodeStats) -> Option<StreamEvent> {
    let mut event: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in lines {
        // Comment line
        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (*line, ""),
        };

        match field {
            "event" => event = Some(value),
            "data" => {
                if event.is_some() {
                    data.push(value);
                } else {
                    stats.orphan_data += 1;
                    tracing::trace!(line = %line, "Dropping data line without event");
                }
            }
            _ => {}
        }
    }

    let event = event?;
    if data.is_empty() {
        stats.missing_data += 1;
        tracing::trace!(event = %event, "Dropping record without data");
        return None;
    }

    let raw = data.join("\n");
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => {
            stats.records += 1;
            let payload = match value {
                Value::Null => None,
                other => Some(other),
            };
            Some(StreamEvent::new(event, payload))
        }
        Err(e) => {
            stats.malformed_payloads += 1;
            let error = SyncError::Decode(e.to_string());
            tracing::trace!(
                event = %event,
                error = %error,
                "Dropping record with malformed payload",
            );
            None
        }
    }
}

/// Stateful wrapper around [`decode`] that owns the carry-over.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    carry: String,
    stats: DecodeStats,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the events it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let carry = std::mem::take(&mut self.carry);
        let (events, rest) = decode_counted(chunk, &carry, &mut self.stats);
        self.carry = rest;
        events
    }

    /// Text of the incomplete trailing record, if any.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Discard the carry-over and counters.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.stats = DecodeStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_record() {
        let (events, carry) = decode("event: eligibility_start\ndata: {}\n\n", "");
        assert_eq!(events, vec![StreamEvent::new("eligibility_start", Some(json!({})))]);
        assert!(carry.is_empty());
    }

    #[test]
    fn test_split_mid_line() {
        let (first, carry) = decode("event: eligibility_chunk\ndata: {\"con", "");
        assert!(first.is_empty());

        let (second, carry) = decode("tent\":\"Yes\"}\n\n", &carry);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload_str("content"), Some("Yes"));
        assert!(carry.is_empty());
    }

    #[test]
    fn test_crlf_split_between_chunks() {
        let (events, carry) = decode("event: writing_end\r\ndata: {}\r", "");
        assert!(events.is_empty());
        let (events, _) = decode("\n\r\n", &carry);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "writing_end");
    }

    #[test]
    fn test_orphan_data_is_dropped() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("data: {\"content\":\"x\"}\n\nevent: writing_end\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "writing_end");
        assert_eq!(decoder.stats().orphan_data, 1);
    }

    #[test]
    fn test_data_before_event_in_same_record() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(concat!(
            "data: {\"a\":1}\n",
            "event: writing_chunk\ndata: {\"content\":\"b\"}\n\n",
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload_str("content"), Some("b"));
        assert_eq!(decoder.stats().orphan_data, 1);
    }

    #[test]
    fn test_malformed_payload_drops_only_that_event() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(
            "event: a\ndata: {not json\n\nevent: b\ndata: {\"ok\":true}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "b");
        assert_eq!(decoder.stats().malformed_payloads, 1);
        assert_eq!(decoder.stats().records, 1);
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("event: writing_start\n\n");
        assert!(events.is_empty());
        assert_eq!(decoder.stats().missing_data, 1);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let (events, _) = decode(": keep-alive\nevent: x\ndata: [1,\ndata: 2]\nid: 7\n\n", "");
        assert_eq!(events, vec![StreamEvent::new("x", Some(json!([1, 2])))]);
    }

    #[test]
    fn test_null_payload_is_none() {
        let (events, _) = decode("event: writing_end\ndata: null\n\n", "");
        assert_eq!(events[0].payload, None);
    }

    #[test]
    fn test_incomplete_record_stays_in_carry() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("event: writing_start\ndata: {}\n");
        assert!(events.is_empty());
        assert_eq!(decoder.pending(), "event: writing_start\ndata: {}\n");

        let events = decoder.feed("\n");
        assert_eq!(events.len(), 1);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_extra_blank_lines_are_ignored() {
        let (events, carry) = decode("\n\n\nevent: a\ndata: 1\n\n\n", "");
        assert_eq!(events.len(), 1);
        assert!(carry.is_empty());
    }
}
