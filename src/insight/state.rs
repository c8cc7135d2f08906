//! Content buffers and the pure transition functions that drive them.

use crate::decoder::StreamEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message stored when the transport ends before every topic finished.
pub const STREAM_CLOSED_EARLY: &str = "stream closed before completion";

/// Message stored when an `error` event carries no message.
const UNKNOWN_STREAM_ERROR: &str = "unknown stream error";

/// A named sub-stream of the insight response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightTopic {
    Eligibility,
    Writing,
}

impl InsightTopic {
    pub const ALL: [InsightTopic; 2] = [InsightTopic::Eligibility, InsightTopic::Writing];

    pub fn name(self) -> &'static str {
        match self {
            InsightTopic::Eligibility => "eligibility",
            InsightTopic::Writing => "writing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "eligibility" => Some(InsightTopic::Eligibility),
            "writing" => Some(InsightTopic::Writing),
            _ => None,
        }
    }
}

impl fmt::Display for InsightTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of one content buffer. Transitions only move forward:
/// `Idle -> Loading -> {Done, Error}` (and `Idle -> Error`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Idle,
    Loading,
    Done,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamStatus::Done | StreamStatus::Error)
    }
}

/// Accumulated text and status for one topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentBuffer {
    pub topic: InsightTopic,
    pub text: String,
    pub status: StreamStatus,
    /// Set when `status` is `Error`.
    pub error: Option<String>,
}

impl ContentBuffer {
    pub fn new(topic: InsightTopic) -> Self {
        Self {
            topic,
            text: String::new(),
            status: StreamStatus::Idle,
            error: None,
        }
    }

    fn begin(&mut self) -> bool {
        if self.status != StreamStatus::Idle {
            return false;
        }
        self.status = StreamStatus::Loading;
        self.text.clear();
        true
    }

    fn append(&mut self, content: &str) -> bool {
        match self.status {
            StreamStatus::Idle => {
                self.status = StreamStatus::Loading;
            }
            StreamStatus::Loading => {}
            StreamStatus::Done | StreamStatus::Error => return false,
        }
        self.text.push_str(content);
        true
    }

    fn finish(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StreamStatus::Done;
        true
    }

    fn fail(&mut self, message: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StreamStatus::Error;
        self.error = Some(message.to_string());
        true
    }
}

/// A stream event interpreted against the insight protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum InsightEvent {
    Start(InsightTopic),
    Chunk(InsightTopic, String),
    End(InsightTopic),
    Error(String),
    /// Anything this protocol does not recognize.
    Ignored,
}

impl InsightEvent {
    pub fn from_stream_event(event: &StreamEvent) -> Self {
        if event.event == "error" {
            let message = event.payload_str("message").unwrap_or(UNKNOWN_STREAM_ERROR);
            return InsightEvent::Error(message.to_string());
        }

        let Some((topic, phase)) = event.event.rsplit_once('_') else {
            return InsightEvent::Ignored;
        };
        let Some(topic) = InsightTopic::from_name(topic) else {
            return InsightEvent::Ignored;
        };

        match phase {
            "start" => InsightEvent::Start(topic),
            "end" => InsightEvent::End(topic),
            "chunk" => match event.payload_str("content") {
                Some(content) => InsightEvent::Chunk(topic, content.to_string()),
                None => InsightEvent::Ignored,
            },
            _ => InsightEvent::Ignored,
        }
    }
}

/// Both content buffers of one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsightState {
    pub eligibility: ContentBuffer,
    pub writing: ContentBuffer,
}

impl Default for InsightState {
    fn default() -> Self {
        Self {
            eligibility: ContentBuffer::new(InsightTopic::Eligibility),
            writing: ContentBuffer::new(InsightTopic::Writing),
        }
    }
}

impl InsightState {
    pub fn buffer(&self, topic: InsightTopic) -> &ContentBuffer {
        match topic {
            InsightTopic::Eligibility => &self.eligibility,
            InsightTopic::Writing => &self.writing,
        }
    }

    fn buffer_mut(&mut self, topic: InsightTopic) -> &mut ContentBuffer {
        match topic {
            InsightTopic::Eligibility => &mut self.eligibility,
            InsightTopic::Writing => &mut self.writing,
        }
    }

    /// True once every topic reached `Done` or `Error`.
    pub fn is_settled(&self) -> bool {
        self.eligibility.status.is_terminal() && self.writing.status.is_terminal()
    }

    /// True if no topic has left `Idle` yet.
    pub fn is_untouched(&self) -> bool {
        self.eligibility.status == StreamStatus::Idle && self.writing.status == StreamStatus::Idle
    }
}

/// Apply one protocol event. Returns whether anything changed.
pub fn apply_event(state: &mut InsightState, event: &InsightEvent) -> bool {
    match event {
        InsightEvent::Start(topic) => state.buffer_mut(*topic).begin(),
        InsightEvent::Chunk(topic, content) => state.buffer_mut(*topic).append(content),
        InsightEvent::End(topic) => state.buffer_mut(*topic).finish(),
        InsightEvent::Error(message) => fail_all(state, message),
        InsightEvent::Ignored => false,
    }
}

/// Mark every topic that has not finished as failed.
pub fn apply_transport_failure(state: &mut InsightState, message: &str) -> bool {
    fail_all(state, message)
}

fn fail_all(state: &mut InsightState, message: &str) -> bool {
    let eligibility = state.eligibility.fail(message);
    let writing = state.writing.fail(message);
    eligibility || writing
}
