//! Controller for one multiplexed insight request at a time.

use crate::decoder::StreamDecoder;
use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::state::{
    apply_event, apply_transport_failure, ContentBuffer, InsightEvent, InsightState, InsightTopic,
    STREAM_CLOSED_EARLY,
};
use super::transport::{AbortSignal, ChunkSource, InsightTransport};

/// State shared between the controller and its active run.
struct Shared {
    /// Bumped on every `start` and `cancel`. A run only mutates state while
    /// its own generation is still current.
    generation: u64,
    state: InsightState,
    request_id: Option<String>,
    active: bool,
    abort: Option<AbortSignal>,
}

struct Inner {
    shared: Mutex<Shared>,
    changed: Condvar,
}

/// Point-in-time view of the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct InsightSnapshot {
    pub request_id: Option<String>,
    pub generation: u64,
    pub active: bool,
    pub state: InsightState,
}

impl InsightSnapshot {
    pub fn buffer(&self, topic: InsightTopic) -> &ContentBuffer {
        self.state.buffer(topic)
    }
}

/// Outcome of one [`InsightRun::pump`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pump {
    /// A chunk was consumed; `events` protocol events were decoded from it.
    Continue { events: usize },
    /// The run ended: both topics settled, or the body ended.
    Finished,
    /// The run was superseded by `cancel` or a newer `start`.
    Cancelled,
}

/// Drives a multiplexed insight request into two content buffers.
///
/// At most one request is active per controller. Starting a new request
/// cancels the previous one.
pub struct InsightStreamController {
    transport: Arc<dyn InsightTransport>,
    inner: Arc<Inner>,
}

impl InsightStreamController {
    pub fn new(transport: Arc<dyn InsightTransport>) -> Self {
        Self {
            transport,
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    generation: 0,
                    state: InsightState::default(),
                    request_id: None,
                    active: false,
                    abort: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Start a request, resetting both buffers.
    ///
    /// The returned run must be driven (`pump`, `run` or `spawn`) for chunks
    /// to be consumed. If the transport cannot be opened, both topics are
    /// marked failed and the error is returned.
    pub fn start(&self, request_id: impl Into<String>) -> Result<InsightRun> {
        let request_id = request_id.into();
        let abort = AbortSignal::new();

        let generation = {
            let mut shared = self.inner.shared.lock();
            if shared.active {
                tracing::debug!(
                    previous = ?shared.request_id,
                    "Cancelling active insight request for new start"
                );
            }
            if let Some(previous) = shared.abort.take() {
                previous.abort();
            }
            shared.generation += 1;
            shared.state = InsightState::default();
            shared.request_id = Some(request_id.clone());
            shared.active = true;
            shared.abort = Some(abort.clone());
            shared.generation
        };
        self.inner.changed.notify_all();

        tracing::debug!(request_id = %request_id, generation, "Starting insight request");

        match self.transport.open(&request_id, abort) {
            Ok(source) => Ok(InsightRun {
                inner: Arc::clone(&self.inner),
                generation,
                request_id,
                source,
                decoder: StreamDecoder::new(),
                finished: false,
            }),
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    error = %e,
                    "Insight transport failed to open",
                );
                let mut shared = self.inner.shared.lock();
                if shared.generation == generation {
                    apply_transport_failure(&mut shared.state, &e.to_string());
                    shared.active = false;
                    shared.abort = None;
                }
                drop(shared);
                self.inner.changed.notify_all();
                Err(e)
            }
        }
    }

    /// Cancel the active request, if any. Callable in any state.
    ///
    /// Buffers are reset to idle and nothing read afterwards by the
    /// cancelled run is applied.
    pub fn cancel(&self) {
        {
            let mut shared = self.inner.shared.lock();
            shared.generation += 1;
            if let Some(abort) = shared.abort.take() {
                abort.abort();
            }
            if shared.active {
                tracing::debug!(request_id = ?shared.request_id, "Insight request cancelled");
            }
            shared.active = false;
            shared.state = InsightState::default();
        }
        self.inner.changed.notify_all();
    }

    pub fn snapshot(&self) -> InsightSnapshot {
        let shared = self.inner.shared.lock();
        InsightSnapshot {
            request_id: shared.request_id.clone(),
            generation: shared.generation,
            active: shared.active,
            state: shared.state.clone(),
        }
    }

    pub fn buffer(&self, topic: InsightTopic) -> ContentBuffer {
        self.inner.shared.lock().state.buffer(topic).clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared.lock().active
    }

    pub fn request_id(&self) -> Option<String> {
        self.inner.shared.lock().request_id.clone()
    }

    /// Block until `predicate` holds for the current snapshot, or the
    /// timeout elapses. Returns whether the predicate held.
    pub fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&InsightSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut shared = self.inner.shared.lock();
        loop {
            let snapshot = InsightSnapshot {
                request_id: shared.request_id.clone(),
                generation: shared.generation,
                active: shared.active,
                state: shared.state.clone(),
            };
            if predicate(&snapshot) {
                return true;
            }
            if self
                .inner
                .changed
                .wait_until(&mut shared, deadline)
                .timed_out()
            {
                return false;
            }
        }
    }
}

impl Drop for InsightStreamController {
    fn drop(&mut self) {
        if let Some(abort) = self.inner.shared.lock().abort.take() {
            abort.abort();
        }
    }
}

/// The consuming half of a started request.
pub struct InsightRun {
    inner: Arc<Inner>,
    generation: u64,
    request_id: String,
    source: Box<dyn ChunkSource>,
    decoder: StreamDecoder,
    finished: bool,
}

impl InsightRun {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read one chunk from the transport and apply the events it completes.
    ///
    /// The read happens without holding the state lock; the generation is
    /// re-checked under the lock before anything is applied.
    pub fn pump(&mut self) -> Result<Pump> {
        if self.finished {
            return Ok(Pump::Finished);
        }
        if self.inner.shared.lock().generation != self.generation {
            self.finished = true;
            return Ok(Pump::Cancelled);
        }

        let next = self.source.next_chunk();

        let inner = Arc::clone(&self.inner);
        let mut shared = inner.shared.lock();
        if shared.generation != self.generation {
            self.finished = true;
            tracing::trace!(
                request_id = %self.request_id,
                "Discarding read from cancelled request",
            );
            return Ok(Pump::Cancelled);
        }

        let outcome = match next {
            Some(Ok(chunk)) => {
                let events = self.decoder.feed(&chunk);
                let count = events.len();
                for event in &events {
                    let event = InsightEvent::from_stream_event(event);
                    if let InsightEvent::Error(message) = &event {
                        let error = SyncError::Stream(message.clone());
                        tracing::warn!(
                            request_id = %self.request_id,
                            error = %error,
                            "Insight stream reported error",
                        );
                    }
                    apply_event(&mut shared.state, &event);
                }
                if shared.state.is_settled() {
                    self.settle(&mut shared);
                    Ok(Pump::Finished)
                } else {
                    Ok(Pump::Continue { events: count })
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    error = %e,
                    "Insight transport failed",
                );
                apply_transport_failure(&mut shared.state, &e.to_string());
                self.settle(&mut shared);
                Err(e)
            }
            None => {
                if !shared.state.is_settled() {
                    tracing::warn!(request_id = %self.request_id, "Insight stream ended early");
                    apply_transport_failure(
                        &mut shared.state,
                        &SyncError::Transport(STREAM_CLOSED_EARLY.to_string()).to_string(),
                    );
                }
                self.settle(&mut shared);
                Ok(Pump::Finished)
            }
        };

        drop(shared);
        inner.changed.notify_all();
        outcome
    }

    fn settle(&mut self, shared: &mut Shared) {
        self.finished = true;
        shared.active = false;
        shared.abort = None;

        let stats = self.decoder.stats();
        if stats.dropped() > 0 {
            tracing::debug!(
                request_id = %self.request_id,
                orphan_data = stats.orphan_data,
                missing_data = stats.missing_data,
                malformed = stats.malformed_payloads,
                "Insight stream dropped records"
            );
        }
    }

    /// Pump until the run finishes or is cancelled.
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.pump()? {
                Pump::Continue { .. } => continue,
                Pump::Finished | Pump::Cancelled => return Ok(()),
            }
        }
    }

    /// Drive the run on a dedicated thread.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        std::thread::spawn(move || self.run())
    }
}
