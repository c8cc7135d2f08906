//! Transport seam for the streaming insight request.

use crate::error::{Result, SyncError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often in-memory sources re-check their abort signal while idle.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared flag a controller raises to ask a transport to stop reading.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Incrementally delivered response body.
pub trait ChunkSource: Send {
    /// Block until the next chunk is available.
    ///
    /// Returns `None` at end of body (or once aborted), `Some(Err(_))` on a
    /// transport failure.
    fn next_chunk(&mut self) -> Option<Result<String>>;
}

/// Opens one streaming insight request.
pub trait InsightTransport: Send + Sync {
    fn open(&self, request_id: &str, abort: AbortSignal) -> Result<Box<dyn ChunkSource>>;
}

/// Producer side of an in-memory stream.
#[derive(Clone)]
pub struct ChunkSender {
    sender: Sender<Result<String>>,
}

impl ChunkSender {
    /// Deliver a chunk. Returns false once the reader is gone.
    pub fn send(&self, chunk: impl Into<String>) -> bool {
        self.sender.send(Ok(chunk.into())).is_ok()
    }

    /// Deliver a transport failure.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.sender
            .send(Err(SyncError::Transport(message.into())))
            .is_ok()
    }

    /// End the body.
    pub fn close(self) {}
}

struct ChannelSource {
    receiver: Receiver<Result<String>>,
    abort: AbortSignal,
}

impl ChunkSource for ChannelSource {
    fn next_chunk(&mut self) -> Option<Result<String>> {
        loop {
            if self.abort.is_aborted() {
                return None;
            }
            match self.receiver.recv_timeout(ABORT_POLL_INTERVAL) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// In-memory transport: each request id must be registered with
/// [`ChannelTransport::expect`] before it is opened.
#[derive(Default)]
pub struct ChannelTransport {
    pending: Mutex<HashMap<String, Receiver<Result<String>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `request_id` and return its producer.
    pub fn expect(&self, request_id: impl Into<String>) -> ChunkSender {
        let (sender, receiver) = unbounded();
        self.pending.lock().insert(request_id.into(), receiver);
        ChunkSender { sender }
    }
}

impl InsightTransport for ChannelTransport {
    fn open(&self, request_id: &str, abort: AbortSignal) -> Result<Box<dyn ChunkSource>> {
        let receiver = self.pending.lock().remove(request_id).ok_or_else(|| {
            SyncError::Transport(format!("no stream registered for request {request_id}"))
        })?;
        Ok(Box::new(ChannelSource { receiver, abort }))
    }
}

/// Decode the longest prefix of `pending` that can be decoded now.
///
/// Invalid bytes become U+FFFD. An incomplete sequence at the end stays in
/// `pending` for the next read.
#[cfg_attr(not(feature = "http"), allow(dead_code))]
pub(crate) fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut consumed = 0;

    while consumed < pending.len() {
        let rest = &pending[consumed..];
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                consumed = pending.len();
            }
            Err(e) => {
                text.push_str(&String::from_utf8_lossy(&rest[..e.valid_up_to()]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed += e.valid_up_to() + bad;
                    }
                    None => {
                        consumed += e.valid_up_to();
                        break;
                    }
                }
            }
        }
    }

    pending.drain(..consumed);
    text
}

#[cfg(feature = "http")]
pub use http::HttpInsightTransport;

#[cfg(feature = "http")]
mod http {
    use super::{take_utf8_prefix, AbortSignal, ChunkSource, InsightTransport};
    use crate::config::InsightConfig;
    use crate::error::{Result, SyncError};
    use crate::types::Credential;
    use reqwest::blocking::{Client, Response};
    use reqwest::header::ACCEPT;
    use std::io::Read;
    use std::time::Duration;

    /// Streams insight responses over HTTP.
    pub struct HttpInsightTransport {
        client: Client,
        endpoint: String,
        credential: Option<Credential>,
        read_buffer_bytes: usize,
    }

    impl HttpInsightTransport {
        pub fn new(config: &InsightConfig, credential: Option<Credential>) -> Result<Self> {
            let client = Client::builder()
                .timeout(None::<Duration>)
                .build()
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            Ok(Self {
                client,
                endpoint: config.endpoint.clone(),
                credential,
                read_buffer_bytes: config.read_buffer_bytes.max(64),
            })
        }
    }

    impl InsightTransport for HttpInsightTransport {
        fn open(&self, request_id: &str, abort: AbortSignal) -> Result<Box<dyn ChunkSource>> {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header(ACCEPT, "text/event-stream")
                .json(&serde_json::json!({ "request_id": request_id }));
            if let Some(credential) = &self.credential {
                request = request.bearer_auth(credential.expose());
            }

            let response = request
                .send()
                .and_then(Response::error_for_status)
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            tracing::debug!(request_id, status = %response.status(), "Insight stream opened");

            Ok(Box::new(HttpChunkSource {
                response,
                abort,
                buf: vec![0; self.read_buffer_bytes],
                pending: Vec::new(),
            }))
        }
    }

    struct HttpChunkSource {
        response: Response,
        abort: AbortSignal,
        buf: Vec<u8>,
        /// Bytes of a UTF-8 sequence split across reads.
        pending: Vec<u8>,
    }

    impl ChunkSource for HttpChunkSource {
        fn next_chunk(&mut self) -> Option<Result<String>> {
            loop {
                if self.abort.is_aborted() {
                    return None;
                }

                let n = match self.response.read(&mut self.buf) {
                    Ok(0) => return None,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Some(Err(SyncError::Transport(e.to_string()))),
                };
                self.pending.extend_from_slice(&self.buf[..n]);

                let text = take_utf8_prefix(&mut self.pending);
                if text.is_empty() {
                    continue;
                }
                return Some(Ok(text));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport_delivers_in_order() {
        let transport = ChannelTransport::new();
        let sender = transport.expect("r1");
        sender.send("a");
        sender.send("b");
        sender.close();

        let mut source = transport.open("r1", AbortSignal::new()).unwrap();
        assert_eq!(source.next_chunk().unwrap().unwrap(), "a");
        assert_eq!(source.next_chunk().unwrap().unwrap(), "b");
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn test_unregistered_request_fails_to_open() {
        let transport = ChannelTransport::new();
        let result = transport.open("missing", AbortSignal::new());
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }

    #[test]
    fn test_utf8_split_across_reads() {
        let mut pending = "caf\u{e9}".as_bytes()[..4].to_vec();
        assert_eq!(take_utf8_prefix(&mut pending), "caf");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(take_utf8_prefix(&mut pending), "\u{e9}");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_invalid_byte_keeps_split_char_intact() {
        let mut pending = vec![b'a', 0xFF, b'b', 0xC3];
        assert_eq!(take_utf8_prefix(&mut pending), "a\u{fffd}b");
        assert_eq!(pending, vec![0xC3]);

        pending.extend_from_slice(&[0xA9, 0xFF]);
        assert_eq!(take_utf8_prefix(&mut pending), "\u{e9}\u{fffd}");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_abort_ends_source() {
        let transport = ChannelTransport::new();
        let _sender = transport.expect("r1");
        let abort = AbortSignal::new();
        let mut source = transport.open("r1", abort.clone()).unwrap();

        abort.abort();
        assert!(source.next_chunk().is_none());
    }
}
