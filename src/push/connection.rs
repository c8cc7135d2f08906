//! Duplex connection seam for the push channel.

use crate::error::{Result, SyncError};
use crate::types::Credential;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::types::PushMessage;

/// Result of one read from a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Message(PushMessage),
    /// Nothing arrived within the read poll interval, or the frame was for
    /// an unknown topic.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// A live, authenticated connection.
pub trait DuplexConnection: Send {
    /// Wait up to the connection's poll interval for the next frame.
    ///
    /// `Err(SyncError::InvalidFrame)` reports a frame that could not be
    /// decoded; the connection stays usable. Any other error means the
    /// connection is lost.
    fn recv(&mut self) -> Result<Incoming>;

    /// Close the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Opens connections authenticated with a credential.
pub trait Connector: Send + Sync {
    fn connect(&self, credential: &Credential) -> Result<Box<dyn DuplexConnection>>;
}

/// Server-side frame for the in-memory connector.
#[derive(Clone, Debug)]
enum ServerFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Server half of an in-memory connection.
#[derive(Clone)]
pub struct PushServer {
    sender: Sender<ServerFrame>,
}

impl PushServer {
    /// Push a message. Returns false once the client side is gone.
    pub fn push(&self, message: &PushMessage) -> bool {
        match message.encode_text() {
            Ok(text) => self.sender.send(ServerFrame::Text(text)).is_ok(),
            Err(_) => false,
        }
    }

    /// Push a message as a MessagePack frame.
    pub fn push_binary(&self, message: &PushMessage) -> bool {
        match message.encode_binary() {
            Ok(bytes) => self.sender.send(ServerFrame::Binary(bytes)).is_ok(),
            Err(_) => false,
        }
    }

    /// Push an arbitrary text frame.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        self.sender.send(ServerFrame::Text(text.into())).is_ok()
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        let _ = self.sender.send(ServerFrame::Close);
    }
}

struct ChannelConnection {
    receiver: Receiver<ServerFrame>,
    poll: Duration,
    closed: bool,
}

impl DuplexConnection for ChannelConnection {
    fn recv(&mut self) -> Result<Incoming> {
        if self.closed {
            return Ok(Incoming::Closed);
        }
        let decoded = match self.receiver.recv_timeout(self.poll) {
            Ok(ServerFrame::Text(text)) => PushMessage::decode_text(&text)?,
            Ok(ServerFrame::Binary(bytes)) => PushMessage::decode_binary(&bytes)?,
            Ok(ServerFrame::Close) | Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                return Ok(Incoming::Closed);
            }
            Err(RecvTimeoutError::Timeout) => return Ok(Incoming::Idle),
        };
        Ok(decoded.map_or(Incoming::Idle, Incoming::Message))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// In-memory connector. Every accepted connection produces a
/// [`PushServer`] retrievable through [`ChannelConnector::accepted`].
pub struct ChannelConnector {
    poll: Duration,
    attempts: AtomicU32,
    failures_remaining: Mutex<u32>,
    refuse_all: Mutex<bool>,
    accepted_tx: Sender<PushServer>,
    accepted_rx: Receiver<PushServer>,
    credentials: Mutex<Vec<Credential>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::with_poll(Duration::from_millis(10))
    }

    pub fn with_poll(poll: Duration) -> Self {
        let (accepted_tx, accepted_rx) = unbounded();
        Self {
            poll,
            attempts: AtomicU32::new(0),
            failures_remaining: Mutex::new(0),
            refuse_all: Mutex::new(false),
            accepted_tx,
            accepted_rx,
            credentials: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    /// Refuse every connection attempt until turned off again.
    pub fn refuse_all(&self, refuse: bool) {
        *self.refuse_all.lock() = refuse;
    }

    /// Total connection attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Credentials presented on successful connects, oldest first.
    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.lock().clone()
    }

    /// Wait for the next accepted connection.
    pub fn accepted(&self, timeout: Duration) -> Option<PushServer> {
        self.accepted_rx.recv_timeout(timeout).ok()
    }
}

impl Default for ChannelConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ChannelConnector {
    fn connect(&self, credential: &Credential) -> Result<Box<dyn DuplexConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if *self.refuse_all.lock() {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Transport("connection refused".to_string()));
            }
        }

        let (sender, receiver) = unbounded();
        self.credentials.lock().push(credential.clone());
        let _ = self.accepted_tx.send(PushServer { sender });

        Ok(Box::new(ChannelConnection {
            receiver,
            poll: self.poll,
            closed: false,
        }))
    }
}

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use super::{Connector, DuplexConnection, Incoming};
    use crate::config::PushConfig;
    use crate::error::{Result, SyncError};
    use crate::push::types::PushMessage;
    use crate::types::Credential;
    use std::io::{self, ErrorKind};
    use std::net::TcpStream;
    use std::time::Duration;
    use tungstenite::client::IntoClientRequest;
    use tungstenite::http::header::AUTHORIZATION;
    use tungstenite::http::HeaderValue;
    use tungstenite::stream::MaybeTlsStream;
    use tungstenite::{Message, WebSocket};

    /// Connects to the push endpoint over WebSocket.
    pub struct WebSocketConnector {
        url: String,
        read_poll: Duration,
    }

    impl WebSocketConnector {
        pub fn new(config: &PushConfig) -> Self {
            Self {
                url: config.url.clone(),
                read_poll: config.read_poll(),
            }
        }
    }

    impl Connector for WebSocketConnector {
        fn connect(&self, credential: &Credential) -> Result<Box<dyn DuplexConnection>> {
            let mut request = self
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| SyncError::Config(e.to_string()))?;
            let header = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
                .map_err(|e| SyncError::Config(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, header);

            let (socket, _response) =
                tungstenite::connect(request).map_err(|e| SyncError::Transport(e.to_string()))?;

            // Bounded reads let the worker notice disconnects.
            set_read_timeout(socket.get_ref(), self.read_poll)
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            Ok(Box::new(WebSocketConnection {
                socket,
                closed: false,
            }))
        }
    }

    fn set_read_timeout(stream: &MaybeTlsStream<TcpStream>, timeout: Duration) -> io::Result<()> {
        match stream {
            MaybeTlsStream::Plain(tcp) => tcp.set_read_timeout(Some(timeout)),
            MaybeTlsStream::Rustls(tls) => tls.get_ref().set_read_timeout(Some(timeout)),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "read timeout not supported for this TLS backend",
            )),
        }
    }

    struct WebSocketConnection {
        socket: WebSocket<MaybeTlsStream<TcpStream>>,
        closed: bool,
    }

    impl DuplexConnection for WebSocketConnection {
        fn recv(&mut self) -> Result<Incoming> {
            if self.closed {
                return Ok(Incoming::Closed);
            }
            let decoded = match self.socket.read() {
                Ok(Message::Text(text)) => PushMessage::decode_text(&text)?,
                Ok(Message::Binary(bytes)) => PushMessage::decode_binary(&bytes)?,
                Ok(Message::Close(_)) => {
                    self.closed = true;
                    return Ok(Incoming::Closed);
                }
                Ok(_) => None,
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    None
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed = true;
                    return Ok(Incoming::Closed);
                }
                Err(e) => return Err(SyncError::Transport(e.to_string())),
            };
            Ok(decoded.map_or(Incoming::Idle, Incoming::Message))
        }

        fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            let _ = self.socket.close(None);
            let _ = self.socket.flush();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::push::types::PushTopic;
        use std::net::TcpListener;
        use std::time::Instant;

        #[test]
        fn test_recv_polls_instead_of_blocking() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let server = std::thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut socket = tungstenite::accept(stream).unwrap();
                std::thread::sleep(Duration::from_millis(150));
                let frame = PushMessage::new(PushTopic::NewMatch, serde_json::json!({"id": "g1"}));
                socket.send(Message::Text(frame.encode_text().unwrap())).unwrap();
                while socket.read().is_ok() {}
            });

            let connector = WebSocketConnector::new(&PushConfig {
                url: format!("ws://{addr}/push"),
                read_poll_ms: 20,
                ..Default::default()
            });
            let mut connection = connector.connect(&Credential::new("token")).unwrap();

            let started = Instant::now();
            assert_eq!(connection.recv().unwrap(), Incoming::Idle);
            assert!(started.elapsed() < Duration::from_millis(150));

            let deadline = Instant::now() + Duration::from_secs(2);
            let message = loop {
                match connection.recv().unwrap() {
                    Incoming::Message(message) => break message,
                    Incoming::Idle if Instant::now() < deadline => continue,
                    other => panic!("unexpected {other:?}"),
                }
            };
            assert_eq!(message.topic, PushTopic::NewMatch);

            connection.close();
            drop(connection);
            server.join().unwrap();
        }
    }
}
