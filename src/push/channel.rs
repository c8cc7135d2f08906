//! Persistent push connection with bounded reconnection.

use crate::config::PushConfig;
use crate::error::{Result, SyncError};
use crate::types::Credential;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{Connector, DuplexConnection, Incoming};
use super::registry::{PushCallback, Subscription, SubscriptionRegistry};
use super::types::{ChannelState, PushMessage, PushTopic};

struct Status {
    state: ChannelState,
    credential: Option<Credential>,
    /// Bumped on every `connect` and `disconnect`. A worker only touches
    /// state or delivers messages while its session is current.
    session: u64,
    /// Dropping this wakes the worker out of reads and reconnect waits.
    shutdown: Option<Sender<()>>,
    exhausted: bool,
}

struct Inner {
    status: Mutex<Status>,
    changed: Condvar,
}

/// One persistent, authenticated push connection fanned out to per-topic
/// subscribers.
///
/// Delivery is at-most-once: messages sent while the channel is not
/// connected are lost, and callers that need consistency must refetch after
/// a reconnect.
pub struct PushChannel {
    connector: Arc<dyn Connector>,
    config: PushConfig,
    registry: Arc<SubscriptionRegistry>,
    inner: Arc<Inner>,
}

impl PushChannel {
    pub fn new(connector: Arc<dyn Connector>, config: PushConfig) -> Self {
        Self {
            connector,
            config,
            registry: Arc::new(SubscriptionRegistry::new()),
            inner: Arc::new(Inner {
                status: Mutex::new(Status {
                    state: ChannelState::Disconnected,
                    credential: None,
                    session: 0,
                    shutdown: None,
                    exhausted: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Open the connection in the background.
    ///
    /// A no-op if the channel is already connected (or connecting) with the
    /// same credential. A different credential replaces the connection.
    pub fn connect(&self, credential: Credential) -> Result<()> {
        let (session, shutdown_rx) = {
            let mut status = self.inner.status.lock();
            if !status.state.is_disconnected() && status.credential.as_ref() == Some(&credential) {
                tracing::trace!(
                    credential = %credential.fingerprint(),
                    "Push channel already connected",
                );
                return Ok(());
            }
            if !status.state.is_disconnected() {
                tracing::debug!("Replacing push connection for new credential");
            }

            let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
            status.session += 1;
            status.state = ChannelState::Connecting;
            status.credential = Some(credential.clone());
            status.shutdown = Some(shutdown_tx);
            status.exhausted = false;
            (status.session, shutdown_rx)
        };
        self.inner.changed.notify_all();

        tracing::debug!(credential = %credential.fingerprint(), session, "Connecting push channel");

        let worker = Worker {
            connector: Arc::clone(&self.connector),
            registry: Arc::clone(&self.registry),
            inner: Arc::clone(&self.inner),
            credential,
            session,
            shutdown: shutdown_rx,
            max_attempts: self.config.max_reconnect_attempts,
            delay: self.config.reconnect_delay(),
        };

        let spawned = std::thread::Builder::new()
            .name("push-channel".to_string())
            .spawn(move || worker.run());

        if let Err(e) = spawned {
            let mut status = self.inner.status.lock();
            if status.session == session {
                status.state = ChannelState::Disconnected;
                status.shutdown = None;
            }
            drop(status);
            self.inner.changed.notify_all();
            return Err(SyncError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Tear down the connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        {
            let mut status = self.inner.status.lock();
            status.session += 1;
            if !status.state.is_disconnected() {
                tracing::debug!("Push channel disconnected");
            }
            status.state = ChannelState::Disconnected;
            status.credential = None;
            status.shutdown = None;
        }
        self.inner.changed.notify_all();
    }

    /// Register `callback` for `topic`.
    pub fn subscribe<F>(&self, topic: PushTopic, callback: F) -> Subscription
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let callback: PushCallback = Arc::new(callback);
        self.registry.subscribe(topic, callback)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.status.lock().state
    }

    /// Whether the last connection gave up after exhausting its reconnect
    /// attempts. Cleared by the next `connect`.
    pub fn reconnect_exhausted(&self) -> bool {
        self.inner.status.lock().exhausted
    }

    pub fn subscriber_count(&self, topic: PushTopic) -> usize {
        self.registry.subscriber_count(topic)
    }

    /// Block until `predicate` holds for the channel state, or the timeout
    /// elapses. Returns whether the predicate held.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(ChannelState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.inner.status.lock();
        loop {
            if predicate(status.state) {
                return true;
            }
            if self
                .inner
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                return predicate(status.state);
            }
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Why a read loop ended.
enum ReadEnd {
    Shutdown,
    Lost(String),
}

/// Background connection owner for one session.
struct Worker {
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    inner: Arc<Inner>,
    credential: Credential,
    session: u64,
    shutdown: Receiver<()>,
    max_attempts: u32,
    delay: Duration,
}

impl Worker {
    fn run(self) {
        // Reconnect attempts since the last successful connection.
        let mut attempt = 0u32;

        loop {
            if !self.is_current() {
                return;
            }

            match self.connector.connect(&self.credential) {
                Ok(mut connection) => {
                    attempt = 0;
                    if !self.set_state(ChannelState::Connected) {
                        connection.close();
                        return;
                    }
                    tracing::debug!(session = self.session, "Push channel connected");

                    let end = self.read_loop(connection.as_mut());
                    connection.close();
                    match end {
                        ReadEnd::Shutdown => return,
                        ReadEnd::Lost(reason) => {
                            tracing::warn!(
                                session = self.session,
                                reason = %reason,
                                "Push connection lost",
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session = self.session,
                        attempt,
                        error = %e,
                        "Push connect failed",
                    );
                }
            }

            if attempt >= self.max_attempts {
                let error = SyncError::ReconnectExhausted { attempts: attempt };
                tracing::warn!(session = self.session, error = %error, "Push channel giving up");
                self.give_up();
                return;
            }

            attempt += 1;
            if !self.set_state(ChannelState::Reconnecting { attempt }) {
                return;
            }
            if self.wait_delay() {
                return;
            }
        }
    }

    fn read_loop(&self, connection: &mut dyn DuplexConnection) -> ReadEnd {
        loop {
            if self.shutdown_requested() || !self.is_current() {
                return ReadEnd::Shutdown;
            }

            match connection.recv() {
                Ok(Incoming::Message(message)) => {
                    if !self.is_current() {
                        return ReadEnd::Shutdown;
                    }
                    let delivered = self.registry.dispatch(&message);
                    tracing::trace!(topic = %message.topic, delivered, "Push message dispatched");
                }
                Ok(Incoming::Idle) => {}
                Ok(Incoming::Closed) => return ReadEnd::Lost("closed by peer".to_string()),
                Err(SyncError::InvalidFrame(reason)) => {
                    tracing::debug!(reason = %reason, "Dropping undecodable push frame");
                }
                Err(e) => return ReadEnd::Lost(e.to_string()),
            }
        }
    }

    fn is_current(&self) -> bool {
        self.inner.status.lock().session == self.session
    }

    fn shutdown_requested(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for the reconnect delay. Returns true if shutdown was requested
    /// in the meantime.
    fn wait_delay(&self) -> bool {
        !matches!(
            self.shutdown.recv_timeout(self.delay),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn set_state(&self, state: ChannelState) -> bool {
        {
            let mut status = self.inner.status.lock();
            if status.session != self.session {
                return false;
            }
            status.state = state;
        }
        self.inner.changed.notify_all();
        true
    }

    fn give_up(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.session != self.session {
                return;
            }
            status.state = ChannelState::Disconnected;
            status.shutdown = None;
            status.exhausted = true;
        }
        self.inner.changed.notify_all();
    }
}
