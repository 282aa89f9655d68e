//! Connection lifecycle management.
//!
//! `ConnectionManager` owns one transport connection and drives it through
//! a fixed state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          ^                    |
//!      |                          | backoff expired    | heartbeat timeout
//!      |                          |                    | or transport close
//!      |                     Reconnecting <------------+
//!      |                          |
//!      +---- disconnect() ---+    | attempts exhausted
//!           (from any state)      v
//!                               Failed
//! ```
//!
//! Backoff doubles per failed attempt up to a cap; once attempts are
//! exhausted the manager stays in `Failed` and never retries on its own.
//! `disconnect()` cancels any pending reconnect timer before returning, so
//! no stale attempt fires afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, SyncError};
use crate::protocol::Envelope;
use crate::transport::{Frame, Transport, TransportLink};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Owns one transport connection, its heartbeats and its reconnect loop.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<ConnectionState>>,
    /// Consecutive failed attempts in the current reconnect series
    attempt: Arc<AtomicU32>,
    last_error: Arc<RwLock<Option<String>>>,
    status_tx: broadcast::Sender<ConnectionState>,
    message_tx: broadcast::Sender<Envelope>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    protocol_errors: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        let (message_tx, _) = broadcast::channel(1000);

        Self {
            config,
            transport,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            attempt: Arc::new(AtomicU32::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            status_tx,
            message_tx,
            outbound_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
            protocol_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Last transport-level failure, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Consecutive failed attempts in the current reconnect series.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Malformed envelopes dropped so far.
    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::SeqCst)
    }

    /// Get a receiver for state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    /// Get a receiver for inbound envelopes.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.message_tx.subscribe()
    }

    /// Open the connection as `user_id`, optionally scoped to a group.
    ///
    /// Resolves once the connection is established, or with a connection
    /// error after reconnect attempts are exhausted. While attempts remain
    /// the manager keeps retrying with exponential backoff on its own.
    pub async fn connect(&self, user_id: impl Into<String>, group_id: Option<String>) -> Result<()> {
        let current = self.state().await;
        if matches!(
            current,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return Err(SyncError::State(format!(
                "connect() while connection is {}",
                current
            )));
        }

        *self.last_error.write().await = None;
        self.attempt.store(0, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.outbound_tx.lock().await = Some(outbound_tx);

        // Subscribe before spawning so the first transition cannot be missed.
        let mut status_rx = self.status_tx.subscribe();

        let conn_loop = ConnLoop {
            config: self.config.clone(),
            transport: self.transport.clone(),
            user_id: user_id.into(),
            group_id,
            state: self.state.clone(),
            attempt: self.attempt.clone(),
            last_error: self.last_error.clone(),
            status_tx: self.status_tx.clone(),
            message_tx: self.message_tx.clone(),
            protocol_errors: self.protocol_errors.clone(),
            shutdown_rx,
            outbound_rx,
        };
        *self.task.lock().await = Some(tokio::spawn(conn_loop.run()));

        loop {
            match status_rx.recv().await {
                Ok(ConnectionState::Connected) => return Ok(()),
                Ok(ConnectionState::Failed) => {
                    let reason = self
                        .last_error()
                        .await
                        .unwrap_or_else(|| "reconnect attempts exhausted".to_string());
                    return Err(SyncError::Connection(reason));
                }
                Ok(ConnectionState::Disconnected) => {
                    return Err(SyncError::Connection(
                        "cancelled by disconnect".to_string(),
                    ));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => match self.state().await {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed => {
                        let reason = self
                            .last_error()
                            .await
                            .unwrap_or_else(|| "reconnect attempts exhausted".to_string());
                        return Err(SyncError::Connection(reason));
                    }
                    _ => continue,
                },
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::Connection(
                        "connection task ended unexpectedly".to_string(),
                    ));
                }
            }
        }
    }

    /// Tear the connection down and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let shutdown = self.shutdown_tx.lock().await.take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        *self.outbound_tx.lock().await = None;

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }

        // The loop exits as Disconnected on shutdown; a loop that already
        // ended in Failed still becomes Disconnected on explicit request.
        transition(&self.state, &self.status_tx, ConnectionState::Disconnected).await;
    }

    /// Queue an envelope for delivery. Fails with `NotConnected` unless the
    /// connection is currently established.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        match self.outbound_tx.lock().await.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }
}

async fn transition(
    state: &RwLock<ConnectionState>,
    status_tx: &broadcast::Sender<ConnectionState>,
    next: ConnectionState,
) {
    let mut guard = state.write().await;
    if *guard == next {
        return;
    }
    let previous = *guard;
    *guard = next;
    drop(guard);

    info!(from = %previous, to = %next, "Connection state changed");
    let _ = status_tx.send(next);
}

enum Establish {
    Link(Box<dyn TransportLink>),
    Failed(String),
    Shutdown,
}

enum ListenEnd {
    Lost(String),
    Shutdown,
}

/// The per-`connect()` task driving the reconnect loop.
struct ConnLoop {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    user_id: String,
    group_id: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    attempt: Arc<AtomicU32>,
    last_error: Arc<RwLock<Option<String>>>,
    status_tx: broadcast::Sender<ConnectionState>,
    message_tx: broadcast::Sender<Envelope>,
    protocol_errors: Arc<AtomicU64>,
    shutdown_rx: broadcast::Receiver<()>,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ConnLoop {
    async fn run(mut self) {
        let mut attempts = 0u32;

        let stopped_by_shutdown = loop {
            if self.shutdown_rx.try_recv().is_ok() {
                break true;
            }

            self.transition(ConnectionState::Connecting).await;

            match self.establish().await {
                Establish::Shutdown => break true,
                Establish::Failed(reason) => {
                    warn!(error = %reason, attempt = attempts + 1, "Connection attempt failed");
                    *self.last_error.write().await = Some(reason);
                    attempts += 1;
                    self.attempt.store(attempts, Ordering::SeqCst);

                    if attempts >= self.config.max_reconnect_attempts {
                        error!(attempts, "Reconnect attempts exhausted");
                        self.transition(ConnectionState::Failed).await;
                        break false;
                    }

                    self.transition(ConnectionState::Reconnecting).await;
                    let delay = self.config.backoff_delay(attempts);
                    debug!(?delay, attempt = attempts, "Backing off before reconnect");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown_rx.recv() => break true,
                    }
                }
                Establish::Link(link) => {
                    attempts = 0;
                    self.attempt.store(0, Ordering::SeqCst);
                    self.transition(ConnectionState::Connected).await;

                    match self.listen(link).await {
                        ListenEnd::Shutdown => break true,
                        ListenEnd::Lost(reason) => {
                            warn!(error = %reason, "Connection lost");
                            *self.last_error.write().await = Some(reason);
                            self.transition(ConnectionState::Reconnecting).await;
                            tokio::select! {
                                _ = sleep(self.config.backoff_delay(1)) => {}
                                _ = self.shutdown_rx.recv() => break true,
                            }
                        }
                    }
                }
            }
        };

        if stopped_by_shutdown {
            self.transition(ConnectionState::Disconnected).await;
            info!("Connection manager stopped");
        }
    }

    async fn establish(&mut self) -> Establish {
        debug!(url = %self.config.url, "Connecting to collaboration server");
        tokio::select! {
            _ = self.shutdown_rx.recv() => Establish::Shutdown,
            result = tokio::time::timeout(self.config.connect_timeout, self.transport.connect()) => {
                match result {
                    Ok(Ok(link)) => Establish::Link(link),
                    Ok(Err(e)) => Establish::Failed(e.to_string()),
                    Err(_) => Establish::Failed(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    )),
                }
            }
        }
    }

    async fn listen(&mut self, mut link: Box<dyn TransportLink>) -> ListenEnd {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let dead_after = self.config.heartbeat_interval * 2;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    link.close().await;
                    return ListenEnd::Shutdown;
                }

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > dead_after {
                        return ListenEnd::Lost(format!(
                            "no inbound traffic for over {:?}",
                            dead_after
                        ));
                    }
                    let envelope = Envelope::heartbeat(
                        self.user_id.clone(),
                        self.group_id.clone(),
                    );
                    match envelope.encode() {
                        Ok(text) => {
                            if let Err(e) = link.send(text).await {
                                return ListenEnd::Lost(format!("heartbeat send failed: {}", e));
                            }
                            debug!("Sent heartbeat");
                        }
                        Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
                    }
                }

                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(envelope) => match envelope.encode() {
                            Ok(text) => {
                                if let Err(e) = link.send(text).await {
                                    return ListenEnd::Lost(format!("send failed: {}", e));
                                }
                            }
                            Err(e) => {
                                self.protocol_errors.fetch_add(1, Ordering::SeqCst);
                                warn!(error = %e, "Failed to encode outbound envelope");
                            }
                        },
                        None => return ListenEnd::Lost("outbound channel closed".to_string()),
                    }
                }

                frame = link.recv() => {
                    match frame {
                        Some(Frame::Text(text)) => {
                            last_inbound = Instant::now();
                            match Envelope::decode(&text) {
                                Ok(envelope) => {
                                    let _ = self.message_tx.send(envelope);
                                }
                                Err(e) => {
                                    self.protocol_errors.fetch_add(1, Ordering::SeqCst);
                                    warn!(error = %e, "Dropping malformed envelope");
                                }
                            }
                        }
                        Some(Frame::Keepalive) => {
                            last_inbound = Instant::now();
                            debug!("Received keepalive");
                        }
                        None => return ListenEnd::Lost("transport closed".to_string()),
                    }
                }
            }
        }
    }

    async fn transition(&self, next: ConnectionState) {
        transition(&self.state, &self.status_tx, next).await;
    }
}
