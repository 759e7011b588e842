//! Connection manager: the sole owner of the transport.
//!
//! The session runs in a dedicated tokio task. Callers hold a
//! [`ConnectionManager`] handle that sends typed commands into the task and
//! reads the observable [`ConnectionStatus`]; lifecycle changes and inbound
//! frames come back on a notification channel of [`ConnectionEvent`]s.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected`, with any transport
//! close, handshake rejection or heartbeat timeout moving to `Error` and
//! scheduling a reconnect after a capped exponential backoff. Once the
//! reconnect budget is spent the status is marked exhausted and nothing is
//! retried until `connect` is called again.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tidings_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
};
use tidings_shared::protocol::{ClientFrame, ServerFrame};
use tidings_shared::types::{ConnectionState, ConnectionStatus};

use crate::backoff::ReconnectPolicy;
use crate::error::{NetError, Result};
use crate::transport::{Connector, Credential, Inbound, Link};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Open the session with the given credential.
    Connect(Credential),
    /// Tear the session down and cancel any pending reconnect.
    Disconnect,
    /// Write a frame onto the established session.
    Frame(ClientFrame),
    /// Stop the task.
    Shutdown,
}

/// Notifications sent *from* the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake succeeded. Subscriptions must be (re)established.
    Connected,
    /// A frame was published on `topic`.
    Frame { topic: String, body: String },
    /// The session ended or could not be opened.
    Disconnected { reason: String },
    /// A reconnect attempt will be made after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The reconnect budget is exhausted.
    Failed { attempts: u32 },
}

/// Configuration for the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout: Duration,
    /// How often a keep-alive is sent on an idle session.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the session counts as closed.
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the connection task. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Spawn the connection task in the background.
    ///
    /// Returns the handle, the notification receiver and the task handle.
    /// The task starts `Disconnected`; nothing is dialed before `connect`.
    pub fn spawn<C: Connector>(
        connector: C,
        config: ConnectionConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnectionCommand>(256);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(256);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Driver {
            connector,
            config,
            cmd_rx,
            event_tx,
            status_tx,
            credential: None,
        };
        let task = tokio::spawn(driver.run());

        (Self { cmd_tx, status_rx }, event_rx, task)
    }

    /// Open the session.
    ///
    /// While a session is connecting, open or waiting out a backoff delay
    /// nothing is dialed; `credential` only replaces the one presented on
    /// the next handshake.
    pub fn connect(&self, credential: Credential) -> Result<()> {
        self.command(ConnectionCommand::Connect(credential))
    }

    /// Close the session and cancel any scheduled reconnect. Idempotent.
    pub fn disconnect(&self) -> Result<()> {
        self.command(ConnectionCommand::Disconnect)
    }

    /// Hand a frame to the transport.
    ///
    /// Fails with [`NetError::NotConnected`] unless the session is
    /// established. Success means the frame was queued, not delivered.
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        if self.status().state != ConnectionState::Connected {
            return Err(NetError::NotConnected);
        }
        self.command(ConnectionCommand::Frame(frame))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(ConnectionCommand::Shutdown)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel over the connection status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn command(&self, cmd: ConnectionCommand) -> Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NetError::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

enum Phase<L> {
    Idle,
    Open(L),
    /// Waiting out a backoff delay before the next attempt.
    Backoff(Instant),
    Stopped,
}

/// How an open session ended.
enum SessionEnd {
    UserDisconnect,
    Lost(String),
    Shutdown,
}

struct Driver<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    cmd_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    credential: Option<Credential>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut phase: Phase<C::Link> = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Open(link) => match self.session(link).await {
                    SessionEnd::UserDisconnect => {
                        self.set_state(ConnectionState::Disconnected);
                        self.emit(ConnectionEvent::Disconnected {
                            reason: "disconnect requested".into(),
                        })
                        .await;
                        Phase::Idle
                    }
                    SessionEnd::Lost(reason) => self.on_failure(reason).await,
                    SessionEnd::Shutdown => Phase::Stopped,
                },
                Phase::Backoff(deadline) => self.backoff(deadline).await,
                Phase::Stopped => break,
            };
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection task terminated");
    }

    async fn idle(&mut self) -> Phase<C::Link> {
        match self.cmd_rx.recv().await {
            Some(ConnectionCommand::Connect(credential)) => {
                self.credential = Some(credential);
                // An explicit connect starts a fresh retry budget.
                self.status_tx.send_modify(|s| {
                    s.exhausted = false;
                    s.reconnect_attempt = 0;
                });
                self.open().await
            }
            Some(ConnectionCommand::Disconnect) => {
                self.set_state(ConnectionState::Disconnected);
                Phase::Idle
            }
            Some(ConnectionCommand::Frame(frame)) => {
                debug!(frame = ?frame, "Dropping frame, not connected");
                Phase::Idle
            }
            Some(ConnectionCommand::Shutdown) | None => Phase::Stopped,
        }
    }

    async fn backoff(&mut self, deadline: Instant) -> Phase<C::Link> {
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::Connect(credential)) => {
                    debug!("Credential replaced, reconnect stays scheduled");
                    self.credential = Some(credential);
                    Phase::Backoff(deadline)
                }
                Some(ConnectionCommand::Disconnect) => {
                    info!("Reconnect cancelled by disconnect");
                    self.set_state(ConnectionState::Disconnected);
                    Phase::Idle
                }
                Some(ConnectionCommand::Frame(frame)) => {
                    debug!(frame = ?frame, "Dropping frame during backoff");
                    Phase::Backoff(deadline)
                }
                Some(ConnectionCommand::Shutdown) | None => Phase::Stopped,
            },
            _ = sleep_until(deadline) => self.open().await,
        }
    }

    /// Dial and handshake with the stored credential.
    async fn open(&mut self) -> Phase<C::Link> {
        let Some(credential) = self.credential.clone() else {
            warn!("No credential available, staying disconnected");
            self.set_state(ConnectionState::Disconnected);
            return Phase::Idle;
        };

        self.set_state(ConnectionState::Connecting);
        let attempt = self.status_tx.borrow().reconnect_attempt;
        debug!(attempt, "Opening transport");

        let opened =
            tokio::time::timeout(self.config.handshake_timeout, self.connector.open(&credential))
                .await
                .unwrap_or(Err(NetError::HandshakeTimeout));

        match opened {
            Ok(link) => {
                self.status_tx.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.reconnect_attempt = 0;
                    s.exhausted = false;
                });
                info!("Connected");
                self.emit(ConnectionEvent::Connected).await;
                Phase::Open(link)
            }
            Err(e) => {
                warn!(error = %e, attempt, "Connection attempt failed");
                self.on_failure(e.to_string()).await
            }
        }
    }

    /// Move to `Error` and either schedule a reconnect or give up.
    async fn on_failure(&mut self, reason: String) -> Phase<C::Link> {
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.clone(),
        })
        .await;

        let attempts_made = self.status_tx.borrow().reconnect_attempt;
        let policy = self.config.reconnect;

        if !policy.allows(attempts_made) {
            self.status_tx.send_modify(|s| {
                s.state = ConnectionState::Error;
                s.exhausted = true;
            });
            warn!(attempts = attempts_made, reason = %reason, "Reconnect budget exhausted");
            self.emit(ConnectionEvent::Failed {
                attempts: attempts_made,
            })
            .await;
            return Phase::Idle;
        }

        let delay = policy.delay_for(attempts_made);
        let attempt = attempts_made + 1;
        self.status_tx.send_modify(|s| {
            s.state = ConnectionState::Error;
            s.reconnect_attempt = attempt;
        });
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay })
            .await;

        Phase::Backoff(Instant::now() + delay)
    }

    /// Pump commands and inbound frames until the session ends.
    async fn session(&mut self, mut link: C::Link) -> SessionEnd {
        let interval = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnectionCommand::Frame(frame)) => {
                        if let Err(e) = link.send(frame).await {
                            link.close().await;
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(ConnectionCommand::Connect(credential)) => {
                        debug!("Already connected, credential kept for the next handshake");
                        self.credential = Some(credential);
                    }
                    Some(ConnectionCommand::Disconnect) => {
                        let _ = link.send(ClientFrame::Disconnect).await;
                        link.close().await;
                        return SessionEnd::UserDisconnect;
                    }
                    Some(ConnectionCommand::Shutdown) | None => {
                        link.close().await;
                        return SessionEnd::Shutdown;
                    }
                },

                inbound = link.recv() => match inbound {
                    Some(Ok(Inbound::Frame(ServerFrame::Message { topic, body }))) => {
                        last_inbound = Instant::now();
                        self.emit(ConnectionEvent::Frame { topic, body }).await;
                    }
                    Some(Ok(Inbound::Frame(ServerFrame::Error { message }))) => {
                        warn!(message = %message, "Server error frame, closing session");
                        link.close().await;
                        return SessionEnd::Lost(message);
                    }
                    Some(Ok(Inbound::Frame(ServerFrame::Connected { .. }))) | Some(Ok(Inbound::Alive)) => {
                        last_inbound = Instant::now();
                    }
                    Some(Err(e)) => {
                        link.close().await;
                        return SessionEnd::Lost(e.to_string());
                    }
                    None => return SessionEnd::Lost("closed by peer".into()),
                },

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= self.config.heartbeat_timeout {
                        warn!("Heartbeat timeout");
                        link.close().await;
                        return SessionEnd::Lost("heartbeat timeout".into());
                    }
                    if let Err(e) = link.heartbeat().await {
                        link.close().await;
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status_tx.send_modify(|s| s.state = state);
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Notification receiver dropped");
        }
    }
}
