//! In-process transport.
//!
//! [`pair`] returns a connector for the client side and a [`MemoryServer`]
//! that plays the backend: it accepts or rejects handshakes, pushes frames
//! and observes what the client sends. Used to drive the connection
//! manager and the sync engine without a socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use tidings_shared::protocol::{ClientFrame, ServerFrame};

use crate::error::{NetError, Result};
use crate::transport::{Connector, Credential, Inbound, Link};

#[derive(Default)]
struct Shared {
    /// Scripted handshake outcomes, consumed one per `open`.
    verdicts: VecDeque<std::result::Result<(), String>>,
    /// Every credential presented, in order.
    credentials: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
    sessions: mpsc::UnboundedSender<MemorySession>,
}

pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    sessions: mpsc::UnboundedReceiver<MemorySession>,
}

/// Server half of one accepted link.
pub struct MemorySession {
    pub credential: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    silent: Arc<AtomicBool>,
}

pub struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    /// A heartbeat was sent and its pong not yet delivered.
    pong_due: bool,
    silent: Arc<AtomicBool>,
}

pub fn pair() -> (MemoryConnector, MemoryServer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            shared: shared.clone(),
            sessions: tx,
        },
        MemoryServer {
            shared,
            sessions: rx,
        },
    )
}

impl MemoryServer {
    /// Refuse the next `n` handshakes.
    pub fn reject_next(&self, n: usize, reason: &str) {
        if let Ok(mut shared) = self.shared.lock() {
            for _ in 0..n {
                shared.verdicts.push_back(Err(reason.to_string()));
            }
        }
    }

    /// Wait for the next accepted session.
    pub async fn accept(&mut self) -> Option<MemorySession> {
        self.sessions.recv().await
    }

    /// Number of handshakes attempted so far, accepted or not.
    pub fn attempts(&self) -> usize {
        self.shared.lock().map(|s| s.credentials.len()).unwrap_or(0)
    }

    pub fn credentials(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.credentials.clone())
            .unwrap_or_default()
    }
}

impl MemorySession {
    /// Publish `body` on `topic`.
    pub fn push(&self, topic: &str, body: &str) -> bool {
        self.to_client
            .send(Inbound::Frame(ServerFrame::Message {
                topic: topic.to_string(),
                body: body.to_string(),
            }))
            .is_ok()
    }

    pub fn push_raw(&self, inbound: Inbound) -> bool {
        self.to_client.send(inbound).is_ok()
    }

    /// Next frame written by the client, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Drain frames already written by the client.
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Stop answering heartbeats while keeping the link open.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Drop the link from the server side.
    pub fn close(self) {}
}

impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn open(&self, credential: &Credential) -> Result<MemoryLink> {
        let verdict = {
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| NetError::Transport("memory transport poisoned".into()))?;
            shared.credentials.push(credential.expose().to_string());
            shared.verdicts.pop_front().unwrap_or(Ok(()))
        };
        verdict.map_err(NetError::HandshakeRejected)?;

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let silent = Arc::new(AtomicBool::new(false));
        self.sessions
            .send(MemorySession {
                credential: credential.expose().to_string(),
                to_client,
                from_client,
                silent: silent.clone(),
            })
            .map_err(|_| NetError::Transport("memory server gone".into()))?;

        Ok(MemoryLink {
            inbound,
            outbound,
            pong_due: false,
            silent,
        })
    }
}

impl Link for MemoryLink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| NetError::Transport("peer closed".into()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound>> {
        if self.pong_due {
            self.pong_due = false;
            return Some(Ok(Inbound::Alive));
        }
        self.inbound.recv().await.map(Ok)
    }

    async fn heartbeat(&mut self) -> Result<()> {
        if !self.silent.load(Ordering::SeqCst) {
            self.pong_due = true;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
