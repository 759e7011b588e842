//! Transport abstraction.
//!
//! The connection task only ever talks to a [`Link`] obtained from a
//! [`Connector`], so the WebSocket implementation can be swapped for the
//! in-process one in [`crate::memory`].

use std::fmt;
use std::future::Future;

use tidings_shared::protocol::{ClientFrame, ServerFrame};

use crate::error::Result;

/// Bearer credential presented in the connection header.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// What a link yields on read.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(ServerFrame),
    /// Keep-alive traffic or a dropped malformed frame: proof of life only.
    Alive,
}

/// Opens authenticated links.
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    /// Open the transport and complete the handshake with `credential`.
    fn open(&self, credential: &Credential) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// An established, authenticated session.
pub trait Link: Send + 'static {
    fn send(&mut self, frame: ClientFrame) -> impl Future<Output = Result<()>> + Send;

    /// Next inbound item; `None` once the peer closed the link.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Inbound>>> + Send;

    /// Emit a keep-alive.
    fn heartbeat(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
