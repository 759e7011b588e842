//! # tidings-client
//!
//! Client-side sync core for the Tidings messaging backend.
//!
//! [`engine::spawn`] starts a single task that owns the connection, the
//! message store and the unread, typing and presence trackers. Callers drive
//! it through a cloneable [`SyncHandle`] and observe it through
//! [`SyncEvent`]s and two watch channels (connection status and the global
//! unread total).

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod rest;
pub mod router;

pub use config::ClientConfig;
pub use dispatcher::{Dispatched, OutboundDispatcher};
pub use engine::spawn;
pub use error::{ClientError, Result};
pub use events::SyncEvent;
pub use handle::SyncHandle;
pub use rest::{HttpRestApi, RestApi};
pub use router::{InboundEvent, SubscriptionRouter};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tidings=info,tidings_client=debug,tidings_net=debug,tidings_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
