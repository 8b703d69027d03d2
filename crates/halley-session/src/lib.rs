// Per-session delivery core: bounded message queue, extension interception,
// and listener dispatch for one connected client.
//
// A publish fan-out collaborator calls `ServerSession::deliver` once per
// subscriber; a transport collaborator calls `ServerSession::drain` when a
// long-poll arrives and serializes the result onto the wire. Neither side is
// implemented here.
use halley_message::SessionId;

mod config;
mod extension;
mod listener;
mod registry;
mod session;

pub use config::{OverflowTrigger, SessionConfig};
pub use extension::Extension;
pub use listener::{
    DeQueueListener, MaxQueueListener, MessageListener, QueueListener, RemoveListener,
};
pub use session::{LocalSession, ServerSession, queued_messages};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The session was removed by disconnect or timeout; it accepts no
    /// further deliver/receive/drain calls.
    #[error("session removed: {0}")]
    SessionGone(SessionId),
    /// An extension hook returned an unexpected failure.
    #[error("extension fault: {0}")]
    ExtensionFault(anyhow::Error),
    /// A listener callback returned an unexpected failure.
    #[error("listener fault: {0}")]
    ListenerFault(anyhow::Error),
}
