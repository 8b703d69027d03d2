// Session event listener capabilities.
//
// Listener families split into two tiers. Unrestricted listeners
// (`RemoveListener`, `MessageListener`) run outside the session's internal
// lock and may safely call back into delivery on other sessions. Restricted
// listeners (`QueueListener`, `DeQueueListener`, `MaxQueueListener`) run
// while the lock is held: they must not call `deliver` or `drain` on any
// session, or acquire another session's lock, on the calling thread,
// since that deadlocks. The engine cannot enforce this; it is a caller
// obligation.
use crate::session::ServerSession;
use halley_message::Message;
use std::collections::VecDeque;

/// Notified exactly once when a session is removed.
pub trait RemoveListener: Send + Sync {
    /// `timeout` is true when removal was caused by a timeout rather than an
    /// explicit disconnect.
    fn removed(&self, session: &ServerSession, timeout: bool);
}

/// Notified for every message about to be sent to a session.
///
/// Unrestricted: invoked outside the session lock.
pub trait MessageListener: Send + Sync {
    /// Return `false` to veto the message for this session; later listeners
    /// are not consulted and the message is discarded.
    fn on_message(
        &self,
        _session: &ServerSession,
        _sender: Option<&ServerSession>,
        _message: &Message,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Notified after a message is admitted to the session queue.
///
/// Restricted: invoked while the session lock is held.
pub trait QueueListener: Send + Sync {
    /// `sender` is `None` for server-originated messages.
    fn queued(&self, sender: Option<&ServerSession>, message: &Message) -> anyhow::Result<()>;
}

/// Notified once per drain with the full queue, before it is handed to the
/// transport.
///
/// Restricted: invoked while the session lock is held. This is the last
/// chance to remove duplicates or merge messages; the queue may be mutated
/// in place.
pub trait DeQueueListener: Send + Sync {
    fn dequeue(
        &self,
        session: &ServerSession,
        queue: &mut VecDeque<Message>,
    ) -> anyhow::Result<()>;
}

/// Consulted when admission would overflow the configured maximum queue
/// length.
///
/// Restricted: invoked while the session lock is held. Implementations may
/// mutate the queue (for instance evict an older entry) before deciding.
pub trait MaxQueueListener: Send + Sync {
    /// Return `true` to admit the message anyway, `false` to reject it.
    fn queue_maxed(
        &self,
        session: &ServerSession,
        queue: &mut VecDeque<Message>,
        sender: Option<&ServerSession>,
        message: &Message,
    ) -> anyhow::Result<bool>;
}
