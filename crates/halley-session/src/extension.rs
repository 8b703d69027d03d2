// Per-session message interceptors.
use crate::session::ServerSession;
use halley_message::Message;

/// Ordered interceptor able to inspect, transform, or drop messages on the
/// way in or out of a session.
///
/// Extensions run in registration order, the same order for both directions,
/// and the first one that signals stop (or drops the message) short-circuits
/// the rest. Every hook defaults to "continue unchanged", so implementors
/// override only the hooks they care about. Hooks run outside the session's
/// internal lock and must not observe partial queue state.
///
/// A hook returning `Err` is treated as a fault: the engine fails the
/// delivery future with it instead of letting it escape onto the caller's
/// thread.
pub trait Extension: Send + Sync {
    /// Dispatches an incoming message to [`rcv_meta`](Self::rcv_meta) or
    /// [`rcv`](Self::rcv) according to its meta flag.
    fn incoming(&self, session: &ServerSession, message: &mut Message) -> anyhow::Result<bool> {
        if message.is_meta() {
            self.rcv_meta(session, message)
        } else {
            self.rcv(session, message)
        }
    }

    /// Invoked for every incoming normal message; return `false` to stop
    /// processing.
    fn rcv(&self, _session: &ServerSession, _message: &mut Message) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Invoked for every incoming meta message; return `false` to stop
    /// processing.
    fn rcv_meta(&self, _session: &ServerSession, _message: &mut Message) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Dispatches an outgoing message to [`send_meta`](Self::send_meta) or
    /// [`send`](Self::send) according to its meta flag, translating a
    /// `send_meta` stop into a drop.
    fn outgoing(
        &self,
        session: &ServerSession,
        mut message: Message,
    ) -> anyhow::Result<Option<Message>> {
        if message.is_meta() {
            let keep = self.send_meta(session, &mut message)?;
            Ok(keep.then_some(message))
        } else {
            self.send(session, message)
        }
    }

    /// Invoked for every outgoing normal message; return the message to
    /// send (possibly transformed or replaced) or `None` to drop it.
    fn send(&self, _session: &ServerSession, message: Message) -> anyhow::Result<Option<Message>> {
        Ok(Some(message))
    }

    /// Invoked for every outgoing meta message; return `false` to stop
    /// processing.
    fn send_meta(&self, _session: &ServerSession, _message: &mut Message) -> anyhow::Result<bool> {
        Ok(true)
    }
}
