// Per-session delivery and queue engine.
//
// One parking_lot mutex per session guards the queue and the removed flag.
// Restricted listeners (queue, dequeue, max-queue) run while that lock is
// held; extensions and message listeners run outside it so they may re-enter
// delivery on other sessions without deadlocking.
use crate::config::SessionConfig;
use crate::extension::Extension;
use crate::listener::{
    DeQueueListener, MaxQueueListener, MessageListener, QueueListener, RemoveListener,
};
use crate::registry::CowList;
use crate::{Result, SessionError};
use halley_message::{ChannelId, Message, SessionId};
use halley_promise::{Completable, Promise};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

// Approximate number of queued messages across all sessions in this process;
// backs the queue length gauge.
static GLOBAL_QUEUE_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of queued messages across all sessions.
///
/// Mirrors the `halley_session_queue_len` gauge for callers without a
/// metrics recorder installed.
pub fn queued_messages() -> usize {
    GLOBAL_QUEUE_DEPTH.load(Ordering::Relaxed)
}

fn increment_queue_depth() {
    let global = GLOBAL_QUEUE_DEPTH.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::gauge!("halley_session_queue_len").set(global as f64);
    metrics::counter!("halley_session_enqueued_total").increment(1);
}

fn decrement_queue_depth(n: usize) {
    if n == 0 {
        return;
    }
    if let Ok(prev) =
        GLOBAL_QUEUE_DEPTH.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(n))
    {
        metrics::gauge!("halley_session_queue_len").set((prev - n) as f64);
    }
}

#[derive(Debug)]
struct QueueState {
    // FIFO in admission order; only a DeQueueListener may reorder it.
    queue: VecDeque<Message>,
    removed: bool,
}

#[derive(Debug, Default)]
struct Overrides {
    interval: Option<Duration>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
}

/// Server-side representation of one connected client.
///
/// Owns the outbound message queue, the ordered extension chain, and the
/// listener registrations for that client. A channel fan-out collaborator
/// calls [`deliver`](Self::deliver) once per subscriber; a transport
/// collaborator calls [`drain`](Self::drain) when a long-poll arrives.
///
/// ```
/// use halley_message::{ChannelId, Message};
/// use halley_session::{ServerSession, SessionConfig};
/// use std::str::FromStr;
///
/// let session = ServerSession::new(SessionConfig::default());
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let channel = ChannelId::from_str("/chat/lobby").expect("channel");
///     let delivered = session
///         .deliver(None, Message::new(channel, serde_json::json!({"text": "hi"})))
///         .await
///         .expect("deliver");
///     assert!(delivered);
///     let drained = session.drain().expect("drain");
///     assert_eq!(drained.len(), 1);
/// });
/// ```
pub struct ServerSession {
    id: SessionId,
    config: SessionConfig,
    state: Mutex<QueueState>,
    extensions: CowList<dyn Extension>,
    remove_listeners: CowList<dyn RemoveListener>,
    message_listeners: CowList<dyn MessageListener>,
    queue_listeners: CowList<dyn QueueListener>,
    dequeue_listeners: CowList<dyn DeQueueListener>,
    max_queue_listeners: CowList<dyn MaxQueueListener>,
    // Channels this session is subscribed to; maintained by the fan-out
    // collaborator, not by this engine.
    subscriptions: Mutex<HashSet<ChannelId>>,
    overrides: Mutex<Overrides>,
    local: bool,
    // Present only for local sessions; taken on removal to close the channel.
    local_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl ServerSession {
    /// Creates a session fronting a remote client.
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a session fronting an in-process client, paired with the
    /// [`LocalSession`] handle that receives its messages directly.
    pub fn local(config: SessionConfig) -> (Self, LocalSession) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Self::build(config, Some(sender));
        let local = LocalSession {
            id: session.id,
            receiver,
        };
        (session, local)
    }

    fn build(config: SessionConfig, local_tx: Option<mpsc::UnboundedSender<Message>>) -> Self {
        Self {
            id: SessionId::new(),
            config,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                removed: false,
            }),
            extensions: CowList::new(),
            remove_listeners: CowList::new(),
            message_listeners: CowList::new(),
            queue_listeners: CowList::new(),
            dequeue_listeners: CowList::new(),
            max_queue_listeners: CowList::new(),
            subscriptions: Mutex::new(HashSet::new()),
            overrides: Mutex::new(Overrides::default()),
            local: local_tx.is_some(),
            local_tx: Mutex::new(local_tx),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether this session fronts an in-process client.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Delivers a message to this session only, bypassing channel fan-out.
    ///
    /// The message runs through the message listeners and the outgoing
    /// extension chain before queue admission. The returned future resolves
    /// `true` when the message was queued, `false` when a listener vetoed
    /// it, an extension dropped it, or an overflow arbiter rejected it, and
    /// fails when a callback faulted or the session is already removed. The
    /// outcome is produced exactly once, synchronously within this call.
    pub fn deliver(&self, sender: Option<&ServerSession>, message: Message) -> Completable<bool> {
        let completable = Completable::new();
        let promise = completable.clone();
        match self.deliver_inner(sender, message) {
            Ok(delivered) => promise.succeed(delivered),
            Err(err) => {
                tracing::debug!(session = %self.id, error = %err, "delivery failed");
                promise.fail(err.into());
            }
        }
        completable
    }

    /// Convenience variant of [`deliver`](Self::deliver) that builds the
    /// message from a channel and a data payload.
    pub fn deliver_data(
        &self,
        sender: Option<&ServerSession>,
        channel: ChannelId,
        data: Value,
    ) -> Completable<bool> {
        self.deliver(sender, Message::new(channel, data))
    }

    fn deliver_inner(&self, sender: Option<&ServerSession>, message: Message) -> Result<bool> {
        if self.is_removed() {
            return Err(SessionError::SessionGone(self.id));
        }

        // Unrestricted tier: message listeners run outside the session lock
        // and may veto the message for this session.
        let listeners = self.message_listeners.snapshot();
        for listener in listeners.iter() {
            match listener.on_message(self, sender, &message) {
                Ok(true) => {}
                Ok(false) => {
                    metrics::counter!("halley_session_dropped_total").increment(1);
                    return Ok(false);
                }
                Err(err) => return Err(SessionError::ListenerFault(err)),
            }
        }

        let Some(message) = self.extend_outgoing(message)? else {
            metrics::counter!("halley_session_dropped_total").increment(1);
            return Ok(false);
        };

        {
            let mut state = self.state.lock();
            // Re-check under the lock: removal may have raced the pipeline.
            if state.removed {
                return Err(SessionError::SessionGone(self.id));
            }

            if let Some(max_queue) = self.config.max_queue
                && self
                    .config
                    .overflow_trigger
                    .triggered(state.queue.len(), max_queue)
            {
                // Restricted tier: overflow arbiters may mutate the queue
                // (e.g. evict an older entry) before deciding admission.
                let len_before = state.queue.len();
                let arbiters = self.max_queue_listeners.snapshot();
                let mut verdict: Result<bool> = Ok(true);
                for arbiter in arbiters.iter() {
                    match arbiter.queue_maxed(self, &mut state.queue, sender, &message) {
                        Ok(true) => {}
                        Ok(false) => {
                            verdict = Ok(false);
                            break;
                        }
                        Err(err) => {
                            verdict = Err(SessionError::ListenerFault(err));
                            break;
                        }
                    }
                }
                // Evicted entries were counted at admission; settle the gauge
                // whichever way the arbiters decided.
                decrement_queue_depth(len_before.saturating_sub(state.queue.len()));
                match verdict {
                    Ok(true) => {}
                    Ok(false) => {
                        metrics::counter!("halley_session_queue_maxed_rejected_total")
                            .increment(1);
                        return Ok(false);
                    }
                    Err(err) => return Err(err),
                }
            }

            state.queue.push_back(message);
            let mut fault = None;
            {
                let admitted = state.queue.back().expect("just pushed");
                for listener in self.queue_listeners.snapshot().iter() {
                    if let Err(err) = listener.queued(sender, admitted) {
                        fault = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = fault {
                // Roll back to the pre-admission state before surfacing.
                state.queue.pop_back();
                return Err(SessionError::ListenerFault(err));
            }

            increment_queue_depth();

            // A local counterpart sees the message immediately, without a
            // transport round-trip; the queue/drain path is unchanged. The
            // copy goes out while the session lock is held so the local
            // stream and the queue agree on admission order. An unbounded
            // send never blocks and runs no user code, so it is safe here.
            if self.local
                && let Some(copy) = state.queue.back().cloned()
                && let Some(tx) = self.local_tx.lock().as_ref()
            {
                let _ = tx.send(copy);
            }
        }
        Ok(true)
    }

    fn extend_outgoing(&self, mut message: Message) -> Result<Option<Message>> {
        // Registration order, outside the session lock; the first extension
        // that drops the message ends the pass.
        let extensions = self.extensions.snapshot();
        for extension in extensions.iter() {
            match extension.outgoing(self, message) {
                Ok(Some(next)) => message = next,
                Ok(None) => return Ok(None),
                Err(err) => return Err(SessionError::ExtensionFault(err)),
            }
        }
        Ok(Some(message))
    }

    /// Runs an incoming message through the extension chain.
    ///
    /// Returns whether processing should continue. Extensions may mutate the
    /// message in place; the first one returning `false` stops the pass.
    pub fn receive(&self, message: &mut Message) -> Result<bool> {
        if self.is_removed() {
            return Err(SessionError::SessionGone(self.id));
        }
        let extensions = self.extensions.snapshot();
        for extension in extensions.iter() {
            match extension.incoming(self, message) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(err) => return Err(SessionError::ExtensionFault(err)),
            }
        }
        Ok(true)
    }

    /// Empties the queue for handoff to a transport.
    ///
    /// DeQueue listeners observe the full queue under the session lock and
    /// may remove, add, or merge entries in place before the swap. An empty
    /// queue returns immediately without waking them. A listener fault
    /// leaves the queue intact so no message is lost.
    pub fn drain(&self) -> Result<Vec<Message>> {
        let mut state = self.state.lock();
        if state.removed {
            return Err(SessionError::SessionGone(self.id));
        }
        if state.queue.is_empty() {
            return Ok(Vec::new());
        }

        let accounted = state.queue.len();
        let listeners = self.dequeue_listeners.snapshot();
        for listener in listeners.iter() {
            if let Err(err) = listener.dequeue(self, &mut state.queue) {
                return Err(SessionError::ListenerFault(err));
            }
        }

        let drained = std::mem::take(&mut state.queue);
        decrement_queue_depth(accounted);
        metrics::counter!("halley_session_dequeued_total").increment(drained.len() as u64);
        Ok(drained.into())
    }

    /// Tears the session down after a disconnect or timeout.
    ///
    /// Idempotent: the first call flips the removed flag, discards the
    /// queue, notifies remove listeners exactly once (outside any lock),
    /// then destroys subscriptions, extensions, and listener registrations.
    /// Subsequent `deliver`/`receive`/`drain` calls fail with
    /// [`SessionError::SessionGone`].
    pub fn remove(&self, timeout: bool) {
        {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            state.removed = true;
            decrement_queue_depth(state.queue.len());
            state.queue.clear();
        }

        let listeners = self.remove_listeners.snapshot();
        for listener in listeners.iter() {
            listener.removed(self, timeout);
        }

        // The session, its queue, and its registrations go away together.
        self.subscriptions.lock().clear();
        self.extensions.clear();
        self.remove_listeners.clear();
        self.message_listeners.clear();
        self.queue_listeners.clear();
        self.dequeue_listeners.clear();
        self.max_queue_listeners.clear();
        // Closing the channel lets a local counterpart observe the removal.
        self.local_tx.lock().take();
    }

    // --- extension and listener registration -----------------------------

    pub fn add_extension(&self, extension: Arc<dyn Extension>) {
        self.extensions.add(extension);
    }

    pub fn remove_extension(&self, extension: &Arc<dyn Extension>) -> bool {
        self.extensions.remove(extension)
    }

    /// Snapshot of the extension chain in registration order.
    pub fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.snapshot().as_ref().clone()
    }

    pub fn add_remove_listener(&self, listener: Arc<dyn RemoveListener>) {
        self.remove_listeners.add(listener);
    }

    pub fn remove_remove_listener(&self, listener: &Arc<dyn RemoveListener>) -> bool {
        self.remove_listeners.remove(listener)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.add(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.message_listeners.remove(listener)
    }

    pub fn add_queue_listener(&self, listener: Arc<dyn QueueListener>) {
        self.queue_listeners.add(listener);
    }

    pub fn remove_queue_listener(&self, listener: &Arc<dyn QueueListener>) -> bool {
        self.queue_listeners.remove(listener)
    }

    pub fn add_dequeue_listener(&self, listener: Arc<dyn DeQueueListener>) {
        self.dequeue_listeners.add(listener);
    }

    pub fn remove_dequeue_listener(&self, listener: &Arc<dyn DeQueueListener>) -> bool {
        self.dequeue_listeners.remove(listener)
    }

    pub fn add_max_queue_listener(&self, listener: Arc<dyn MaxQueueListener>) {
        self.max_queue_listeners.add(listener);
    }

    pub fn remove_max_queue_listener(&self, listener: &Arc<dyn MaxQueueListener>) -> bool {
        self.max_queue_listeners.remove(listener)
    }

    // --- subscriptions (maintained by the fan-out collaborator) ----------

    pub fn add_subscription(&self, channel: ChannelId) -> bool {
        self.subscriptions.lock().insert(channel)
    }

    pub fn remove_subscription(&self, channel: &ChannelId) -> bool {
        self.subscriptions.lock().remove(channel)
    }

    pub fn is_subscribed(&self, channel: &ChannelId) -> bool {
        self.subscriptions.lock().contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    // --- per-session transport overrides ----------------------------------

    /// This session's connect-interval override, if any.
    pub fn interval(&self) -> Option<Duration> {
        self.overrides.lock().interval
    }

    pub fn set_interval(&self, interval: Option<Duration>) {
        self.overrides.lock().interval = interval;
    }

    /// The override when set, otherwise the transport default.
    pub fn effective_interval(&self) -> Duration {
        self.interval().unwrap_or(self.config.interval)
    }

    /// This session's long-poll hold-timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.overrides.lock().timeout
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.overrides.lock().timeout = timeout;
    }

    /// The override when set, otherwise the transport default.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout().unwrap_or(self.config.timeout)
    }

    pub fn user_agent(&self) -> Option<String> {
        self.overrides.lock().user_agent.clone()
    }

    pub fn set_user_agent(&self, user_agent: Option<String>) {
        self.overrides.lock().user_agent = user_agent;
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

/// In-process counterpart of a local [`ServerSession`].
///
/// Receives every message delivered to its server-side session without a
/// transport round-trip. The channel closes when the session is removed.
#[derive(Debug)]
pub struct LocalSession {
    id: SessionId,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl LocalSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Message, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalSession, ServerSession};
    use crate::config::SessionConfig;
    use crate::listener::RemoveListener;
    use crate::{Extension, SessionError};
    use halley_message::{ChannelId, Message};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn channel(name: &str) -> ChannelId {
        ChannelId::from_str(name).expect("channel")
    }

    fn message(name: &str, data: impl Into<serde_json::Value>) -> Message {
        Message::new(channel(name), data.into())
    }

    #[tokio::test]
    async fn deliver_queues_and_drain_empties() {
        let session = ServerSession::new(SessionConfig::default());
        let delivered = session
            .deliver(None, message("/chat/lobby", "hello"))
            .await
            .expect("deliver");
        assert!(delivered);
        assert_eq!(session.queue_len(), 1);

        let drained = session.drain().expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data(), &serde_json::json!("hello"));
        assert_eq!(session.queue_len(), 0);
    }

    #[tokio::test]
    async fn queue_preserves_admission_order() {
        let session = ServerSession::new(SessionConfig::default());
        for i in 0..5 {
            let delivered = session
                .deliver(None, message("/chat/lobby", i))
                .await
                .expect("deliver");
            assert!(delivered);
        }
        let drained = session.drain().expect("drain");
        let values: Vec<i64> = drained
            .iter()
            .map(|m| m.data().as_i64().expect("int"))
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_drain_is_idempotent() {
        let session = ServerSession::new(SessionConfig::default());
        assert!(session.drain().expect("drain").is_empty());
        assert!(session.drain().expect("drain").is_empty());
    }

    #[tokio::test]
    async fn removed_session_rejects_all_operations() {
        let session = ServerSession::new(SessionConfig::default());
        session.remove(false);

        let err = session
            .deliver(None, message("/chat/lobby", "late"))
            .await
            .expect_err("deliver after removal");
        assert!(err.to_string().contains("session removed"));

        assert!(matches!(
            session.drain(),
            Err(SessionError::SessionGone(_))
        ));
        let mut incoming = message("/meta/connect", serde_json::Value::Null);
        assert!(matches!(
            session.receive(&mut incoming),
            Err(SessionError::SessionGone(_))
        ));
    }

    #[tokio::test]
    async fn remove_notifies_listeners_exactly_once() {
        struct Counting {
            removals: AtomicUsize,
            timeouts: AtomicUsize,
        }
        impl RemoveListener for Counting {
            fn removed(&self, _session: &ServerSession, timeout: bool) {
                self.removals.fetch_add(1, Ordering::SeqCst);
                if timeout {
                    self.timeouts.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let counting = Arc::new(Counting {
            removals: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        });
        let session = ServerSession::new(SessionConfig::default());
        session.add_remove_listener(counting.clone());

        session.remove(true);
        session.remove(true);
        session.remove(false);
        assert_eq!(counting.removals.load(Ordering::SeqCst), 1);
        assert_eq!(counting.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removal_discards_the_queue_and_registrations() {
        let session = ServerSession::new(SessionConfig::default());
        session.add_extension(Arc::new(PassThrough));
        session
            .deliver(None, message("/chat/lobby", "pending"))
            .await
            .expect("deliver");
        session.add_subscription(channel("/chat/lobby"));

        session.remove(false);
        assert_eq!(session.queue_len(), 0);
        assert!(session.extensions().is_empty());
        assert!(session.subscriptions().is_empty());
    }

    struct PassThrough;
    impl Extension for PassThrough {}

    #[tokio::test]
    async fn local_session_receives_without_drain() {
        let (session, mut local): (ServerSession, LocalSession) =
            ServerSession::local(SessionConfig::default());
        assert!(session.is_local());
        assert_eq!(session.id(), local.id());

        session
            .deliver(None, message("/chat/lobby", "direct"))
            .await
            .expect("deliver");
        let received = local.recv().await.expect("recv");
        assert_eq!(received.data(), &serde_json::json!("direct"));

        // The queue still holds the message for a regular drain.
        assert_eq!(session.queue_len(), 1);
    }

    #[tokio::test]
    async fn local_channel_closes_on_removal() {
        let (session, mut local) = ServerSession::local(SessionConfig::default());
        session.remove(false);
        assert!(local.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_session_is_not_local() {
        let session = ServerSession::new(SessionConfig::default());
        assert!(!session.is_local());
    }

    #[test]
    fn subscriptions_track_the_fanout_collaborator() {
        let session = ServerSession::new(SessionConfig::default());
        let lobby = channel("/chat/lobby");
        assert!(session.add_subscription(lobby.clone()));
        assert!(!session.add_subscription(lobby.clone()));
        assert!(session.is_subscribed(&lobby));
        assert_eq!(session.subscriptions(), vec![lobby.clone()]);
        assert!(session.remove_subscription(&lobby));
        assert!(!session.is_subscribed(&lobby));
    }

    #[test]
    fn overrides_fall_back_to_transport_defaults() {
        let config = SessionConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(20),
            ..SessionConfig::default()
        };
        let session = ServerSession::new(config);

        assert_eq!(session.interval(), None);
        assert_eq!(session.effective_interval(), Duration::from_millis(100));
        session.set_interval(Some(Duration::from_millis(250)));
        assert_eq!(session.effective_interval(), Duration::from_millis(250));

        assert_eq!(session.effective_timeout(), Duration::from_secs(20));
        session.set_timeout(Some(Duration::from_secs(5)));
        assert_eq!(session.effective_timeout(), Duration::from_secs(5));

        assert_eq!(session.user_agent(), None);
        session.set_user_agent(Some("halley-client/0.1".into()));
        assert_eq!(session.user_agent().as_deref(), Some("halley-client/0.1"));
    }

    #[test]
    fn session_error_display() {
        let err = SessionError::SessionGone(ServerSession::new(SessionConfig::default()).id());
        assert!(err.to_string().contains("session removed"));

        let err = SessionError::ExtensionFault(anyhow::anyhow!("bad hook"));
        assert!(err.to_string().contains("bad hook"));

        let err = SessionError::ListenerFault(anyhow::anyhow!("bad callback"));
        assert!(err.to_string().contains("bad callback"));
    }
}
