// Process-wide queue depth accounting. Kept in its own binary so no other
// test mutates the counter while these assertions run.
use halley_message::{ChannelId, Message};
use halley_session::{
    MaxQueueListener, OverflowTrigger, ServerSession, SessionConfig, queued_messages,
};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

fn message(data: i64) -> Message {
    let channel = ChannelId::from_str("/stock/x").expect("channel");
    Message::new(channel, data.into())
}

struct EvictOldest;

impl MaxQueueListener for EvictOldest {
    fn queue_maxed(
        &self,
        _session: &ServerSession,
        queue: &mut VecDeque<Message>,
        _sender: Option<&ServerSession>,
        _message: &Message,
    ) -> anyhow::Result<bool> {
        queue.pop_front();
        Ok(true)
    }
}

#[tokio::test]
async fn eviction_and_drain_leave_the_depth_balanced() {
    let baseline = queued_messages();
    let session = ServerSession::new(SessionConfig {
        max_queue: Some(2),
        overflow_trigger: OverflowTrigger::ExceedsCapacity,
        ..SessionConfig::default()
    });
    session.add_max_queue_listener(Arc::new(EvictOldest));

    for i in 0..4 {
        assert!(session.deliver(None, message(i)).await.expect("deliver"));
    }
    // Two of the four admissions were evicted again; the counter must not
    // still carry them.
    assert_eq!(session.queue_len(), 2);
    assert_eq!(queued_messages() - baseline, session.queue_len());

    session.drain().expect("drain");
    assert_eq!(queued_messages(), baseline);

    // Removal discards whatever is still queued.
    session.deliver(None, message(9)).await.expect("deliver");
    session.remove(false);
    assert_eq!(queued_messages(), baseline);
}
