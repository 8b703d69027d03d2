// Transport-supplied per-session defaults.
use std::time::Duration;

/// When to consult `MaxQueueListener`s during queue admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowTrigger {
    /// Consult them when admission would bring the queue length to or beyond
    /// the configured maximum.
    ReachesCapacity,
    /// Consult them only when admission would bring the queue length strictly
    /// beyond the configured maximum.
    ExceedsCapacity,
}

impl OverflowTrigger {
    pub(crate) fn triggered(self, queue_len: usize, max_queue: usize) -> bool {
        match self {
            OverflowTrigger::ReachesCapacity => queue_len + 1 >= max_queue,
            OverflowTrigger::ExceedsCapacity => queue_len >= max_queue,
        }
    }
}

/// Session configuration values supplied by the transport.
///
/// A session may override `interval` and `timeout` individually; the values
/// here apply whenever no override is set.
///
/// ```
/// use halley_session::SessionConfig;
///
/// let config = SessionConfig::default();
/// assert!(config.max_queue.is_none());
/// assert!(config.timeout.as_secs() > 0);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum queued messages before `MaxQueueListener`s arbitrate
    /// admission; `None` means unbounded.
    pub max_queue: Option<usize>,
    pub overflow_trigger: OverflowTrigger,
    /// Default pause before the client issues the next connect.
    pub interval: Duration,
    /// Default period the server holds a connect before answering.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // Match the wire protocol's customary defaults: connect immediately,
        // hold a long-poll for thirty seconds, queue without bound.
        Self {
            max_queue: None,
            overflow_trigger: OverflowTrigger::ReachesCapacity,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OverflowTrigger, SessionConfig};

    #[test]
    fn default_config() {
        // Basic sanity checks on defaults.
        let config = SessionConfig::default();
        assert!(config.max_queue.is_none());
        assert_eq!(config.overflow_trigger, OverflowTrigger::ReachesCapacity);
        assert!(config.interval.is_zero());
        assert_eq!(config.timeout.as_secs(), 30);
    }

    #[test]
    fn reaches_capacity_fires_one_below_the_maximum() {
        let trigger = OverflowTrigger::ReachesCapacity;
        assert!(!trigger.triggered(0, 2));
        assert!(trigger.triggered(1, 2));
        assert!(trigger.triggered(2, 2));
    }

    #[test]
    fn exceeds_capacity_fires_at_the_maximum() {
        let trigger = OverflowTrigger::ExceedsCapacity;
        assert!(!trigger.triggered(1, 2));
        assert!(trigger.triggered(2, 2));
        assert!(trigger.triggered(3, 2));
    }
}
