//! Bounded queue of change events waiting for the peer to come back.

use crate::config::RetryConfig;
use parking_lot::Mutex;
use slumber_sync_protocol::Envelope;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// An envelope that failed to reach the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEnvelope {
    /// The envelope to resend.
    pub envelope: Envelope,
    /// Send attempts made so far.
    pub attempts: u32,
}

/// Result of [`RetryQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with room to spare.
    Queued,
    /// Queued after evicting the oldest entry.
    QueuedEvictingOldest,
    /// Not queued: attempts used up or the queue holds nothing.
    Dropped,
}

impl PushOutcome {
    /// Returns true if the pushed envelope is now in the queue.
    pub fn is_queued(self) -> bool {
        !matches!(self, Self::Dropped)
    }

    /// Envelopes lost by this push, the pushed one or an evicted one.
    pub fn lost(self) -> u64 {
        match self {
            Self::Queued => 0,
            Self::QueuedEvictingOldest | Self::Dropped => 1,
        }
    }
}

/// Shared FIFO of pending envelopes.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    inner: Arc<Mutex<VecDeque<PendingEnvelope>>>,
    capacity: usize,
    policy: RetryConfig,
}

impl RetryQueue {
    /// Creates an empty queue.
    pub fn new(capacity: usize, policy: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            policy,
        }
    }

    /// Queues an envelope after a failed attempt.
    ///
    /// A full queue evicts its oldest entry to make room.
    pub fn push(&self, pending: PendingEnvelope) -> PushOutcome {
        if !self.policy.allows_another_attempt(pending.attempts) {
            warn!(
                message_type = %pending.envelope.message_type(),
                attempts = pending.attempts,
                "dropping envelope after final attempt"
            );
            return PushOutcome::Dropped;
        }
        if self.capacity == 0 {
            return PushOutcome::Dropped;
        }
        let mut queue = self.inner.lock();
        let mut outcome = PushOutcome::Queued;
        if queue.len() >= self.capacity {
            if let Some(oldest) = queue.pop_front() {
                warn!(
                    message_type = %oldest.envelope.message_type(),
                    "retry queue full, dropping oldest envelope"
                );
                outcome = PushOutcome::QueuedEvictingOldest;
            }
        }
        queue.push_back(pending);
        outcome
    }

    /// Returns an entry to the front, preserving its place in line.
    pub fn push_front(&self, pending: PendingEnvelope) {
        self.inner.lock().push_front(pending);
    }

    /// Takes every queued entry, oldest first.
    pub fn drain(&self) -> Vec<PendingEnvelope> {
        self.inner.lock().drain(..).collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slumber_codec::{Payload, Timestamp};
    use slumber_sync_protocol::MessageType;

    fn pending(attempts: u32) -> PendingEnvelope {
        PendingEnvelope {
            envelope: Envelope::new(
                MessageType::SleepEnded,
                Payload::new().with("n", i64::from(attempts)),
                Timestamp::from_secs(1),
            ),
            attempts,
        }
    }

    #[test]
    fn exhausted_envelope_is_dropped() {
        let queue = RetryQueue::new(8, RetryConfig::new(3));
        assert_eq!(queue.push(pending(1)), PushOutcome::Queued);
        assert_eq!(queue.push(pending(2)), PushOutcome::Queued);
        assert_eq!(queue.push(pending(3)), PushOutcome::Dropped);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = RetryQueue::new(2, RetryConfig::new(10));
        assert_eq!(queue.push(pending(1)), PushOutcome::Queued);
        assert_eq!(queue.push(pending(2)), PushOutcome::Queued);
        let outcome = queue.push(pending(3));
        assert_eq!(outcome, PushOutcome::QueuedEvictingOldest);
        assert!(outcome.is_queued());
        assert_eq!(outcome.lost(), 1);
        let drained = queue.drain();
        assert_eq!(
            drained.iter().map(|p| p.attempts).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn clones_share_the_queue() {
        let queue = RetryQueue::new(4, RetryConfig::new(3));
        let handle = queue.clone();
        handle.push(pending(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn zero_capacity_queues_nothing() {
        let queue = RetryQueue::new(0, RetryConfig::new(3));
        assert_eq!(queue.push(pending(1)), PushOutcome::Dropped);
        assert!(queue.is_empty());
    }
}
