use std::sync::atomic::{self, AtomicU8};

use tokio::sync::Notify;

pub(super) type SlotId = usize;

/// What happened to a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Decision {
    Admit,
    Drop,
}

const PENDING: u8 = 0;
const ADMIT: u8 = 1;
const DROP: u8 = 2;

/// A reusable one-shot rendezvous between `pop` (single producer) and one waiter (single
/// consumer).
///
/// Slots live in a fixed pool for the lifetime of the queue and are handed out by index.
#[derive(Debug, Default)]
pub(super) struct Slot {
    decision: AtomicU8,
    notify: Notify,
}

impl Slot {
    /// Prepare the slot for a new waiter.
    pub(super) fn reset(&self) {
        self.decision.store(PENDING, atomic::Ordering::Release);
    }

    pub(super) fn deliver(&self, decision: Decision) {
        let value = match decision {
            Decision::Admit => ADMIT,
            Decision::Drop => DROP,
        };
        self.decision.store(value, atomic::Ordering::Release);
        self.notify.notify_one();
    }

    pub(super) fn decision(&self) -> Option<Decision> {
        match self.decision.load(atomic::Ordering::Acquire) {
            ADMIT => Some(Decision::Admit),
            DROP => Some(Decision::Drop),
            _ => None,
        }
    }

    /// Wait for a decision to be delivered.
    pub(super) async fn wait(&self) -> Decision {
        loop {
            // A stale permit from a previous waiter only costs an extra loop.
            let notified = self.notify.notified();
            if let Some(decision) = self.decision() {
                return decision;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    #[tokio::test]
    async fn wakes_waiter_on_delivery() {
        let slot = Slot::default();

        let mut waiter = task::spawn(slot.wait());
        assert_pending!(waiter.poll());

        slot.deliver(Decision::Drop);

        assert!(waiter.is_woken());
        assert_ready_eq!(waiter.poll(), Decision::Drop);
    }

    #[tokio::test]
    async fn reset_clears_previous_decision() {
        let slot = Slot::default();
        slot.deliver(Decision::Admit);
        assert_eq!(slot.wait().await, Decision::Admit);

        slot.reset();
        assert_eq!(slot.decision(), None);

        let mut waiter = task::spawn(slot.wait());
        assert_pending!(waiter.poll());
        assert_pending!(waiter.poll());

        slot.deliver(Decision::Admit);
        assert_ready_eq!(waiter.poll(), Decision::Admit);
    }
}
