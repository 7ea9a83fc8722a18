//! A bounded wait queue which sheds requests based on queueing delay.

mod codel;
mod slot;

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use bon::Builder;
use tokio::time::Instant;

use crate::{
    clock::{Clock, Millis},
    Error,
};

use codel::CoDel;
use slot::{Decision, Slot, SlotId};

/// A bounded queue of callers waiting for a turn, using [CoDel](https://queue.acm.org/detail.cfm?id=2209336)
/// to decide who gets one.
///
/// Waiters are released one at a time by [pop()](Self::pop()), oldest first. Each is judged on
/// how long it waited: when waits have been above `target` for a sustained period, waiters are
/// shed with [Error::LimitExceeded] instead of admitted.
///
/// Capacity is fixed. Every waiter holds one of a fixed pool of slots, which is returned however
/// the wait ends: admitted, shed, timed out or cancelled.
#[derive(Debug)]
pub struct DelayQueue {
    clock: Clock,
    slots: Box<[Slot]>,
    buffer: Mutex<Buffer>,
    codel: Mutex<CoDel>,
}

/// Configuration for a [DelayQueue].
#[derive(Debug, Clone, Builder)]
pub struct QueueOptions {
    /// Acceptable time to spend waiting in the queue.
    ///
    /// Commonly set somewhere between 20ms and 50ms.
    #[builder(default = Duration::from_millis(50))]
    target: Duration,
    /// How long waits need to stay above `target` before shedding starts.
    #[builder(default = Duration::from_millis(500))]
    interval: Duration,
    /// Maximum number of waiters.
    #[builder(default = 2048)]
    capacity: usize,
}

/// A snapshot of the state of a [DelayQueue].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Whether the queue is currently shedding.
    pub dropping: bool,
    /// When waits will be considered persistently above target, if they are above target now.
    pub fa_time: Option<Instant>,
    /// When the next drop is due, once dropping has happened.
    pub drop_next: Option<Instant>,
    /// Consecutive drops in the current (or most recent) dropping state.
    pub drop_count: u32,
    /// Number of waiters.
    pub depth: usize,
}

#[derive(Debug)]
struct Buffer {
    entries: VecDeque<Entry>,
    free: Vec<SlotId>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry {
    /// Increases monotonically, so entries are ordered by `seq`.
    seq: u64,
    slot: SlotId,
    enqueued: Millis,
}

/// A queued caller. Returns its slot to the pool when dropped.
#[derive(Debug)]
struct Waiter<'q> {
    queue: &'q DelayQueue,
    seq: u64,
    slot: SlotId,
    finished: bool,
}

impl DelayQueue {
    /// Create a queue.
    ///
    /// Panics if `capacity` or `interval` is zero.
    pub fn new(options: QueueOptions) -> Self {
        assert!(options.capacity >= 1, "capacity must be at least 1");
        assert!(!options.interval.is_zero(), "interval must be non-zero");

        let slots = (0..options.capacity).map(|_| Slot::default()).collect();

        Self {
            clock: Clock::new(),
            slots,
            buffer: Mutex::new(Buffer {
                entries: VecDeque::with_capacity(options.capacity),
                // Reversed so slots are handed out in order.
                free: (0..options.capacity).rev().collect(),
                next_seq: 0,
            }),
            codel: Mutex::new(CoDel::new(options.target, options.interval)),
        }
    }

    /// Wait in the queue for a turn.
    ///
    /// Fails immediately with [Error::LimitExceeded] if the queue is full. Otherwise waits until
    /// either:
    ///
    /// - a call to [pop()](Self::pop()) admits (`Ok`) or sheds ([Error::LimitExceeded]) this
    ///   waiter, or
    /// - `cancelled` completes, returning [Error::Deadline].
    ///
    /// A decision which has already been made wins over cancellation.
    pub async fn push<F>(&self, cancelled: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let waiter = self.enqueue()?;

        let decision = tokio::select! {
            biased;
            () = cancelled => None,
            decision = self.slots[waiter.slot].wait() => Some(decision),
        };

        match decision {
            Some(decision) => waiter.finish(decision),
            None => waiter.cancel(),
        }
    }

    /// Release the next waiter, if any.
    ///
    /// Waiters judged to have waited too long are shed, and the next one is tried, until either
    /// one is admitted or the queue is empty. Never blocks.
    pub fn pop(&self) {
        let mut buffer = self.lock_buffer();

        // Deliver while holding the lock, so a waiter being cancelled either finds itself still
        // queued or finds its decision.
        while let Some(entry) = buffer.entries.pop_front() {
            let shed = self.judge(entry.enqueued);

            if shed {
                self.slots[entry.slot].deliver(Decision::Drop);
            } else {
                self.slots[entry.slot].deliver(Decision::Admit);
                return;
            }
        }
    }

    /// The current state of the queue.
    pub fn stats(&self) -> QueueStats {
        let depth = self.len();
        let codel = self.lock_codel();

        QueueStats {
            dropping: codel.dropping(),
            fa_time: codel.fa_time().map(|t| self.clock.instant_at(t)),
            drop_next: codel.drop_next().map(|t| self.clock.instant_at(t)),
            drop_count: codel.count(),
            depth,
        }
    }

    /// Number of waiters.
    pub fn len(&self) -> usize {
        self.lock_buffer().entries.len()
    }

    /// Whether there are no waiters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue(&self) -> Result<Waiter<'_>, Error> {
        let mut buffer = self.lock_buffer();

        let Some(slot) = buffer.free.pop() else {
            tracing::trace!("queue full, rejecting");
            return Err(Error::LimitExceeded);
        };
        self.slots[slot].reset();

        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.entries.push_back(Entry {
            seq,
            slot,
            enqueued: self.clock.now(),
        });

        Ok(Waiter {
            queue: self,
            seq,
            slot,
            finished: false,
        })
    }

    fn judge(&self, enqueued: Millis) -> bool {
        let now = self.clock.now();
        self.lock_codel().judge(now, enqueued)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().expect("lock should not be poisoned")
    }

    fn lock_codel(&self) -> MutexGuard<'_, CoDel> {
        self.codel.lock().expect("lock should not be poisoned")
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Waiter<'_> {
    fn finish(mut self, decision: Decision) -> Result<(), Error> {
        self.finished = true;
        self.queue.lock_buffer().free.push(self.slot);

        match decision {
            Decision::Admit => Ok(()),
            Decision::Drop => Err(Error::LimitExceeded),
        }
    }

    fn cancel(mut self) -> Result<(), Error> {
        match self.leave() {
            Some(Decision::Admit) => Ok(()),
            Some(Decision::Drop) => Err(Error::LimitExceeded),
            None => Err(Error::Deadline),
        }
    }

    /// Leave the queue, returning the slot to the pool.
    ///
    /// Returns the decision if one was made before we left.
    fn leave(&mut self) -> Option<Decision> {
        self.finished = true;

        let mut buffer = self.queue.lock_buffer();
        let decision = match buffer
            .entries
            .binary_search_by_key(&self.seq, |entry| entry.seq)
        {
            Ok(index) => {
                buffer.entries.remove(index);
                None
            }
            // Already popped, and `pop()` delivers under the lock.
            Err(_) => self.queue.slots[self.slot].decision(),
        };
        buffer.free.push(self.slot);

        decision
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        // Abandoned mid-wait. If we'd already been given a turn, pass it on.
        if let Some(Decision::Admit) = self.leave() {
            self.queue.pop();
        }
    }
}
