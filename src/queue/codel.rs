use std::time::Duration;

use crate::clock::{as_millis, Millis};

/// Controlled Delay (CoDel) drop policy.
///
/// Watches how long requests have been waiting when they leave the queue. Short waits are fine.
/// If every request has waited longer than `target` for a whole `interval`, the queue is
/// considered standing (bufferbloat) and requests start being shed. While shedding, the gap
/// between drops shrinks with `interval / sqrt(count)`, so sustained congestion is shed
/// progressively harder.
///
/// Every method takes `now` explicitly, so the policy can be driven deterministically.
///
/// - [Controlling Queue Delay](https://queue.acm.org/detail.cfm?id=2209336)
#[derive(Debug)]
pub(crate) struct CoDel {
    target: Millis,
    interval: Millis,

    dropping: bool,
    /// When we'll declare we're above target. `None` while below target.
    fa_time: Option<Millis>,
    /// When the next drop is due. `None` until the first drop.
    drop_next: Option<Millis>,
    /// Drops since entering the dropping state. Never zero.
    count: u32,
}

impl CoDel {
    pub(crate) fn new(target: Duration, interval: Duration) -> Self {
        Self {
            target: as_millis(target),
            interval: as_millis(interval),

            dropping: false,
            fa_time: None,
            drop_next: None,
            count: 1,
        }
    }

    pub(crate) fn dropping(&self) -> bool {
        self.dropping
    }

    pub(crate) fn fa_time(&self) -> Option<Millis> {
        self.fa_time
    }

    pub(crate) fn drop_next(&self) -> Option<Millis> {
        self.drop_next
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// Decide whether a request enqueued at `enqueued` should be dropped when dequeued at `now`.
    pub(crate) fn judge(&mut self, now: Millis, enqueued: Millis) -> bool {
        let elapsed = now.saturating_sub(enqueued);
        let above_target = self.check_above_target(now, elapsed);

        if self.dropping {
            if !above_target {
                self.dropping = false;
                tracing::debug!(elapsed, "queue delay recovered, leaving dropping state");
                return false;
            }

            if let Some(drop_next) = self.drop_next.filter(|&drop_next| now > drop_next) {
                self.count = self.count.saturating_add(1);
                self.drop_next = Some(self.control_law(drop_next));
                tracing::trace!(elapsed, count = self.count, "shedding queued request");
                return true;
            }
        }

        // Not dropping, or dropping but the next drop isn't due. In the latter case
        // `drop_next` is still ahead of us, so this counts as a recent drop cycle.
        let dropped_recently = self
            .drop_next
            .is_some_and(|drop_next| now.saturating_sub(drop_next) < self.interval);
        let above_for_interval = self
            .fa_time
            .is_some_and(|fa_time| now.saturating_sub(fa_time) >= self.interval);

        if above_target && (dropped_recently || above_for_interval) {
            let was_dropping = std::mem::replace(&mut self.dropping, true);

            // The rate which controlled the queue last cycle is a good place to start again.
            self.count = if dropped_recently && self.count > 2 {
                self.count - 2
            } else {
                1
            };
            self.drop_next = Some(self.control_law(now));

            if was_dropping {
                tracing::trace!(elapsed, count = self.count, "shedding queued request");
            } else {
                tracing::debug!(
                    elapsed,
                    count = self.count,
                    "queue delay above target, entering dropping state"
                );
            }
            return true;
        }

        false
    }

    fn check_above_target(&mut self, now: Millis, elapsed: Millis) -> bool {
        if elapsed < self.target {
            self.fa_time = None;
            return false;
        }

        match self.fa_time {
            None => {
                self.fa_time = Some(now + self.interval);
                false
            }
            Some(fa_time) => now >= fa_time,
        }
    }

    fn control_law(&self, t: Millis) -> Millis {
        let gap = Duration::from_millis(self.interval).div_f64(f64::from(self.count).sqrt());
        t + as_millis(gap)
    }
}
