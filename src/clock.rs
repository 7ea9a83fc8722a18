use std::time::Duration;

use tokio::time::Instant;

/// Milliseconds since a [Clock]'s epoch.
pub(crate) type Millis = u64;

/// A monotonic millisecond clock, relative to when it was created.
///
/// Backed by tokio's [Instant] so time can be paused and advanced in tests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> Millis {
        self.millis_at(Instant::now())
    }

    pub(crate) fn millis_at(&self, instant: Instant) -> Millis {
        as_millis(instant.saturating_duration_since(self.epoch))
    }

    pub(crate) fn instant_at(&self, millis: Millis) -> Instant {
        self.epoch + Duration::from_millis(millis)
    }
}

pub(crate) fn as_millis(duration: Duration) -> Millis {
    Millis::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_from_creation() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(clock.now(), 1500);
        assert_eq!(clock.instant_at(1500), Instant::now());
    }
}
