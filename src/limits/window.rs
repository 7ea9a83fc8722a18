use std::{
    sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize},
    time::Duration,
};

/// Samples for the current measurement window.
///
/// Written to concurrently by completing jobs. Replaced wholesale with a fresh window when it
/// rolls over, never reset in place.
#[derive(Debug, Default)]
pub(crate) struct Window {
    count: AtomicUsize,
    dropped: AtomicBool,
    max_in_flight: AtomicUsize,
    total_rtt_nanos: AtomicU64,
}

/// A summary of a retired [Window].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Summary {
    pub(crate) count: usize,
    pub(crate) dropped: bool,
    pub(crate) max_in_flight: usize,
    /// Mean round-trip time.
    pub(crate) rtt: Duration,
}

impl Window {
    pub(crate) fn add(&self, rtt: Duration, in_flight: usize, dropped: bool) {
        let nanos = u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX);
        self.total_rtt_nanos
            .fetch_add(nanos, atomic::Ordering::Relaxed);
        self.max_in_flight
            .fetch_max(in_flight, atomic::Ordering::Relaxed);
        if dropped {
            self.dropped.store(true, atomic::Ordering::Relaxed);
        }
        self.count.fetch_add(1, atomic::Ordering::AcqRel);
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(atomic::Ordering::Acquire)
    }

    pub(crate) fn summary(&self) -> Summary {
        let count = self.count();
        let total = self.total_rtt_nanos.load(atomic::Ordering::Relaxed);
        let rtt = match u64::try_from(count) {
            Ok(count) if count > 0 => Duration::from_nanos(total / count),
            _ => Duration::ZERO,
        };

        Summary {
            count,
            dropped: self.dropped.load(atomic::Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(atomic::Ordering::Relaxed),
            rtt,
        }
    }
}
