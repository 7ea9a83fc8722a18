use std::{
    sync::{
        atomic::{self, AtomicU64, AtomicUsize},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bon::Builder;
use conv::ConvUtil;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::Instant;

use crate::clock::{as_millis, Clock, Millis};

use super::{
    window::{Summary, Window},
    Outcome,
};

/// Delay- and loss-based concurrency limit, inspired by TCP Vegas.
///
/// Completed jobs are aggregated into windows. At the end of each window the mean latency is
/// compared with the minimum observed latency to estimate how many jobs are queueing, and the
/// limit is moved accordingly:
///
/// ```text
/// L         = current limit
/// MIN_D     = estimated latency with no queueing
/// D         = mean latency over the window
/// queue     = L * (1 - MIN_D / D)
/// threshold = sqrt(L) / 2
///
/// any job overloaded  => L - threshold
/// utilisation < 50%   => L
/// queue < threshold   => L + 6 * threshold
/// queue < 2 threshold => L + 3 * threshold
/// queue < 3 threshold => L + threshold
/// queue > 6 threshold => L - threshold
/// otherwise           => L
/// ```
///
/// The minimum latency is periodically re-probed when traffic is light, so it can follow the
/// system as it changes. The interval between probes is randomised and scales with the limit.
///
/// - [TCP Vegas: End to End Congestion Avoidance on a Global
///   Internet](https://www.cs.princeton.edu/courses/archive/fall06/cos561/papers/vegas.pdf)
#[derive(Debug)]
pub struct Vegas {
    options: VegasOptions,
    clock: Clock,

    limit: AtomicUsize,
    in_flight: AtomicUsize,
    /// Earliest time the current window can end.
    update_time: AtomicU64,

    window: ArcSwap<Window>,
    inner: Mutex<Inner>,
}

/// Configuration for [Vegas].
#[derive(Debug, Clone, Builder)]
pub struct VegasOptions {
    /// The limit never drops below this. Also the initial limit.
    #[builder(default = 8)]
    min_limit: usize,
    /// The limit never rises above this.
    #[builder(default = 2048)]
    max_limit: usize,
    /// Shortest measurement window.
    #[builder(default = Duration::from_millis(500))]
    min_window: Duration,
    /// Longest measurement window, once enough samples have been collected.
    #[builder(default = Duration::from_millis(2000))]
    max_window: Duration,
}

/// A snapshot of the state of [Vegas].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VegasStats {
    /// The current concurrency limit.
    pub limit: usize,
    /// The number of jobs in flight.
    pub in_flight: usize,
    /// Estimated latency with no queueing. Zero until the first window completes.
    pub min_rtt: Duration,
    /// Mean latency of the last completed window.
    pub last_rtt: Duration,
}

/// Records the completion of a job acquired from [Vegas].
///
/// Must be released exactly once. Dropping it without releasing is the same as releasing with
/// [Outcome::Ignore].
#[derive(Debug)]
#[must_use = "dropping a completion ignores the job"]
pub struct Completion {
    vegas: Option<Arc<Vegas>>,
    /// Jobs in flight when this one was acquired, including itself.
    in_flight: usize,
}

#[derive(Debug)]
struct Inner {
    min_rtt: Duration,
    last_rtt: Duration,
    /// Windows until the minimum latency is next re-probed.
    probes: usize,
    rng: SmallRng,
}

impl Vegas {
    /// Samples needed before a window can end.
    const MIN_WINDOW_SAMPLES: usize = 16;
    const INITIAL_PROBES: usize = 100;
    /// Window length, as a multiple of the last window's latency.
    const WINDOW_RTT_MULTIPLE: u32 = 5;

    /// Create a limit, seeded from system entropy.
    pub fn new(options: VegasOptions) -> Arc<Self> {
        Self::with_rng(options, SmallRng::from_entropy())
    }

    /// Create a limit using the given source of randomness.
    ///
    /// Panics if `min_limit` is zero or the limit or window bounds are inverted.
    pub fn with_rng(options: VegasOptions, rng: SmallRng) -> Arc<Self> {
        assert!(options.min_limit >= 1, "min limit must be at least 1");
        assert!(
            options.min_limit <= options.max_limit,
            "min limit must not exceed max limit"
        );
        assert!(
            options.min_window <= options.max_window,
            "min window must not exceed max window"
        );

        Arc::new(Self {
            clock: Clock::new(),

            limit: AtomicUsize::new(options.min_limit),
            in_flight: AtomicUsize::new(0),
            update_time: AtomicU64::new(0),

            window: ArcSwap::from_pointee(Window::default()),
            inner: Mutex::new(Inner {
                min_rtt: Duration::ZERO,
                last_rtt: Duration::ZERO,
                probes: Self::INITIAL_PROBES,
                rng,
            }),

            options,
        })
    }

    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit.load(atomic::Ordering::Acquire)
    }

    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(atomic::Ordering::Acquire)
    }

    /// The current state of the limit.
    pub fn stats(&self) -> VegasStats {
        let inner = self.lock_inner();
        VegasStats {
            limit: self.limit(),
            in_flight: self.in_flight(),
            min_rtt: inner.min_rtt,
            last_rtt: inner.last_rtt,
        }
    }

    /// Start a job, returning whether it's within the limit.
    ///
    /// The job counts as in flight either way, until the returned [Completion] is released.
    pub fn acquire(self: &Arc<Self>) -> (Completion, bool) {
        let in_flight = self.in_flight.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        let allowed = in_flight <= self.limit();

        let completion = Completion {
            vegas: Some(Arc::clone(self)),
            in_flight,
        };
        (completion, allowed)
    }

    fn complete(&self, in_flight: usize, start: Instant, outcome: Outcome) {
        self.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);

        if outcome == Outcome::Ignore {
            return;
        }

        let end = Instant::now();
        let rtt = end.saturating_duration_since(start);

        let window = self.window.load_full();
        window.add(rtt, in_flight, outcome == Outcome::Drop);

        let now = self.clock.millis_at(end);
        if window.count() >= Self::MIN_WINDOW_SAMPLES
            && now >= self.update_time.load(atomic::Ordering::Acquire)
        {
            self.roll_window(&window, now);
        }
    }

    /// Start a new window, and update the limit from the old one.
    ///
    /// Only the first caller to swap out a given window gets to update the limit.
    fn roll_window(&self, window: &Arc<Window>, now: Millis) {
        let mut inner = self.lock_inner();

        let previous = self
            .window
            .compare_and_swap(window, Arc::new(Window::default()));
        if !Arc::ptr_eq(&previous, window) {
            return;
        }

        let summary = window.summary();
        if summary.rtt.is_zero() {
            return;
        }

        let limit = self.limit();

        self.update_time
            .store(self.next_update_time(now, summary.rtt), atomic::Ordering::Release);

        inner.last_rtt = summary.rtt;
        self.update_min_rtt(&mut inner, &summary, limit);

        if let Some(new_limit) = self.next_limit(limit, inner.min_rtt, &summary) {
            if new_limit != limit {
                tracing::debug!(
                    limit = new_limit,
                    previous = limit,
                    min_rtt = ?inner.min_rtt,
                    last_rtt = ?summary.rtt,
                    dropped = summary.dropped,
                    "updated concurrency limit"
                );
            }
            self.limit.store(new_limit, atomic::Ordering::Release);
        }
    }

    fn next_update_time(&self, now: Millis, last_rtt: Duration) -> Millis {
        let window = last_rtt
            .saturating_mul(Self::WINDOW_RTT_MULTIPLE)
            .clamp(self.options.min_window, self.options.max_window);
        now + as_millis(window)
    }

    fn update_min_rtt(&self, inner: &mut Inner, summary: &Summary, limit: usize) {
        inner.probes = inner.probes.saturating_sub(1);

        // Only trust a probe taken while lightly loaded.
        if inner.probes == 0
            && (summary.max_in_flight * 2 < limit || summary.max_in_flight <= self.options.min_limit)
        {
            let base = 3 * limit;
            inner.probes = base + inner.rng.gen_range(0..base);
            inner.min_rtt = summary.rtt;

            tracing::trace!(min_rtt = ?inner.min_rtt, probes = inner.probes, "re-probed min rtt");
        }

        if inner.min_rtt.is_zero() || summary.rtt < inner.min_rtt {
            inner.min_rtt = summary.rtt;
        }
    }

    /// The new limit, if it should change.
    fn next_limit(&self, limit: usize, min_rtt: Duration, summary: &Summary) -> Option<usize> {
        let old_limit = limit as f64;
        let threshold = old_limit.sqrt() / 2.0;

        let new_limit = if summary.dropped {
            old_limit - threshold
        } else if summary.max_in_flight * 2 < limit {
            // Too little traffic to tell
            return None;
        } else {
            let queue = old_limit * (1.0 - min_rtt.as_secs_f64() / summary.rtt.as_secs_f64());

            if queue < threshold {
                old_limit + 6.0 * threshold
            } else if queue < 2.0 * threshold {
                old_limit + 3.0 * threshold
            } else if queue < 3.0 * threshold {
                old_limit + threshold
            } else if queue > 6.0 * threshold {
                old_limit - threshold
            } else {
                return None;
            }
        };

        Some(self.clamp(new_limit))
    }

    fn clamp(&self, limit: f64) -> usize {
        limit
            .clamp(self.options.min_limit as f64, self.options.max_limit as f64)
            .floor()
            .approx_as::<usize>()
            .unwrap_or(self.options.min_limit)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock should not be poisoned")
    }
}

impl Default for VegasOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Completion {
    /// Record the outcome of a job which started at `start`.
    pub fn release(mut self, start: Instant, outcome: Outcome) {
        if let Some(vegas) = self.vegas.take() {
            vegas.complete(self.in_flight, start, outcome);
        }
    }

    /// Release without recording a sample.
    pub fn ignore(self) {
        self.release(Instant::now(), Outcome::Ignore);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(vegas) = self.vegas.take() {
            vegas.complete(self.in_flight, Instant::now(), Outcome::Ignore);
        }
    }
}
