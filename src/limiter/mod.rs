//! The admission limiter: a concurrency limit with a wait queue in front of it.

use std::{future::Future, sync::Arc, time::Duration};

use bon::Builder;
use rand::rngs::SmallRng;
use tokio::time::Instant;

use crate::{
    limits::{Completion, Vegas, VegasOptions},
    queue::{DelayQueue, QueueOptions},
    Error,
};

pub use token::Token;

mod token;

/// Limits the number of concurrent jobs, queueing the excess.
///
/// Jobs within the concurrency limit are admitted straight away. Beyond the limit, jobs wait in
/// a bounded [DelayQueue] and are let in one at a time as running jobs finish, or shed if the
/// queue has been standing for too long.
///
/// The limit is adjusted automatically by [Vegas], based on observed latency (delay) and jobs
/// which fail because of overload (loss).
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Limiter {
    vegas: Arc<Vegas>,
    queue: Arc<DelayQueue>,
}

/// Configuration for a [Limiter].
#[derive(Debug, Clone, Default, Builder)]
pub struct LimiterOptions {
    /// Wait queue configuration.
    #[builder(default)]
    queue: QueueOptions,
    /// Concurrency limit configuration.
    #[builder(default)]
    vegas: VegasOptions,
}

/// A snapshot of the state of the [Limiter].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// The current concurrency limit.
    pub limit: usize,
    /// The number of jobs in flight, including jobs waiting in the queue.
    pub in_flight: usize,
    /// Estimated latency with no queueing.
    pub min_rtt: Duration,
    /// Mean latency of the last measurement window.
    pub last_rtt: Duration,
    /// The number of jobs waiting in the queue.
    pub queue_depth: usize,
    /// Whether the queue is shedding.
    pub dropping: bool,
    /// When queueing delay will be considered persistently above target.
    pub fa_time: Option<Instant>,
    /// When the queue's next drop is due.
    pub drop_next: Option<Instant>,
    /// Consecutive drops in the queue's current (or most recent) dropping state.
    pub drop_count: u32,
}

/// The result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job succeeded, or failed in a way unrelated to overload.
    Success,
    /// The job shouldn't be used to update the limit, e.g. it never actually ran.
    Ignore,
    /// The job failed because of overload, e.g. it timed out or an explicit backpressure signal
    /// was observed.
    Drop,
}

impl Limiter {
    /// Create a limiter.
    pub fn new(options: LimiterOptions) -> Self {
        Self::from_parts(Vegas::new(options.vegas), options.queue)
    }

    /// Create a limiter using the given source of randomness.
    pub fn with_rng(options: LimiterOptions, rng: SmallRng) -> Self {
        Self::from_parts(Vegas::with_rng(options.vegas, rng), options.queue)
    }

    fn from_parts(vegas: Arc<Vegas>, queue: QueueOptions) -> Self {
        Self {
            vegas,
            queue: Arc::new(DelayQueue::new(queue)),
        }
    }

    /// Acquire a concurrency [Token], waiting in the queue if over the limit.
    ///
    /// Gives up with [Error::Deadline] once `cancelled` completes. Fails with
    /// [Error::LimitExceeded] if the queue is full, or the job is shed from the queue.
    pub async fn allow<F>(&self, cancelled: F) -> Result<Token, Error>
    where
        F: Future<Output = ()>,
    {
        let (completion, allowed) = self.vegas.acquire();
        if allowed {
            return Ok(self.mint_token(completion));
        }

        match self.queue.push(cancelled).await {
            Ok(()) => {
                // We were counted while waiting, but only start the job now.
                completion.ignore();
                let (completion, _) = self.vegas.acquire();
                Ok(self.mint_token(completion))
            }
            Err(e) => {
                completion.ignore();
                tracing::trace!(error = %e, "job not admitted");
                Err(e)
            }
        }
    }

    /// Acquire a concurrency [Token], waiting for up to `duration` in the queue.
    pub async fn allow_timeout(&self, duration: Duration) -> Result<Token, Error> {
        self.allow(tokio::time::sleep(duration)).await
    }

    /// Acquire a concurrency [Token], waiting in the queue until `deadline` at the latest.
    pub async fn allow_until(&self, deadline: Instant) -> Result<Token, Error> {
        self.allow(tokio::time::sleep_until(deadline)).await
    }

    /// Try to immediately acquire a concurrency [Token], without waiting in the queue.
    pub async fn try_allow(&self) -> Result<Token, Error> {
        self.allow(std::future::ready(())).await
    }

    /// The current state of the limiter.
    pub fn stats(&self) -> Stats {
        let vegas = self.vegas.stats();
        let queue = self.queue.stats();

        Stats {
            limit: vegas.limit,
            in_flight: vegas.in_flight,
            min_rtt: vegas.min_rtt,
            last_rtt: vegas.last_rtt,
            queue_depth: queue.depth,
            dropping: queue.dropping,
            fa_time: queue.fa_time,
            drop_next: queue.drop_next,
            drop_count: queue.drop_count,
        }
    }

    fn mint_token(&self, completion: Completion) -> Token {
        Token::new(completion, Arc::clone(&self.queue))
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(LimiterOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        sync::{
            atomic::{self, AtomicUsize},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use rand::{rngs::SmallRng, SeedableRng};
    use tokio_test::{assert_pending, assert_ready, task};

    use crate::{queue::QueueOptions, Error};

    use super::{Limiter, LimiterOptions, Outcome, Token};

    fn limiter(queue_capacity: usize) -> Limiter {
        Limiter::with_rng(
            LimiterOptions::builder()
                .queue(QueueOptions::builder().capacity(queue_capacity).build())
                .build(),
            SmallRng::seed_from_u64(0),
        )
    }

    async fn fill(limiter: &Limiter) -> Vec<Token> {
        let mut tokens = Vec::new();
        for _ in 0..limiter.stats().limit {
            tokens.push(limiter.try_allow().await.expect("within limit"));
        }
        tokens
    }

    #[tokio::test(start_paused = true)]
    async fn allows_within_limit() {
        let limiter = limiter(16);

        let token = limiter.try_allow().await.unwrap();
        assert_eq!(limiter.stats().in_flight, 1);

        token.release(Outcome::Success);
        assert_eq!(limiter.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_token_releases() {
        let limiter = limiter(16);

        let token = limiter.try_allow().await.unwrap();
        drop(token);

        let stats = limiter.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.last_rtt, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn queues_beyond_limit() {
        let limiter = limiter(16);
        let mut tokens = fill(&limiter).await;
        assert_eq!(tokens.len(), 8);

        let mut waiting = task::spawn(limiter.allow(future::pending()));
        assert_pending!(waiting.poll());
        assert_eq!(limiter.stats().queue_depth, 1);
        assert_eq!(limiter.stats().in_flight, 9);

        tokens.pop().unwrap().release(Outcome::Success);

        assert!(waiting.is_woken());
        let token = assert_ready!(waiting.poll()).expect("admitted from the queue");

        let stats = limiter.stats();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.in_flight, 8);

        drop(token);
        drop(tokens);
        assert_eq!(limiter.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects() {
        let limiter = limiter(1);
        let _tokens = fill(&limiter).await;

        let mut waiting = task::spawn(limiter.allow(future::pending()));
        assert_pending!(waiting.poll());

        let res = limiter.allow(future::pending()).await;
        assert_matches!(res, Err(Error::LimitExceeded));
        assert_eq!(limiter.stats().in_flight, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_in_queue() {
        let limiter = limiter(16);
        let _tokens = fill(&limiter).await;

        let res = limiter.allow_timeout(Duration::from_secs(1)).await;
        assert_matches!(res, Err(Error::Deadline));

        let stats = limiter.stats();
        assert_eq!(stats.in_flight, 8);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn try_allow_does_not_wait() {
        let limiter = limiter(16);
        let _tokens = fill(&limiter).await;

        let res = limiter.try_allow().await;
        assert_matches!(res, Err(Error::Deadline));
        assert_eq!(limiter.stats().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_wait_releases_everything() {
        let limiter = limiter(16);
        let _tokens = fill(&limiter).await;

        let mut waiting = task::spawn(limiter.allow(future::pending()));
        assert_pending!(waiting.poll());
        drop(waiting);

        let stats = limiter.stats();
        assert_eq!(stats.in_flight, 8);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn released_tokens_update_limit() {
        let limiter = limiter(16);

        for _ in 0..2 {
            for mut token in fill(&limiter).await {
                token.set_latency(Duration::from_millis(10));
                token.release(Outcome::Success);
            }
        }

        let stats = limiter.stats();
        assert_eq!(stats.limit, 16);
        assert_eq!(stats.min_rtt, Duration::from_millis(10));
        assert_eq!(stats.last_rtt, Duration::from_millis(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_returns_to_zero() {
        let limiter = Limiter::with_rng(
            LimiterOptions::builder()
                .queue(QueueOptions::builder().capacity(64).build())
                .build(),
            SmallRng::seed_from_u64(0),
        );
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..100 {
            let limiter = limiter.clone();
            let admitted = Arc::clone(&admitted);
            tasks.push(tokio::spawn(async move {
                for j in 0..20 {
                    match limiter.allow_timeout(Duration::from_millis(50)).await {
                        Ok(token) => {
                            admitted.fetch_add(1, atomic::Ordering::Relaxed);
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            let outcome = if (i + j) % 7 == 0 {
                                Outcome::Drop
                            } else {
                                Outcome::Success
                            };
                            token.release(outcome);
                        }
                        Err(_) => tokio::task::yield_now().await,
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = limiter.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queue_depth, 0);
        assert!((8..=2048).contains(&stats.limit));
        assert!(admitted.load(atomic::Ordering::Relaxed) > 0);
    }
}
