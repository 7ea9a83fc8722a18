use std::sync::Arc;

use tokio::time::Instant;

use crate::{limits::Completion, queue::DelayQueue};

use super::Outcome;

/// A concurrency token, required to run a job.
///
/// Release the token with the job's [Outcome] once it's finished. Dropping the token without
/// releasing it is the same as releasing with [Outcome::Ignore].
#[derive(Debug)]
#[must_use = "dropping a token ignores the job"]
pub struct Token {
    completion: Option<Completion>,
    queue: Arc<DelayQueue>,

    start: Instant,
}

impl Token {
    pub(crate) fn new(completion: Completion, queue: Arc<DelayQueue>) -> Self {
        Self {
            completion: Some(completion),
            queue,
            start: Instant::now(),
        }
    }

    /// Record the outcome of the job and give up the token, letting the next waiter in.
    pub fn release(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&mut self, latency: std::time::Duration) {
        self.start = Instant::now() - latency;
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion.release(self.start, outcome);
            self.queue.pop();
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.finish(Outcome::Ignore);
    }
}
