/// Why a job was not admitted.
///
/// Neither error is retried by the limiter. Callers should back off before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The wait queue was full, or the job was shed after waiting too long in the queue.
    #[error("limit exceeded")]
    LimitExceeded,
    /// The caller gave up (deadline or cancellation) while waiting in the queue.
    #[error("deadline exceeded while waiting for admission")]
    Deadline,
}
