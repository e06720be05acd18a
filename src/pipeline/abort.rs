use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;

/// The reply half delivered to a stage on abort.
///
/// A stage acknowledges by sending `None` (clean abort) or `Some(err)` (a
/// drain error). Dropping the sender without replying counts as a clean
/// abort: the worker demonstrably returned.
pub type AbortAck = oneshot::Sender<Option<Error>>;

/// One entry per stage on the stream returned by
/// [`Job::abort`](crate::pipeline::job::Job::abort).
pub type AbortResult = std::result::Result<(), Error>;

const DEFAULT_ABORT_TIMEOUT_MS: u64 = 10_000;

static ABORT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_ABORT_TIMEOUT_MS);

/// The process-wide bound on abort delivery and on waiting for an ack.
pub fn abort_timeout() -> Duration {
    Duration::from_millis(ABORT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Override the process-wide abort timeout. Applies to aborts issued after
/// the call.
pub fn set_abort_timeout(timeout: Duration) {
    ABORT_TIMEOUT_MS.store(timeout.as_millis() as u64, Ordering::Relaxed);
}
