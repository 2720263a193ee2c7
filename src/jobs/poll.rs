use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::BackoffConfig;
use crate::error::RemoteError;

/// Exponential backoff: `multiplier * 2^attempt` seconds clamped to `[min_wait, max_wait]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub multiplier: f64,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl BackoffPolicy {
    pub fn new(multiplier: f64, min_wait: Duration, max_wait: Duration) -> Self {
        Self { multiplier, min_wait, max_wait }
    }

    /// Wait before the poll following `attempt` (0-based).
    pub fn wait(&self, attempt: u32) -> Duration {
        let secs = self.multiplier * 2f64.powi(attempt.min(62) as i32);
        let raw = if secs.is_finite() && secs < self.max_wait.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_wait
        };
        raw.clamp(self.min_wait, self.max_wait)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            config.multiplier,
            Duration::from_secs(config.min_wait_secs),
            Duration::from_secs(config.max_wait_secs),
        )
    }
}

/// Coarse state of a remote job as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Completed,
    Failed,
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Completed(T),
    Failed(T),
    /// The deadline passed while the job was still running
    TimedOut { waited: Duration, polls: u32 },
    /// A non-retryable error was returned while polling
    Rejected(RemoteError),
}

/// Poll until `classify` reports a terminal phase, the deadline passes, or a
/// permanent error occurs.
///
/// The deadline is measured from `started`. Transient errors are retried on the
/// same schedule as a running job and count against the same deadline. No poll
/// is issued once the deadline has passed.
pub async fn poll_until_terminal<T, P, Fut, C>(
    mut poll: P,
    classify: C,
    backoff: &BackoffPolicy,
    started: Instant,
    deadline: Duration,
) -> PollOutcome<T>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    C: Fn(&T) -> Phase,
{
    let deadline_at = started + deadline;
    let mut attempt: u32 = 0;
    let mut polls: u32 = 0;

    loop {
        if Instant::now() >= deadline_at {
            return PollOutcome::TimedOut { waited: started.elapsed(), polls };
        }

        polls += 1;
        match poll().await {
            Ok(report) => match classify(&report) {
                Phase::Completed => return PollOutcome::Completed(report),
                Phase::Failed => return PollOutcome::Failed(report),
                Phase::Running => debug!("Still running after {} polls", polls),
            },
            Err(e) if e.is_transient() => warn!("Transient error while polling, retrying: {}", e),
            Err(e) => return PollOutcome::Rejected(e),
        }

        let now = Instant::now();
        if now >= deadline_at {
            continue;
        }
        let wait = backoff.wait(attempt).min(deadline_at - now);
        attempt = attempt.saturating_add(1);
        debug!("Next poll in {:?}", wait);
        sleep(wait).await;
    }
}
