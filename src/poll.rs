//! Bounded polling with an explicit deadline and interval.
//!
//! Every wait in a run (quorum convergence, wipe detection, domain sanity) is
//! a `Poll`: probe, and if the condition does not hold yet sleep one interval
//! and probe again, as long as the next probe still falls within the deadline.
//! A deadline shorter than one interval therefore yields exactly one probe.
//!
//! Uses `tokio::time` so tests can run on paused time.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A deadline and the spacing between probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub timeout: Duration,
    pub interval: Duration,
}

/// The condition never held within the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout {
    pub polls: u32,
    pub elapsed: Duration,
}

impl Poll {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Probe until `probe` yields a value or the deadline passes.
    ///
    /// `probe` receives the 1-based attempt number.
    pub async fn until<T, F, Fut>(&self, mut probe: F) -> Result<T, PollTimeout>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            if let Some(value) = probe(polls).await {
                return Ok(value);
            }
            let elapsed = start.elapsed();
            if elapsed + self.interval > self.timeout {
                return Err(PollTimeout { polls, elapsed });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn deadline_shorter_than_interval_polls_once() {
        let calls = AtomicU32::new(0);
        let poll = Poll::new(Duration::from_millis(10), Duration::from_secs(1));
        let res: Result<(), _> = poll
            .until(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            })
            .await;
        assert_eq!(res.unwrap_err().polls, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_up_to_and_including_the_deadline() {
        let poll = Poll::new(Duration::from_secs(10), Duration::from_secs(5));
        let res: Result<(), _> = poll.until(|_| async { None }).await;
        // t=0, t=5, t=10
        assert_eq!(res.unwrap_err().polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_ready_value() {
        let poll = Poll::new(Duration::from_secs(60), Duration::from_secs(1));
        let res = poll
            .until(|attempt| async move { (attempt == 4).then_some(attempt * 10) })
            .await;
        assert_eq!(res, Ok(40));
    }
}
