//! Fixed-interval bounded polling with cooperative cancellation.
//!
//! An attempt runs immediately, then up to `retries` more attempts run,
//! each preceded by one `interval` wait. Exhausting the budget therefore
//! costs exactly `retries` waits. A `watch` shutdown signal interrupts
//! any wait.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use isvc_core::PollSchedule;

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    /// An attempt succeeded.
    Ready(T),
    /// Every attempt failed; carries the last failure.
    Exhausted(E),
    /// The shutdown signal fired before an attempt succeeded.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Poller {
    schedule: PollSchedule,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    pub fn new(schedule: PollSchedule, shutdown: watch::Receiver<bool>) -> Self {
        Self { schedule, shutdown }
    }

    pub fn schedule(&self) -> PollSchedule {
        self.schedule
    }

    /// Run `attempt` until it succeeds, the budget runs out, or shutdown.
    ///
    /// `attempt` receives the attempt number, starting at 0.
    pub async fn run<T, E, F, Fut>(&mut self, what: &str, mut attempt: F) -> PollOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if self.is_shutdown() {
            return PollOutcome::Cancelled;
        }

        let mut last = match attempt(0).await {
            Ok(value) => return PollOutcome::Ready(value),
            Err(e) => e,
        };

        for n in 1..=self.schedule.retries {
            debug!(
                what,
                attempt = n,
                retries = self.schedule.retries,
                error = %last,
                "attempt failed, waiting before retry"
            );
            if self.wait(self.schedule.interval).await {
                debug!(what, attempt = n, "poll cancelled");
                return PollOutcome::Cancelled;
            }
            last = match attempt(n).await {
                Ok(value) => return PollOutcome::Ready(value),
                Err(e) => e,
            };
        }

        PollOutcome::Exhausted(last)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `interval`; returns true if shutdown fired first.
    async fn wait(&mut self, interval: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }

        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.shutdown.changed() => match changed {
                    Ok(()) if *self.shutdown.borrow() => return true,
                    Ok(()) => continue,
                    // Sender gone: nobody can cancel any more.
                    Err(_) => {
                        (&mut sleep).await;
                        return false;
                    }
                },
            }
        }
    }
}
