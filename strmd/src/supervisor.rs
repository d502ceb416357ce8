//! Keeps long-lived jobs alive: a failed job is restarted after a delay until
//! the stop token fires.

use std::fmt::Display;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sync::backoff::Backoff;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub backoff: Backoff,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::fixed(delay),
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    Finished,
    GaveUp,
}

pub struct Supervisor {
    name: &'static str,
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(name: &'static str, policy: RestartPolicy) -> Self {
        Self { name, policy }
    }

    /// Runs `job` until it returns `Ok`, the stop token fires, or the restart
    /// budget is spent. Every restart starts a fresh future from `job`.
    pub async fn run<F, Fut, E>(&self, stop: &CancellationToken, mut job: F) -> Exit
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut restarts = 0u32;
        loop {
            if stop.is_cancelled() {
                return Exit::Stopped;
            }
            let err = match job().await {
                Ok(()) if stop.is_cancelled() => return Exit::Stopped,
                Ok(()) => {
                    tracing::info!(job = self.name, "job finished");
                    return Exit::Finished;
                }
                Err(err) => err,
            };

            if self
                .policy
                .max_restarts
                .is_some_and(|max| restarts >= max)
            {
                tracing::error!(job = self.name, error = %err, restarts, "job failed, giving up");
                return Exit::GaveUp;
            }
            let delay = self.policy.backoff.delay(restarts);
            restarts += 1;
            tracing::error!(job = self.name, error = %err, ?delay, "job failed, restarting");
            tokio::select! {
                _ = stop.cancelled() => return Exit::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
