//! Fixed-interval polling for asynchronous providers.
//!
//! A job is checked after each sleep, at most `max_attempts` times. The loop
//! is an explicit [`PollState`] machine so that tests can drive it with a fake
//! [`PollClock`] and observe every transition; cancellation is checked during
//! each sleep and each status check.

use crate::error::{InkVizError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep before each status check.
    pub interval: Duration,
    /// Number of status checks before giving up.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

impl PollPolicy {
    /// Worst-case wall time spent sleeping.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Source of poll delays.
#[async_trait]
pub trait PollClock: Send + Sync {
    /// Suspends for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl PollClock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What a single status check observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// Job still queued or running.
    Pending,
    /// Job finished; carries whatever the caller needs next (e.g. output URL).
    Succeeded(T),
    /// Job failed with the provider-supplied reason.
    Failed(String),
}

/// Position of the poll loop. `attempt` counts completed status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// About to sleep before check `attempt + 1`.
    Sleeping { attempt: u32 },
    /// About to perform check `attempt + 1`.
    Checking { attempt: u32 },
    /// All attempts used without a terminal status.
    Exhausted { attempts: u32 },
}

impl PollState {
    /// Initial state.
    pub fn start() -> Self {
        Self::Sleeping { attempt: 0 }
    }

    /// Transition taken once a sleep completes.
    pub fn after_sleep(self) -> Self {
        match self {
            Self::Sleeping { attempt } => Self::Checking { attempt },
            other => other,
        }
    }

    /// Transition taken when a check reports [`PollStatus::Pending`].
    pub fn after_pending(self, policy: &PollPolicy) -> Self {
        match self {
            Self::Checking { attempt } => {
                let done = attempt + 1;
                if done >= policy.max_attempts {
                    Self::Exhausted { attempts: done }
                } else {
                    Self::Sleeping { attempt: done }
                }
            }
            other => other,
        }
    }
}

/// Runs poll loops under a [`PollPolicy`].
#[derive(Clone)]
pub struct Poller {
    policy: PollPolicy,
    clock: Arc<dyn PollClock>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("policy", &self.policy).finish()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(PollPolicy::default(), Arc::new(TokioClock))
    }
}

impl Poller {
    /// Creates a poller with the given policy and clock.
    pub fn new(policy: PollPolicy, clock: Arc<dyn PollClock>) -> Self {
        Self { policy, clock }
    }

    /// Drives `check` until it reports a terminal status.
    ///
    /// `check` receives the 1-based attempt number. A `Failed` status or an
    /// error from `check` ends the loop immediately; running out of attempts
    /// yields [`InkVizError::Timeout`].
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut check: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PollStatus<T>>>,
    {
        let mut state = PollState::start();

        loop {
            state = match state {
                PollState::Sleeping { .. } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(InkVizError::Cancelled),
                        _ = self.clock.sleep(self.policy.interval) => state.after_sleep(),
                    }
                }
                PollState::Checking { attempt } => {
                    let status = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(InkVizError::Cancelled),
                        status = check(attempt + 1) => status?,
                    };
                    match status {
                        PollStatus::Succeeded(value) => return Ok(value),
                        PollStatus::Failed(reason) => return Err(InkVizError::PollFailed(reason)),
                        PollStatus::Pending => {
                            tracing::trace!(attempt = attempt + 1, "job still pending");
                            state.after_pending(&self.policy)
                        }
                    }
                }
                PollState::Exhausted { attempts } => {
                    tracing::debug!(attempts, "poll attempts exhausted");
                    return Err(InkVizError::Timeout(self.policy.ceiling()));
                }
            };
        }
    }
}
