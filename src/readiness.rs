//! Bounded readiness polling.
//!
//! The poller turns a freshly submitted backend resource into a connectable
//! [`Endpoint`]. Each attempt is one `describe` call, plus an endpoint lookup
//! when the backend only reports a network identifier, plus a connection
//! check once an endpoint is known. Attempts and the sleeps between them race
//! against a caller supplied cancellation future.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::driver::{Description, Driver, DriverError, NetworkRef, RemoteState};
use crate::session::{BackendHandle, Endpoint};

/// Default number of describe attempts.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;
/// Default delay between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Attempts are clamped to this value whatever the configuration says.
pub const MAX_POLL_ATTEMPTS: u32 = 600;
/// Intervals are clamped to this value whatever the configuration says.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Attempt budget and spacing for a poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    attempts: u32,
    interval: Duration,
}

impl PollPolicy {
    /// Builds a policy, clamping attempts to `1..=MAX_POLL_ATTEMPTS` and the
    /// interval to at most [`MAX_POLL_INTERVAL`].
    #[must_use]
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.clamp(1, MAX_POLL_ATTEMPTS),
            interval: interval.min(MAX_POLL_INTERVAL),
        }
    }

    /// Number of describe attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Longest time the poller will sleep in total.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.interval
            .saturating_mul(self.attempts.saturating_sub(1))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL)
    }
}

/// Outcome of a single attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollState {
    /// Not reachable yet.
    Waiting,
    /// Reachable at the endpoint.
    Ready(Endpoint),
    /// Attempts exhausted.
    TimedOut,
    /// The backend reported a terminal failure.
    Failed(String),
}

/// What the poller should do with a description.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NextStep {
    /// Stop polling with this state.
    Settle(PollState),
    /// Resolve the identifier before deciding.
    Resolve(String),
}

/// Maps a describe result to the poller's next step.
#[must_use]
pub fn advance(description: Description) -> NextStep {
    match (description.state, description.network) {
        (RemoteState::Running, Some(NetworkRef::Address(endpoint))) => {
            NextStep::Settle(PollState::Ready(endpoint))
        }
        (RemoteState::Running, Some(NetworkRef::Lookup(id))) => NextStep::Resolve(id),
        (RemoteState::Running | RemoteState::Provisioning, _) => {
            NextStep::Settle(PollState::Waiting)
        }
        (RemoteState::Failed { reason }, _) => NextStep::Settle(PollState::Failed(reason)),
        (RemoteState::Gone, _) => NextStep::Settle(PollState::Failed(String::from(
            "resource disappeared before becoming ready",
        ))),
    }
}

/// Errors that end a poll.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// Attempts exhausted without a reachable endpoint.
    #[error("{handle} was not reachable after {attempts} attempts ({waited_secs}s)")]
    Timeout {
        /// Resource being polled.
        handle: BackendHandle,
        /// Attempts made.
        attempts: u32,
        /// Total configured wait.
        waited_secs: u64,
    },
    /// The backend reported a terminal state.
    #[error("{handle} failed during provisioning: {reason}")]
    TerminalFailure {
        /// Resource being polled.
        handle: BackendHandle,
        /// Backend supplied reason.
        reason: String,
    },
    /// A describe or lookup call failed.
    #[error("failed to query {handle}: {source}")]
    Query {
        /// Resource being polled.
        handle: BackendHandle,
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },
    /// The caller cancelled the poll.
    #[error("cancelled while waiting for {handle}")]
    Cancelled {
        /// Resource being polled.
        handle: BackendHandle,
    },
}

/// Polls a driver until a resource is reachable.
pub struct ReadinessPoller<'a> {
    driver: &'a dyn Driver,
    policy: PollPolicy,
}

impl<'a> ReadinessPoller<'a> {
    /// Creates a poller for `driver`.
    #[must_use]
    pub const fn new(driver: &'a dyn Driver, policy: PollPolicy) -> Self {
        Self { driver, policy }
    }

    /// Waits for `handle` to become reachable.
    ///
    /// Makes at most `policy.attempts()` describe calls and never sleeps after
    /// the last one. Resolving `cancel` aborts the wait promptly.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError`] on timeout, terminal failure, query failure,
    /// or cancellation.
    pub async fn wait<C>(&self, handle: &BackendHandle, cancel: C) -> Result<Endpoint, ReadinessError>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = pin!(cancel);
        let attempts = self.policy.attempts();

        for attempt in 1..=attempts {
            let state = tokio::select! {
                biased;
                () = &mut cancel => return Err(ReadinessError::Cancelled { handle: handle.clone() }),
                state = self.attempt(handle) => state?,
            };
            debug!(%handle, attempt, ?state, "readiness attempt");

            match state {
                PollState::Ready(endpoint) => {
                    info!(%handle, %endpoint, attempt, "session reachable");
                    return Ok(endpoint);
                }
                PollState::Failed(reason) => {
                    return Err(ReadinessError::TerminalFailure {
                        handle: handle.clone(),
                        reason,
                    });
                }
                PollState::Waiting | PollState::TimedOut => {}
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    () = &mut cancel => return Err(ReadinessError::Cancelled { handle: handle.clone() }),
                    () = sleep(self.policy.interval()) => {}
                }
            }
        }

        Err(ReadinessError::Timeout {
            handle: handle.clone(),
            attempts,
            waited_secs: self.policy.max_wait().as_secs(),
        })
    }

    async fn attempt(&self, handle: &BackendHandle) -> Result<PollState, ReadinessError> {
        let query_error = |source| ReadinessError::Query {
            handle: handle.clone(),
            source,
        };
        let description = self.driver.describe(handle).await.map_err(query_error)?;
        let endpoint = match advance(description) {
            NextStep::Settle(PollState::Ready(endpoint)) => endpoint,
            NextStep::Settle(state) => return Ok(state),
            NextStep::Resolve(network_id) => {
                let Some(endpoint) = self
                    .driver
                    .resolve_endpoint(handle, &network_id)
                    .await
                    .map_err(query_error)?
                else {
                    return Ok(PollState::Waiting);
                };
                endpoint
            }
        };
        if self
            .driver
            .accepts_connections(&endpoint)
            .await
            .map_err(query_error)?
        {
            Ok(PollState::Ready(endpoint))
        } else {
            debug!(%handle, %endpoint, "endpoint not accepting connections yet");
            Ok(PollState::Waiting)
        }
    }
}
