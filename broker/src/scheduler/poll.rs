use super::{cancel, query, JobRecord, JobState, QueryError};
use crate::{
    config::{PollConfig, SchedulerConfig},
    session::{describe_failure, Session},
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Could not query the state of job {job_id} after {attempts} attempts")]
    Transport {
        job_id: String,
        attempts: u32,
        #[source]
        source: QueryError,
    },
    #[error("Scheduler kept reporting {state} for job {job_id} after {attempts} attempts")]
    Unrecognized {
        job_id: String,
        state: JobState,
        attempts: u32,
    },
    #[error("Job {job_id} did not finish within {waited:?}")]
    DeadlineExceeded { job_id: String, waited: Duration },
    #[error("Waiting for job {job_id} was cancelled")]
    Cancelled { job_id: String },
}

/// Lets another thread stop a poll loop. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every sleeping poller.
    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration` unless cancelled first. Returns whether cancellation was signalled.
    /// A duration past the end of the clock sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let (flag, condvar) = &*self.inner;
        let mut cancelled = flag.lock();

        // loop for spurious wakeups
        while !*cancelled {
            match deadline {
                Some(deadline) => {
                    if condvar.wait_until(&mut cancelled, deadline).timed_out() {
                        break;
                    }
                }
                None => condvar.wait(&mut cancelled),
            }
        }

        *cancelled
    }
}

/// Repeatedly queries a job until the scheduler reports a terminal state.
///
/// Failed queries and unrecognized states are retried with exponential backoff,
/// up to `retries` times in a row. A successful query with a known state resets
/// the count. The whole wait is bounded by `max_wait` and can be cancelled.
#[derive(Debug)]
pub struct Poller<'a> {
    scheduler: &'a SchedulerConfig,
    config: &'a PollConfig,
    cancel: CancelToken,
}

impl<'a> Poller<'a> {
    pub fn new(scheduler: &'a SchedulerConfig, config: &'a PollConfig, cancel: CancelToken) -> Self {
        Self {
            scheduler,
            config,
            cancel,
        }
    }

    /// pause before the next attempt after `failures` consecutive failed ones
    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);

        self.config.backoff().saturating_mul(1 << exponent)
    }

    /// Block until `record` reaches a terminal state and return that state.
    #[instrument(skip(self, session, record), fields(job_id = %record.job_id), level = "info")]
    pub fn wait(
        &self,
        session: &mut dyn Session,
        record: &mut JobRecord,
    ) -> Result<JobState, PollError> {
        let started = Instant::now();
        // a max_wait too large to represent never expires
        let deadline = started.checked_add(self.config.max_wait());
        let mut failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.abort(
                    session,
                    PollError::Cancelled {
                        job_id: record.job_id.clone(),
                    },
                ));
            }

            let pause = match query(session, self.scheduler, &record.job_id) {
                Ok(state) if state.is_terminal() => {
                    info!(state = %state, elapsed = ?started.elapsed(), "Job finished");
                    record.state = state.clone();

                    return Ok(state);
                }
                Ok(state @ JobState::Unknown(_)) => {
                    failures += 1;
                    if failures > self.config.retries {
                        return Err(self.abort(
                            session,
                            PollError::Unrecognized {
                                job_id: record.job_id.clone(),
                                state,
                                attempts: failures,
                            },
                        ));
                    }

                    warn!(attempt = failures, "Scheduler reported {state}, retrying");
                    self.backoff(failures)
                }
                Ok(state) => {
                    failures = 0;
                    if state != record.state {
                        info!(state = %state, "Job state changed");
                        record.state = state;
                    }

                    self.config.interval()
                }
                Err(error) => {
                    failures += 1;
                    if failures > self.config.retries {
                        return Err(self.abort(
                            session,
                            PollError::Transport {
                                job_id: record.job_id.clone(),
                                attempts: failures,
                                source: error,
                            },
                        ));
                    }

                    warn!(attempt = failures, "Status query failed, retrying: {error}");
                    self.backoff(failures)
                }
            };

            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.abort(
                            session,
                            PollError::DeadlineExceeded {
                                job_id: record.job_id.clone(),
                                waited: started.elapsed(),
                            },
                        ));
                    }

                    pause.min(remaining)
                }
                None => pause,
            };

            if self.cancel.sleep(pause) {
                return Err(self.abort(
                    session,
                    PollError::Cancelled {
                        job_id: record.job_id.clone(),
                    },
                ));
            }
        }
    }

    /// Cancel the job on the scheduler if configured to, then hand back `error`.
    fn abort(&self, session: &mut dyn Session, error: PollError) -> PollError {
        let job_id = match &error {
            PollError::Transport { job_id, .. }
            | PollError::Unrecognized { job_id, .. }
            | PollError::DeadlineExceeded { job_id, .. }
            | PollError::Cancelled { job_id } => job_id,
        };

        if self.config.cancel_on_abort {
            match cancel(session, self.scheduler, job_id) {
                Ok(output) if output.success() => info!(job_id = %job_id, "Cancelled job"),
                Ok(output) => warn!(
                    job_id = %job_id,
                    "Failed to cancel job: {}",
                    describe_failure(&output)
                ),
                Err(cancel_error) => warn!(job_id = %job_id, "Failed to cancel job: {cancel_error}"),
            }
        } else {
            debug!(job_id = %job_id, "Leaving job to the scheduler");
        }

        error
    }
}
