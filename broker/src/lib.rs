//! Run ordinary Rust functions as Slurm jobs on a remote cluster.
//!
//! A [`Task`] wraps a function registered in a [`TaskRegistry`]. Without a remote
//! configured, calling it runs the function in-process. With one, the call is
//! captured in a [`CallCapsule`], shipped into a fresh remote workspace together
//! with the codebase, submitted through `sbatch` and polled until the scheduler
//! reports a terminal state. The remote side runs the capsule with
//! [`worker::RunCapsule`] and leaves an [`Outcome`] behind, which carries the
//! return value or the error back to the caller.

pub mod capsule;
pub mod config;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod session;
pub mod task;
pub mod worker;
pub mod workspace;

pub use capsule::{outcome::Outcome, CallCapsule, CapsuleError};
pub use config::{ConfigErrors, RemoteConfig, TaskConfig, Transport};
pub use registry::TaskRegistry;
pub use scheduler::{poll::CancelToken, JobState};
pub use task::{BrokerError, CallError, RemoteReport, Task};
pub use worker::{RunCapsule, RUN_CAPSULE};

use std::error::Error;

/// `error: cause: root cause`
pub(crate) fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
