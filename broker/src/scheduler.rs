//! Talking to Slurm through its command line tools.

pub mod poll;

use crate::{
    config::SchedulerConfig,
    session::{describe_failure, quote_path, CommandOutput, Session, SessionError},
};
use std::fmt::{self, Display};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Lifecycle of a submitted job as far as the broker can observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// accepted, but not yet visible to the accounting query
    Submitted,
    Pending,
    Running,
    Completed,
    /// the scheduler's reason, e.g. `TIMEOUT`
    Failed(String),
    Cancelled,
    /// output the broker does not recognize
    Unknown(String),
}

impl JobState {
    /// Classify the output of the status query by its first token.
    pub fn classify(output: &str) -> Self {
        let Some(token) = output.split_whitespace().next() else {
            return JobState::Submitted;
        };

        // sacct marks truncated values with a trailing `+`, e.g. `CANCELLED+`
        match token.trim_end_matches('+') {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobState::Pending,
            "RUNNING" | "COMPLETING" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            reason @ ("FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL"
            | "DEADLINE" | "PREEMPTED") => JobState::Failed(reason.to_string()),
            "CANCELLED" => JobState::Cancelled,
            _ => JobState::Unknown(token.to_string()),
        }
    }

    /// no further transition happens after a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed(reason) => write!(f, "{reason}"),
            JobState::Cancelled => write!(f, "CANCELLED"),
            JobState::Unknown(token) => write!(f, "unknown state '{token}'"),
        }
    }
}

/// A job the broker submitted and still tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    /// remote path of the captured stdout and stderr
    pub output: String,
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to run the submit command")]
    Session(#[from] SessionError),
    #[error("Submit command exited with status {status}: {reason}")]
    Rejected { status: i32, reason: String },
    #[error("No job id in the submit command's output '{output}'")]
    NoJobId { output: String },
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Failed to run the status query")]
    Session(#[from] SessionError),
    #[error("Status query exited with status {status}: {reason}")]
    Exit { status: i32, reason: String },
}

/// Job id from the submit command's output: its last whitespace separated token.
/// `sbatch --parsable` appends the cluster name after a `;`, which is dropped.
pub fn parse_job_id(output: &str) -> Option<String> {
    let token = output.split_whitespace().last()?;
    let job_id = token.split(';').next().unwrap_or(token);

    (!job_id.is_empty()).then(|| job_id.to_string())
}

/// Submit `script` from inside `remote_path`, capturing its output in `output`.
#[instrument(skip(session, scheduler), level = "info")]
pub fn submit(
    session: &mut dyn Session,
    scheduler: &SchedulerConfig,
    remote_path: &str,
    script: &str,
    output: &str,
) -> Result<JobRecord, SubmissionError> {
    let command = format!(
        "cd {} && {} --output={} {}",
        quote_path(remote_path),
        scheduler.submit,
        quote_path(output),
        quote_path(script)
    );
    let response = session.run(&command, true)?;

    if !response.success() {
        return Err(SubmissionError::Rejected {
            status: response.status,
            reason: describe_failure(&response).into_owned(),
        });
    }

    let job_id = parse_job_id(&response.stdout).ok_or_else(|| SubmissionError::NoJobId {
        output: response.stdout.trim().to_string(),
    })?;
    info!(job_id = %job_id, "Submitted");

    Ok(JobRecord {
        job_id,
        state: JobState::Submitted,
        output: format!("{}/{output}", remote_path.trim_end_matches('/')),
    })
}

/// Ask the scheduler for the current state of `job_id`, once.
pub fn query(
    session: &mut dyn Session,
    scheduler: &SchedulerConfig,
    job_id: &str,
) -> Result<JobState, QueryError> {
    let response = session.run(&status_command(scheduler, job_id), true)?;

    if !response.success() {
        return Err(QueryError::Exit {
            status: response.status,
            reason: describe_failure(&response).into_owned(),
        });
    }

    let state = JobState::classify(&response.stdout);
    debug!(job_id = job_id, state = %state, "Queried job state");

    Ok(state)
}

fn status_command(scheduler: &SchedulerConfig, job_id: &str) -> String {
    // -X restricts the output to the allocation itself, without its steps
    format!(
        "{} -j {} --format=State --noheader -X",
        scheduler.query,
        quote_path(job_id)
    )
}

/// Ask the scheduler to cancel `job_id`.
pub fn cancel(
    session: &mut dyn Session,
    scheduler: &SchedulerConfig,
    job_id: &str,
) -> Result<CommandOutput, SessionError> {
    session.run(&format!("{} {}", scheduler.cancel, quote_path(job_id)), true)
}
