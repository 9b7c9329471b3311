use crate::{
    capsule::{
        outcome::{Outcome, OUTCOME_FILE},
        CallCapsule,
    },
    error_chain,
    registry::TaskRegistry,
};
use clap::Args;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info, instrument};

/// subcommand name the job script uses to run a capsule
pub const RUN_CAPSULE: &str = "run-capsule";

/// Run a serialized call on this host and record its outcome
#[derive(Args, Debug, Clone)]
pub struct RunCapsule {
    /// Path to the call capsule
    pub capsule: PathBuf,

    /// Where to write the outcome, defaults to `outcome.yaml` next to the capsule
    #[arg(long)]
    pub outcome: Option<PathBuf>,
}

impl RunCapsule {
    pub fn outcome_path(&self) -> PathBuf {
        self.outcome.clone().unwrap_or_else(|| {
            self.capsule
                .parent()
                .map(|parent| parent.join(OUTCOME_FILE))
                .unwrap_or_else(|| PathBuf::from(OUTCOME_FILE))
        })
    }

    pub fn execute(&self, registry: &TaskRegistry) -> ExitCode {
        ExitCode::from(self.run(registry))
    }

    /// 0 if the task returned, 1 if it raised and 2 if it never ran.
    #[instrument(skip(registry), level = "info")]
    pub fn run(&self, registry: &TaskRegistry) -> u8 {
        let outcome = match CallCapsule::read_from(&self.capsule) {
            Ok(capsule) => {
                info!(task = capsule.target(), "Running capsule");
                registry.invoke(&capsule)
            }
            Err(capsule_error) => {
                error!(error = ?capsule_error, "Failed to read capsule: {capsule_error}");

                Outcome::Rejected {
                    reason: error_chain(&capsule_error),
                }
            }
        };

        let path = self.outcome_path();

        if let Err(write_error) = outcome.write_to(&path) {
            error!(path = ?path, "Failed to write outcome: {write_error}");

            return 2;
        }

        match outcome {
            Outcome::Returned { .. } => {
                info!("Task returned");
                0
            }
            Outcome::Raised { kind, message } => {
                error!(kind = %kind, "Task raised: {message}");
                1
            }
            Outcome::Rejected { reason } => {
                error!("Capsule was rejected: {reason}");
                2
            }
        }
    }
}
