use crate::{
    capsule::{
        outcome::{Outcome, OUTCOME_FILE},
        CallCapsule, CapsuleError,
    },
    config::{ConfigErrors, RemoteConfig, TaskConfig},
    error_chain,
    scheduler::{
        self,
        poll::{CancelToken, PollError, Poller},
        JobState, SubmissionError,
    },
    script::{self, JobResources, JOB_OUTPUT, JOB_SCRIPT},
    session::{self, quote_path, Session, SessionError, SessionGuard},
    workspace::{Provisioner, ProvisioningError, WorkspaceDescriptor},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt::{self, Debug},
    io::{self, Write},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// the function behind a task
pub type TaskFn<A, R, E> = Arc<dyn Fn(A) -> Result<R, E> + Send + Sync>;

/// how a task reaches its remote host
pub type SessionOpener =
    Arc<dyn Fn(&RemoteConfig) -> Result<Box<dyn Session>, SessionError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Invalid task configuration")]
    Config(#[from] ConfigErrors),
    #[error("Task has no remote configured")]
    NoRemote,
    #[error("Failed to capture the call")]
    Encode(#[source] CapsuleError),
    #[error("Failed to create a local staging directory")]
    Staging(#[source] io::Error),
    #[error("Failed to open a session")]
    Connection(#[source] SessionError),
    #[error("Failed to provision the remote workspace")]
    Provisioning(#[from] ProvisioningError),
    #[error("Failed to submit the job")]
    Submission(#[from] SubmissionError),
    #[error("Failed to follow the job")]
    Poll(#[from] PollError),
    #[error("Outcome of job {job_id} could not be decoded")]
    Decode {
        job_id: String,
        #[source]
        source: CapsuleError,
    },
    #[error("Job {job_id} raised {kind}: {message}")]
    RemoteInvocation {
        job_id: String,
        kind: String,
        message: String,
    },
    #[error("Job {job_id} rejected the call: {reason}")]
    Rejected { job_id: String, reason: String },
    #[error("Job {job_id} failed with state {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("Job {job_id} was cancelled")]
    JobCancelled { job_id: String },
    #[error("Job {job_id} completed without leaving an outcome")]
    MissingOutcome { job_id: String },
}

impl BrokerError {
    /// pipeline stage the error aborted
    pub fn stage(&self) -> &'static str {
        match self {
            BrokerError::Config(_) | BrokerError::NoRemote => "configure",
            BrokerError::Encode(_) => "capture",
            BrokerError::Staging(_) => "stage",
            BrokerError::Connection(_) => "connect",
            BrokerError::Provisioning(_) => "provision",
            BrokerError::Submission(_) => "submit",
            BrokerError::Poll(_) => "poll",
            BrokerError::Decode { .. }
            | BrokerError::RemoteInvocation { .. }
            | BrokerError::Rejected { .. }
            | BrokerError::JobFailed { .. }
            | BrokerError::JobCancelled { .. }
            | BrokerError::MissingOutcome { .. } => "outcome",
        }
    }
}

/// A call either failed inside the task itself or somewhere in the broker.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// the task's own error, unchanged (in-process calls only)
    #[error("{0}")]
    Task(E),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Everything known about a finished remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReport<R> {
    pub job_id: String,
    pub workdir: String,
    pub state: JobState,
    /// what the job wrote to stdout and stderr
    pub output: String,
    pub value: R,
}

/// A callable handle for a registered function.
///
/// Without `remote` in its config the function runs in-process, otherwise every
/// call becomes one Slurm job.
pub struct Task<A, R, E> {
    name: String,
    config: TaskConfig,
    func: TaskFn<A, R, E>,
    opener: SessionOpener,
    cancel: CancelToken,
}

impl<A, R, E> Clone for Task<A, R, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            func: self.func.clone(),
            opener: self.opener.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A, R, E> Debug for Task<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<A, R, E> Task<A, R, E>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub(crate) fn new(name: &str, config: TaskConfig, func: TaskFn<A, R, E>) -> Self {
        Self {
            name: name.to_string(),
            config,
            func,
            opener: Arc::new(session::open),
            cancel: CancelToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Signalling this token aborts the poll loop of a running call. It stays
    /// signalled, later remote calls abort right away.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// replace how sessions are opened, e.g. with a scripted one
    pub fn with_session_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&RemoteConfig) -> Result<Box<dyn Session>, SessionError> + Send + Sync + 'static,
    {
        self.opener = Arc::new(opener);
        self
    }

    /// Run the task in-process or as a remote job, depending on the config.
    pub fn call(&self, args: A) -> Result<R, CallError<E>> {
        match self.config.remote {
            None => {
                debug!(task = %self.name, "Running in-process");
                (self.func)(args).map_err(CallError::Task)
            }
            Some(_) => Ok(self.call_remote_report(&args)?.value),
        }
    }

    /// Run the task as a remote job and return the full report instead of just the value.
    pub fn call_remote_report(&self, args: &A) -> Result<RemoteReport<R>, BrokerError> {
        let descriptor = WorkspaceDescriptor::now(&self.config.workdir, &self.name);

        self.run_remote(args, &descriptor).map_err(|broker_error| {
            error!(
                task = %self.name,
                stage = broker_error.stage(),
                workdir = %descriptor.path(),
                "Remote call aborted: {}",
                error_chain(&broker_error)
            );

            broker_error
        })
    }

    #[instrument(skip(self, args, descriptor), fields(task = %self.name, workdir = %descriptor.path()), level = "info")]
    fn run_remote(
        &self,
        args: &A,
        descriptor: &WorkspaceDescriptor,
    ) -> Result<RemoteReport<R>, BrokerError> {
        let remote = self.config.remote.as_ref().ok_or(BrokerError::NoRemote)?;
        let capsule = CallCapsule::new(self.name.as_str(), args)
            .and_then(|capsule| capsule.encode())
            .map_err(BrokerError::Encode)?;
        let exclude = self.config.sync.patterns()?;

        // removed on every exit path
        let staging = tempfile::Builder::new()
            .prefix("slurm-broker-")
            .tempdir()
            .map_err(BrokerError::Staging)?;
        let mut session = SessionGuard::new((self.opener)(remote).map_err(BrokerError::Connection)?);

        let provisioner = Provisioner::new(&self.config.sync.root, &exclude, staging.path());
        let workdir = provisioner.provision(&mut *session, descriptor, &capsule)?;

        let resources = JobResources::from_config(&self.config, &self.name);
        let job_script = script::render(
            &resources,
            &workdir,
            &self.config.bootstrap,
            &script::invocation(&self.config.runner),
        );
        provisioner.place(&mut *session, descriptor, JOB_SCRIPT, job_script.as_bytes())?;

        let mut record = scheduler::submit(
            &mut *session,
            &self.config.scheduler,
            &workdir,
            JOB_SCRIPT,
            JOB_OUTPUT,
        )?;
        let state = Poller::new(&self.config.scheduler, &self.config.poll, self.cancel.clone())
            .wait(&mut *session, &mut record)?;

        let output = match read_remote(&mut *session, &record.output) {
            Some(output) => {
                show(&output);
                output
            }
            None => {
                warn!(job_id = %record.job_id, "Job output {} could not be read", record.output);
                String::new()
            }
        };

        let outcome = read_remote(&mut *session, &descriptor.file(OUTCOME_FILE))
            .map(|text| Outcome::decode(text.as_bytes()))
            .transpose();
        let value = settle(&record.job_id, &state, outcome)?;
        info!(job_id = %record.job_id, "Remote call returned");

        Ok(RemoteReport {
            job_id: record.job_id,
            workdir,
            state,
            output,
            value,
        })
    }
}

/// contents of a remote file, `None` if it can't be read
fn read_remote(session: &mut dyn Session, path: &str) -> Option<String> {
    match session.run(&format!("cat {}", quote_path(path)), true) {
        Ok(output) if output.success() => Some(output.stdout),
        Ok(_) => None,
        Err(session_error) => {
            warn!("Failed to read {path}: {session_error}");
            None
        }
    }
}

fn show(output: &str) {
    let mut stdout = io::stdout().lock();

    if let Err(write_error) = stdout.write_all(output.as_bytes()).and_then(|_| stdout.flush()) {
        warn!("Failed to print job output: {write_error}");
    }
}

/// Combine the terminal state and the outcome artifact into the call's result.
/// What the task reported wins over what the scheduler reported.
fn settle<R: DeserializeOwned>(
    job_id: &str,
    state: &JobState,
    outcome: Result<Option<Outcome>, CapsuleError>,
) -> Result<R, BrokerError> {
    let job_id = job_id.to_string();

    match (state, outcome) {
        (_, Ok(Some(Outcome::Raised { kind, message }))) => Err(BrokerError::RemoteInvocation {
            job_id,
            kind,
            message,
        }),
        (_, Ok(Some(Outcome::Rejected { reason }))) => Err(BrokerError::Rejected { job_id, reason }),
        (JobState::Cancelled, _) => Err(BrokerError::JobCancelled { job_id }),
        (JobState::Failed(reason), _) => Err(BrokerError::JobFailed {
            job_id,
            reason: reason.clone(),
        }),
        (_, Ok(Some(Outcome::Returned { value }))) => serde_yaml::from_value(value)
            .map_err(|source| BrokerError::Decode {
                job_id,
                source: CapsuleError::Decode(source),
            }),
        (_, Ok(None)) => Err(BrokerError::MissingOutcome { job_id }),
        (_, Err(source)) => Err(BrokerError::Decode { job_id, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PollConfig, SchedulerConfig, SyncConfig, Transport},
        registry::TaskRegistry,
        session::mock::{self, MockSession},
    };
    use serde::Deserialize;
    use std::{convert::Infallible, fs, num::ParseIntError, path::Path};

    fn remote_config() -> TaskConfig {
        TaskConfig {
            remote: Some(RemoteConfig::new("hpc.cluster.local")),
            poll: PollConfig {
                interval_ms: 0,
                backoff_ms: 0,
                ..PollConfig::default()
            },
            ..TaskConfig::default()
        }
    }

    fn greet_task(config: TaskConfig, session: &MockSession) -> Task<String, String, Infallible> {
        let session = session.clone();

        TaskRegistry::new()
            .task("greet", config, |name: String| Ok(format!("Hello, {name}!")))
            .with_session_opener(move |_| Ok(Box::new(session.clone()) as Box<dyn Session>))
    }

    #[test]
    fn local_mode_returns_directly() {
        let add = TaskRegistry::new()
            .task("add", TaskConfig::default(), |(a, b): (i64, i64)| {
                Ok::<_, Infallible>(a + b)
            })
            .with_session_opener(|_| panic!("local mode must not open a session"));

        assert_eq!(add.call((2, 3)).unwrap(), 5);
    }

    #[test]
    fn local_mode_propagates_task_error_unchanged() {
        let parse = TaskRegistry::new().task("parse", TaskConfig::default(), |text: String| {
            text.parse::<i64>()
        });
        let expected = "x".parse::<i64>().unwrap_err();

        match parse.call(String::from("x")) {
            Err(CallError::Task(error)) => {
                let error: ParseIntError = error;
                assert_eq!(error, expected);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn failed_job_is_not_a_transport_error() {
        let session = MockSession::default();
        session
            .respond("sbatch", [mock::ok("100")])
            .respond("sacct", [mock::ok("RUNNING"), mock::ok("FAILED")])
            .respond("/outcome.yaml", [mock::exit(1, "No such file or directory")]);

        let result = greet_task(remote_config(), &session).call(String::from("Ada"));

        match result {
            Err(CallError::Broker(BrokerError::JobFailed { job_id, reason })) => {
                assert_eq!(job_id, "100");
                assert_eq!(reason, "FAILED");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(session.count("sacct"), 2);
        assert_eq!(session.close_count(), 1);
    }

    #[test]
    fn remote_value_is_returned() {
        let session = MockSession::default();
        session
            .respond("sbatch", [mock::ok("Submitted batch job 100\n")])
            .respond("sacct", [mock::ok("PENDING"), mock::ok("COMPLETED")])
            .respond("/job.out", [mock::ok("Running\n")])
            .respond(
                "/outcome.yaml",
                [mock::ok("status: returned\nvalue: Hello, Ada!\n")],
            );

        let report = greet_task(remote_config(), &session)
            .call_remote_report(&String::from("Ada"))
            .unwrap();

        assert_eq!(report.value, "Hello, Ada!");
        assert_eq!(report.job_id, "100");
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.output, "Running\n");
        assert!(report.workdir.starts_with("~/remote_jobs/greet_"));

        let capsule = session
            .copied(&format!("{}/call.yaml", report.workdir))
            .unwrap();
        assert_eq!(
            CallCapsule::decode(capsule.as_bytes()).unwrap(),
            CallCapsule::new("greet", &"Ada").unwrap()
        );
        let job_script = session
            .copied(&format!("{}/job.sh", report.workdir))
            .unwrap();
        assert!(job_script.contains("#SBATCH --job-name=greet\n"));
        assert!(job_script.ends_with("cargo run --release --quiet -- run-capsule call.yaml\n"));
    }

    #[test]
    fn remote_error_is_typed() {
        let session = MockSession::default();
        session
            .respond("sbatch", [mock::ok("Submitted batch job 7")])
            .respond("sacct", [mock::ok("FAILED")])
            .respond(
                "/outcome.yaml",
                [mock::ok("status: raised\nkind: io::Error\nmessage: disk full\n")],
            );

        let result = greet_task(remote_config(), &session).call_remote_report(&String::from("Ada"));

        assert!(matches!(
            result,
            Err(BrokerError::RemoteInvocation { job_id, kind, message })
                if job_id == "7" && kind == "io::Error" && message == "disk full"
        ));
    }

    #[test]
    fn completed_without_outcome_is_reported() {
        let session = MockSession::default();
        session
            .respond("sbatch", [mock::ok("Submitted batch job 8")])
            .respond("sacct", [mock::ok("COMPLETED")])
            .respond("/outcome.yaml", [mock::exit(1, "No such file or directory")]);

        let result = greet_task(remote_config(), &session).call_remote_report(&String::from("Ada"));

        assert!(matches!(result, Err(BrokerError::MissingOutcome { .. })));
    }

    #[test]
    fn connection_failure_aborts_before_provisioning() {
        let greet = TaskRegistry::new()
            .task("greet", remote_config(), |name: String| {
                Ok::<_, Infallible>(name)
            })
            .with_session_opener(|remote| {
                Err(SessionError::Connection {
                    host: remote.host.clone(),
                    reason: String::from("Connection refused"),
                })
            });

        let error = greet.call_remote_report(&String::from("Ada")).unwrap_err();

        assert_eq!(error.stage(), "connect");
        assert!(matches!(error, BrokerError::Connection(_)));
    }

    #[test]
    fn provisioning_failure_still_closes_session() {
        let session = MockSession::default();
        session.fail_sync();

        let error = greet_task(remote_config(), &session)
            .call_remote_report(&String::from("Ada"))
            .unwrap_err();

        assert_eq!(error.stage(), "provision");
        assert_eq!(session.count("sbatch"), 0);
        assert_eq!(session.close_count(), 1);
    }

    /// log sink shared between the subscriber and the test
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn abort_is_logged_with_stage_and_workdir() {
        let session = MockSession::default();
        session.fail_sync();
        let log = CapturedLog::default();
        let subscriber = {
            let log = log.clone();
            tracing_subscriber::fmt()
                .with_writer(move || log.clone())
                .with_ansi(false)
                .finish()
        };

        let error = tracing::subscriber::with_default(subscriber, || {
            greet_task(remote_config(), &session)
                .call_remote_report(&String::from("Ada"))
                .unwrap_err()
        });
        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("Remote call aborted"))
            .unwrap_or_else(|| panic!("no abort line in {output}"));

        assert_eq!(error.stage(), "provision");
        assert!(line.contains("ERROR"));
        assert!(line.contains("task=greet"));
        assert!(line.contains("stage=\"provision\""));
        assert!(line.contains("workdir=~/remote_jobs/greet_"));
    }

    #[test]
    fn cancelled_token_aborts_polling() {
        let session = MockSession::default();
        session.respond("sbatch", [mock::ok("Submitted batch job 9")]);
        let greet = greet_task(remote_config(), &session);

        greet.cancel_token().cancel();
        let error = greet.call_remote_report(&String::from("Ada")).unwrap_err();

        assert!(matches!(
            error,
            BrokerError::Poll(PollError::Cancelled { job_id }) if job_id == "9"
        ));
        assert_eq!(session.count("sacct"), 0);
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sum {
        a: i64,
        b: i64,
    }

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    }

    #[test]
    fn end_to_end_over_local_session() {
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source");
        let workdir = scratch.path().join("jobs");
        let bin = scratch.path().join("bin");
        fs::create_dir_all(source.join("src")).unwrap();
        fs::create_dir_all(source.join("target")).unwrap();
        fs::create_dir_all(&bin).unwrap();
        fs::write(source.join("src/lib.rs"), "// code").unwrap();
        fs::write(source.join("target/artifact"), "binary").unwrap();

        // runs the job right away, like a scheduler with an empty queue
        write_script(
            &bin.join("sbatch"),
            "for arg; do case \"$arg\" in --output=*) out=\"${arg#--output=}\";; *) script=\"$arg\";; esac; done\n\
             sh \"$script\" > \"$out\" 2>&1 || true\n\
             echo \"Submitted batch job 77\"\n",
        );
        write_script(&bin.join("sacct"), "echo COMPLETED\n");
        // stands in for the binary holding the registry
        write_script(
            &bin.join("worker"),
            "test \"$1\" = run-capsule && grep -q 'target: add' \"$2\"\n\
             printf 'status: returned\\nvalue: 5\\n' > outcome.yaml\n\
             echo added\n",
        );

        let sh = |name: &str| format!("sh {}", bin.join(name).display());
        let config = TaskConfig {
            remote: Some(RemoteConfig {
                transport: Transport::Local,
                ..RemoteConfig::new("localhost")
            }),
            workdir: workdir.to_string_lossy().into_owned(),
            runner: sh("worker"),
            sync: SyncConfig {
                root: source.clone(),
                ..SyncConfig::default()
            },
            scheduler: SchedulerConfig {
                submit: sh("sbatch"),
                query: sh("sacct"),
                ..SchedulerConfig::default()
            },
            ..remote_config()
        };

        let add = TaskRegistry::new().task("add", config, |sum: Sum| {
            Ok::<_, Infallible>(sum.a + sum.b)
        });
        let report = add.call_remote_report(&Sum { a: 2, b: 3 }).unwrap();

        assert_eq!(report.value, 5);
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.output, "Running\nadded\n");

        let workspace = Path::new(&report.workdir);
        assert!(workspace.join("src/lib.rs").is_file());
        assert!(!workspace.join("target").exists());
        assert!(workspace.join("call.yaml").is_file());
        assert!(workspace.join("job.sh").is_file());
    }
}
