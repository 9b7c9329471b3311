//! Channels to the host that talks to the scheduler.
//!
//! A [`Session`] runs shell commands and moves files. The broker uses one
//! session per submission and never shares it between threads.

pub mod local;
#[cfg(test)]
pub mod mock;
pub mod ssh;

use crate::config::{RemoteConfig, Transport};
use std::{
    borrow::Cow,
    io::{self, Read},
    ops::{Deref, DerefMut},
    path::Path,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to {host}: {reason}")]
    Connection { host: String, reason: String },
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("Failed to transfer {from} to {to}: {reason}")]
    Transfer {
        from: String,
        to: String,
        reason: String,
    },
    #[error("Session was already closed")]
    Closed,
}

/// exit status and captured streams of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub trait Session {
    /// Run `command` through the remote shell. Without `capture_output` the
    /// command's streams go straight to this process' stdout and stderr.
    fn run(&mut self, command: &str, capture_output: bool) -> Result<CommandOutput, SessionError>;

    /// copy a single local file to `remote_path`
    fn copy(&mut self, local_path: &Path, remote_path: &str) -> Result<(), SessionError>;

    /// Mirror `local_dir` into `remote_dir`, deleting remote files that do not
    /// exist locally. Paths matching `exclude` are neither copied nor deleted.
    fn sync_tree(
        &mut self,
        local_dir: &Path,
        remote_dir: &str,
        exclude: &[String],
    ) -> Result<(), SessionError>;

    /// Release the channel. Calling this more than once is fine.
    fn close(&mut self) -> Result<(), SessionError>;
}

/// Open a session with the transport named in `config`.
pub fn open(config: &RemoteConfig) -> Result<Box<dyn Session>, SessionError> {
    match config.transport {
        Transport::Ssh => Ok(Box::new(ssh::SshSession::open(config)?)),
        Transport::Local => Ok(Box::new(local::LocalSession::open(config)?)),
    }
}

/// Closes the wrapped session when dropped, on every exit path.
pub struct SessionGuard {
    session: Box<dyn Session>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        match self.session.close() {
            Ok(()) => debug!("Closed session"),
            Err(error) => warn!(error = ?error, "Failed to close session: {error}"),
        }
    }
}

/// Quote a remote path for the remote shell while keeping a leading `~/` expandable.
pub fn quote_path(path: &str) -> String {
    let (home, rest) = match path.strip_prefix("~/") {
        Some(rest) => ("~/", rest),
        None if path == "~" => return path.to_string(),
        None => ("", path),
    };
    let rest: String = rest.chars().filter(|c| *c != '\0').collect();

    match shlex::try_quote(&rest) {
        Ok(quoted) => format!("{home}{quoted}"),
        Err(_) => format!("{home}{rest}"),
    }
}

/// Spawn `command` and wait for it, killing it once `timeout` expires.
pub(crate) fn execute(
    command: &mut Command,
    capture_output: bool,
    timeout: Option<Duration>,
) -> Result<CommandOutput, SessionError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let spawn_error = |source| SessionError::Spawn {
        program: program.clone(),
        source,
    };

    command.stdin(Stdio::null());
    if capture_output {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    trace!(command = ?command, "Spawning");
    let mut child = command.spawn().map_err(spawn_error)?;

    // pipes are drained on their own threads, a chatty command would otherwise
    // block on a full pipe while we wait for it
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout).map_err(spawn_error)? {
            Some(status) => status,
            None => {
                // child hasn't exited yet
                if let Err(error) = child.kill().and_then(|_| child.wait().map(|_| ())) {
                    warn!(program = %program, "Failed to kill timed out command: {error}");
                }

                return Err(SessionError::Timeout {
                    program: program.clone(),
                    timeout,
                });
            }
        },
        None => child.wait().map_err(spawn_error)?,
    };

    Ok(CommandOutput {
        // killed by a signal
        status: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Err(error) = pipe.read_to_end(&mut buffer) {
            warn!("Failed to read command output: {error}");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// first non-empty line of stderr, or the exit status if there is none
pub(crate) fn describe_failure(output: &CommandOutput) -> Cow<'_, str> {
    match output.stderr.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) => Cow::Borrowed(line),
        None => Cow::Owned(format!("exited with status {}", output.status)),
    }
}
