use super::{describe_failure, execute, CommandOutput, Session, SessionError};
use crate::config::RemoteConfig;
use itertools::Itertools;
use std::{path::Path, process::Command};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Session over the `ssh` and `rsync` command line tools.
///
/// All invocations share one multiplexed connection through a control socket
/// that lives in a private temporary directory. A password, if configured, is
/// handed to `sshpass` through the environment.
#[derive(Debug)]
pub struct SshSession {
    config: RemoteConfig,
    control_dir: Option<TempDir>,
    connected: bool,
}

impl SshSession {
    /// Prepare a session without touching the network.
    pub fn new(config: &RemoteConfig) -> Result<Self, SessionError> {
        let control_dir = tempfile::Builder::new()
            .prefix("slurm-broker-ssh-")
            .tempdir()
            .map_err(|source| SessionError::Spawn {
                program: String::from("ssh"),
                source,
            })?;

        Ok(Self {
            config: config.clone(),
            control_dir: Some(control_dir),
            connected: false,
        })
    }

    /// Prepare a session and establish the shared connection.
    #[instrument(skip(config), fields(host = %config.host, port = config.port), level = "debug")]
    pub fn open(config: &RemoteConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(config)?;

        match session.establish() {
            Ok(()) => {
                info!(host = %config.host, "Connected");
                Ok(session)
            }
            Err(error) => {
                // tear down whatever the failed attempt left behind
                session.close()?;
                Err(error)
            }
        }
    }

    fn establish(&mut self) -> Result<(), SessionError> {
        // the master connection is set up by the first command
        self.connected = true;
        let output = self.ssh_command("true").and_then(|mut command| {
            execute(&mut command, true, self.config.command_timeout())
        })?;

        if output.success() {
            Ok(())
        } else {
            self.connected = false;

            Err(SessionError::Connection {
                host: self.config.host.clone(),
                reason: describe_failure(&output).into_owned(),
            })
        }
    }

    /// options shared by every ssh invocation, including the ones rsync makes
    pub fn ssh_options(&self) -> Result<Vec<String>, SessionError> {
        let control_dir = self.control_dir.as_ref().ok_or(SessionError::Closed)?;
        let mut options = vec![
            String::from("-p"),
            self.config.port.to_string(),
            String::from("-o"),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            String::from("-o"),
            String::from("ControlMaster=auto"),
            String::from("-o"),
            format!("ControlPath={}", control_dir.path().join("%C").display()),
            String::from("-o"),
            String::from("ControlPersist=60"),
        ];

        // without a password nothing may prompt, a prompt would block forever
        if self.config.password.is_none() {
            options.push(String::from("-o"));
            options.push(String::from("BatchMode=yes"));
        }

        if let Some(ref identity) = self.config.identity {
            options.push(String::from("-i"));
            options.push(identity.to_string_lossy().into_owned());
        }

        Ok(options)
    }

    /// `program`, wrapped in `sshpass` if a password is configured
    fn base_command(&self, program: &str) -> Command {
        match self.config.password {
            Some(ref password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg(program).env("SSHPASS", password);
                command
            }
            None => Command::new(program),
        }
    }

    fn ssh_command(&self, remote_command: &str) -> Result<Command, SessionError> {
        let mut command = self.base_command("ssh");
        command
            .args(self.ssh_options()?)
            .arg(self.config.destination())
            .arg("--")
            .arg(remote_command);

        Ok(command)
    }

    pub fn rsync_args(
        &self,
        local: &Path,
        remote: &str,
        delete: bool,
        exclude: &[String],
    ) -> Result<Vec<String>, SessionError> {
        let transport = std::iter::once(String::from("ssh"))
            .chain(self.ssh_options()?)
            .map(|part| shlex::try_quote(&part).map(|quoted| quoted.into_owned()).unwrap_or(part))
            .join(" ");

        let mut args = vec![String::from("-az"), String::from("-e"), transport];

        if delete {
            args.push(String::from("--delete"));
        }

        for pattern in exclude {
            args.push(format!("--exclude={pattern}"));
        }

        args.push(local.to_string_lossy().into_owned());
        args.push(format!("{}:{remote}", self.config.destination()));

        Ok(args)
    }

    fn rsync(
        &mut self,
        local: &Path,
        remote: &str,
        delete: bool,
        exclude: &[String],
    ) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::Closed);
        }

        let mut command = self.base_command("rsync");
        command.args(self.rsync_args(local, remote, delete, exclude)?);

        let output = execute(&mut command, true, self.config.command_timeout())?;

        if output.success() {
            Ok(())
        } else {
            Err(SessionError::Transfer {
                from: local.to_string_lossy().into_owned(),
                to: format!("{}:{remote}", self.config.host),
                reason: describe_failure(&output).into_owned(),
            })
        }
    }
}

impl Session for SshSession {
    fn run(&mut self, command: &str, capture_output: bool) -> Result<CommandOutput, SessionError> {
        if !self.connected {
            return Err(SessionError::Closed);
        }

        debug!(host = %self.config.host, command = command, "Running remote command");
        let output = execute(
            &mut self.ssh_command(command)?,
            capture_output,
            self.config.command_timeout(),
        )?;

        if output.status == SSH_CONNECTION_FAILURE {
            return Err(SessionError::Connection {
                host: self.config.host.clone(),
                reason: describe_failure(&output).into_owned(),
            });
        }

        Ok(output)
    }

    fn copy(&mut self, local_path: &Path, remote_path: &str) -> Result<(), SessionError> {
        self.rsync(local_path, remote_path, false, &[])
    }

    fn sync_tree(
        &mut self,
        local_dir: &Path,
        remote_dir: &str,
        exclude: &[String],
    ) -> Result<(), SessionError> {
        // trailing slashes make rsync mirror the contents instead of nesting the directory
        let mut local = local_dir.as_os_str().to_owned();
        local.push("/");
        let remote = format!("{}/", remote_dir.trim_end_matches('/'));

        self.rsync(Path::new(&local), &remote, true, exclude)
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if self.connected {
            self.connected = false;

            // ask the master connection to exit, the socket directory goes away right after
            if let Ok(options) = self.ssh_options() {
                let mut command = self.base_command("ssh");
                command
                    .args(options)
                    .args(["-O", "exit"])
                    .arg(self.config.destination());

                match execute(&mut command, true, self.config.command_timeout()) {
                    Ok(output) if output.success() => debug!("Stopped master connection"),
                    Ok(output) => debug!(
                        "Master connection did not stop cleanly: {}",
                        describe_failure(&output)
                    ),
                    Err(error) => debug!("Failed to stop master connection: {error}"),
                }
            }
        }

        if let Some(control_dir) = self.control_dir.take() {
            if let Err(error) = control_dir.close() {
                debug!("Failed to remove control socket directory: {error}");
            }
        }

        Ok(())
    }
}
