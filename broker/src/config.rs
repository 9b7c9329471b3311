use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Config file could not be read")]
    ReadFailed(#[from] Error),
    #[error("Config file is not valid YAML for a task config")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("Environment variable {0} has an invalid value")]
    InvalidEnvironment(&'static str),
    #[error("Preflight checks failed, see the log for details")]
    PreflightFailed,
}

/// Everything a task needs to know to either run in-process or be shipped to a cluster.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    // scheduler queue the job is submitted to
    #[serde(default = "default_partition")]
    pub partition: String,
    // wall-clock limit as HH:MM:SS
    #[serde(default = "default_time")]
    pub time: String,
    // unset means the task runs in-process
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    // base directory on the remote host, every submission gets its own subdirectory
    #[serde(default = "default_workdir")]
    pub workdir: String,
    // opaque shell lines executed in the job before the task is run
    #[serde(default)]
    pub bootstrap: Vec<String>,
    // command launching the binary that holds the task registry on the remote host
    #[serde(default = "default_runner")]
    pub runner: String,
    // additional `#SBATCH` directives, e.g. `--mem=4G`
    #[serde(default)]
    pub directives: Vec<String>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// How to reach the remote host.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    // path to a private key
    #[serde(default)]
    pub identity: Option<PathBuf>,
    // only used through `sshpass`, prefer keys
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// ssh for commands, rsync over ssh for files
    #[default]
    Ssh,
    /// the "remote" host is this machine, e.g. a cluster login node
    Local,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    // local codebase that is mirrored into the remote workspace
    #[serde(default = "default_sync_root")]
    pub root: PathBuf,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    // rsync style exclude file, one pattern per line
    #[serde(default)]
    pub exclude_from: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    // consecutive failed status queries tolerated before giving up
    #[serde(default = "default_poll_retries")]
    pub retries: u32,
    // first backoff after a failed query, doubled for every further failure
    #[serde(default = "default_poll_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    // issue the scheduler cancel command when polling is aborted
    #[serde(default)]
    pub cancel_on_abort: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_submit")]
    pub submit: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_cancel")]
    pub cancel: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            time: default_time(),
            remote: None,
            workdir: default_workdir(),
            bootstrap: Vec::new(),
            runner: default_runner(),
            directives: Vec::new(),
            sync: SyncConfig::default(),
            poll: PollConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_sync_root(),
            exclude: default_excludes(),
            exclude_from: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            retries: default_poll_retries(),
            backoff_ms: default_poll_backoff(),
            max_wait_secs: default_max_wait(),
            cancel_on_abort: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            query: default_query(),
            cancel: default_cancel(),
        }
    }
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: None,
            identity: None,
            password: None,
            transport: Transport::default(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: None,
        }
    }

    /// `user@host` or just `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl SyncConfig {
    /// all exclude patterns, including the ones from `exclude_from`
    pub fn patterns(&self) -> Result<Vec<String>, ConfigErrors> {
        let mut patterns = self.exclude.clone();

        if let Some(ref path) = self.exclude_from {
            patterns.extend(
                fs::read_to_string(path)?
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(String::from),
            );
        }

        Ok(patterns)
    }
}

/// check a wall-clock limit for the `HH:MM:SS` format
pub fn is_valid_time(time: &str) -> bool {
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit());
    let sexagesimal = |part: &str| part.len() == 2 && digits(part) && part < "60";

    match time.split(':').collect::<Vec<_>>().as_slice() {
        [hours, minutes, seconds] => digits(*hours) && sexagesimal(*minutes) && sexagesimal(*seconds),
        _ => false,
    }
}

impl TaskConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn from_yaml(input: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// overlay the deployment environment (`SLURM_*` variables)
    pub fn apply_env(&mut self) -> Result<(), ConfigErrors> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// overlay values from an arbitrary lookup, empty values count as unset
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigErrors>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = lookup("SLURM_REMOTE") {
            match self.remote {
                Some(ref mut remote) => remote.host = host,
                None => self.remote = Some(RemoteConfig::new(host)),
            }
        }
        if let Some(partition) = lookup("SLURM_PARTITION") {
            self.partition = partition;
        }
        if let Some(time) = lookup("SLURM_TIME") {
            self.time = time;
        }
        if let Some(workdir) = lookup("SLURM_WORKDIR") {
            self.workdir = workdir;
        }

        // the session overrides only make sense with a remote
        if let Some(ref mut remote) = self.remote {
            if let Some(port) = lookup("SLURM_PORT") {
                remote.port = port
                    .parse()
                    .map_err(|_| ConfigErrors::InvalidEnvironment("SLURM_PORT"))?;
            }
            if let Some(user) = lookup("SLURM_USER") {
                remote.user = Some(user);
            }
            if let Some(identity) = lookup("SLURM_IDENTITY") {
                remote.identity = Some(PathBuf::from(identity));
            }
            if let Some(password) = lookup("SLURM_PASSWORD") {
                remote.password = Some(password);
            }
        }

        Ok(())
    }

    /// Check the config for problems and report all of them at once.
    /// Returns true if an error was found; recoverable problems are only warned about.
    pub fn preflight_checks(&self) -> bool {
        // every problem is reported, not just the first one
        let mut contains_error = false;

        if self.partition.trim().is_empty() {
            warn!(
                "partition is empty, falling back to '{}'",
                default_partition()
            );
        }

        if !is_valid_time(&self.time) {
            warn!(
                "time '{}' is not HH:MM:SS, falling back to '{}'",
                self.time,
                default_time()
            );
        }

        if let Some(ref remote) = self.remote {
            if remote.host.trim().is_empty() {
                error!("remote.host must not be empty");
                contains_error = true;
            }

            if remote.port == 0 {
                error!("remote.port must not be 0");
                contains_error = true;
            }

            if let Some(ref identity) = remote.identity {
                if !identity.is_file() {
                    warn!(
                        "remote.identity {} was not found, ssh will likely reject the key",
                        identity.to_string_lossy()
                    );
                }
            }

            if self.workdir.trim().is_empty() {
                error!("workdir must not be empty when a remote is configured");
                contains_error = true;
            } else if self.workdir.chars().any(char::is_whitespace) {
                error!("workdir '{}' must not contain whitespace", self.workdir);
                contains_error = true;
            }

            if self.runner.trim().is_empty() {
                error!("runner must name the command that executes the task on the remote");
                contains_error = true;
            }

            if !self.sync.root.is_dir() {
                error!(
                    "sync.root {} is not a directory",
                    self.sync.root.to_string_lossy()
                );
                contains_error = true;
            }

            if let Some(ref exclude_from) = self.sync.exclude_from {
                if !exclude_from.is_file() {
                    error!(
                        "sync.exclude_from {} is not a file",
                        exclude_from.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if self.poll.interval_ms == 0 {
                warn!("poll.interval_ms is 0, the scheduler will be queried without pause");
            }

            if self.poll.max_wait_secs == 0 {
                error!("poll.max_wait_secs must be greater than 0");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_partition() -> String {
    String::from("short")
}

fn default_time() -> String {
    String::from("00:10:00")
}

fn default_workdir() -> String {
    String::from("~/remote_jobs")
}

fn default_runner() -> String {
    String::from("cargo run --release --quiet --")
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_sync_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_excludes() -> Vec<String> {
    vec![String::from(".git/"), String::from("target/")]
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_poll_retries() -> u32 {
    3
}

fn default_poll_backoff() -> u64 {
    1000
}

fn default_max_wait() -> u64 {
    24 * 60 * 60
}

fn default_submit() -> String {
    String::from("sbatch")
}

fn default_query() -> String {
    String::from("sacct")
}

fn default_cancel() -> String {
    String::from("scancel")
}

pub(crate) fn fallback_partition() -> String {
    default_partition()
}

pub(crate) fn fallback_time() -> String {
    default_time()
}
