//! Scripted session for tests.
//!
//! Records every command, copy and sync, and answers commands from queues of
//! canned responses keyed by a substring of the command.

use super::{CommandOutput, Session, SessionError};
use parking_lot::Mutex;
use std::{collections::VecDeque, fs, path::Path, sync::Arc};

type Response = Result<CommandOutput, SessionError>;

#[derive(Default, Debug)]
struct State {
    commands: Vec<String>,
    copies: Vec<(String, String)>,
    syncs: Vec<(String, Vec<String>)>,
    responses: Vec<(String, VecDeque<Response>)>,
    fail_sync: bool,
    closed: usize,
}

/// Clones share their state, keep one clone to inspect what the broker did.
#[derive(Clone, Default, Debug)]
pub struct MockSession {
    state: Arc<Mutex<State>>,
}

pub fn ok(stdout: &str) -> Response {
    Ok(CommandOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn exit(status: i32, stderr: &str) -> Response {
    Ok(CommandOutput {
        status,
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

pub fn connection_lost() -> Response {
    Err(SessionError::Connection {
        host: String::from("mock"),
        reason: String::from("connection reset by peer"),
    })
}

impl MockSession {
    /// Answer commands containing `needle` with `responses`, in order. Once the
    /// queue is drained such commands succeed with empty output.
    pub fn respond(&self, needle: &str, responses: impl IntoIterator<Item = Response>) -> &Self {
        self.state
            .lock()
            .responses
            .push((needle.to_string(), responses.into_iter().collect()));
        self
    }

    pub fn fail_sync(&self) -> &Self {
        self.state.lock().fail_sync = true;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }

    /// content of the file copied to `remote_path`
    pub fn copied(&self, remote_path: &str) -> Option<String> {
        self.state
            .lock()
            .copies
            .iter()
            .find(|(path, _)| path == remote_path)
            .map(|(_, content)| content.clone())
    }

    pub fn synced(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().syncs.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }
}

impl Session for MockSession {
    fn run(&mut self, command: &str, _capture_output: bool) -> Result<CommandOutput, SessionError> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());

        state
            .responses
            .iter_mut()
            .find(|(needle, queue)| command.contains(needle.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
            .unwrap_or_else(|| ok(""))
    }

    fn copy(&mut self, local_path: &Path, remote_path: &str) -> Result<(), SessionError> {
        let content = fs::read_to_string(local_path).map_err(|error| SessionError::Transfer {
            from: local_path.to_string_lossy().into_owned(),
            to: remote_path.to_string(),
            reason: error.to_string(),
        })?;

        self.state
            .lock()
            .copies
            .push((remote_path.to_string(), content));
        Ok(())
    }

    fn sync_tree(
        &mut self,
        local_dir: &Path,
        remote_dir: &str,
        exclude: &[String],
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();

        if state.fail_sync {
            return Err(SessionError::Transfer {
                from: local_dir.to_string_lossy().into_owned(),
                to: remote_dir.to_string(),
                reason: String::from("rsync: connection unexpectedly closed"),
            });
        }

        state.syncs.push((remote_dir.to_string(), exclude.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.state.lock().closed += 1;
        Ok(())
    }
}
