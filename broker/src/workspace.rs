use crate::{
    capsule::CALL_FILE,
    session::{describe_failure, quote_path, Session, SessionError},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Failed to create remote directory {path}: {reason}")]
    CreateDirectory { path: String, reason: String },
    #[error("Failed to reach the remote while creating {path}")]
    Session {
        path: String,
        #[source]
        source: SessionError,
    },
    #[error("Failed to synchronize the codebase into {path}")]
    Sync {
        path: String,
        #[source]
        source: SessionError,
    },
    #[error("Failed to stage {file} locally")]
    Staging {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to transfer {file} into {path}")]
    Transfer {
        file: String,
        path: String,
        #[source]
        source: SessionError,
    },
}

/// Where one submission lives on the remote host.
///
/// Paths have second resolution: the same task submitted twice within one
/// second maps to the same directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDescriptor {
    workdir: String,
    task_name: String,
    created: u64,
}

impl WorkspaceDescriptor {
    pub fn new(workdir: impl Into<String>, task_name: impl Into<String>, created: u64) -> Self {
        Self {
            workdir: workdir.into(),
            task_name: task_name.into(),
            created,
        }
    }

    /// descriptor stamped with the current time
    pub fn now(workdir: impl Into<String>, task_name: impl Into<String>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        Self::new(workdir, task_name, created)
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// `{workdir}/{task_name}_{epoch_seconds}`
    pub fn path(&self) -> String {
        format!(
            "{}/{}_{}",
            self.workdir.trim_end_matches('/'),
            self.task_name,
            self.created
        )
    }

    /// path of `file` inside the workspace
    pub fn file(&self, file: &str) -> String {
        format!("{}/{file}", self.path())
    }
}

/// Creates remote workspaces and fills them with the codebase and a capsule.
#[derive(Debug)]
pub struct Provisioner<'a> {
    root: &'a Path,
    exclude: &'a [String],
    staging: &'a Path,
}

impl<'a> Provisioner<'a> {
    /// `root` is mirrored into every workspace, `staging` is a private local directory
    pub fn new(root: &'a Path, exclude: &'a [String], staging: &'a Path) -> Self {
        Self {
            root,
            exclude,
            staging,
        }
    }

    /// Create the workspace, mirror the codebase and place the capsule in it.
    /// Every step requires the previous one, a half-filled workspace is left as is.
    #[instrument(skip(self, session, capsule), fields(path = %descriptor.path()), level = "info")]
    pub fn provision(
        &self,
        session: &mut dyn Session,
        descriptor: &WorkspaceDescriptor,
        capsule: &[u8],
    ) -> Result<String, ProvisioningError> {
        let path = descriptor.path();

        // mkdir -p succeeds for existing directories
        let output = session
            .run(&format!("mkdir -p {}", quote_path(&path)), true)
            .map_err(|source| ProvisioningError::Session {
                path: path.clone(),
                source,
            })?;
        if !output.success() {
            return Err(ProvisioningError::CreateDirectory {
                path,
                reason: describe_failure(&output).into_owned(),
            });
        }

        info!("Synchronizing {} into the workspace", self.root.display());
        session
            .sync_tree(self.root, &path, self.exclude)
            .map_err(|source| ProvisioningError::Sync {
                path: path.clone(),
                source,
            })?;

        self.place(session, descriptor, CALL_FILE, capsule)?;

        Ok(path)
    }

    /// Stage `content` locally as `file` and copy it into the workspace.
    pub fn place(
        &self,
        session: &mut dyn Session,
        descriptor: &WorkspaceDescriptor,
        file: &str,
        content: &[u8],
    ) -> Result<String, ProvisioningError> {
        let local: PathBuf = self.staging.join(file);
        let remote = descriptor.file(file);

        fs::write(&local, content).map_err(|source| ProvisioningError::Staging {
            file: file.to_string(),
            source,
        })?;

        session
            .copy(&local, &remote)
            .map_err(|source| ProvisioningError::Transfer {
                file: file.to_string(),
                path: descriptor.path(),
                source,
            })?;

        Ok(remote)
    }
}
