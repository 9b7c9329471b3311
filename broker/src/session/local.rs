use super::{execute, CommandOutput, Session, SessionError};
use crate::config::RemoteConfig;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::{
    collections::BTreeSet,
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, instrument, trace};

static HOME: Lazy<Option<PathBuf>> = Lazy::new(dirs::home_dir);

/// Session for when the scheduler is reachable from this very machine.
///
/// Commands go through `sh -c`, files are copied in-process.
#[derive(Debug, Default)]
pub struct LocalSession {
    timeout: Option<Duration>,
    closed: bool,
}

impl LocalSession {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            closed: false,
        }
    }

    pub fn open(config: &RemoteConfig) -> Result<Self, SessionError> {
        Ok(Self::new(config.command_timeout()))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Session for LocalSession {
    fn run(&mut self, command: &str, capture_output: bool) -> Result<CommandOutput, SessionError> {
        self.ensure_open()?;
        debug!(command = command, "Running local command");

        execute(
            Command::new("sh").arg("-c").arg(command),
            capture_output,
            self.timeout,
        )
    }

    fn copy(&mut self, local_path: &Path, remote_path: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let target = expand_home(remote_path);

        fs::copy(local_path, &target)
            .map(|_| ())
            .map_err(|error| transfer_error(local_path, &target, error))
    }

    fn sync_tree(
        &mut self,
        local_dir: &Path,
        remote_dir: &str,
        exclude: &[String],
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let target = expand_home(remote_dir);

        let copied = mirror(local_dir, &target, exclude)
            .map_err(|error| transfer_error(local_dir, &target, error))?;
        debug!(copied = copied, target = ?target, "Mirrored tree");

        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.closed = true;

        Ok(())
    }
}

fn transfer_error(from: &Path, to: &Path, error: impl ToString) -> SessionError {
    SessionError::Transfer {
        from: from.to_string_lossy().into_owned(),
        to: to.to_string_lossy().into_owned(),
        reason: error.to_string(),
    }
}

/// resolve a leading `~` like the remote shell would
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), HOME.as_ref()) {
        (Some(""), Some(home)) => home.clone(),
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// rsync style exclude patterns
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    any: GlobSet,
    directories: GlobSet,
}

impl ExcludeSet {
    /// A trailing `/` restricts a pattern to directories, a leading `/` or an inner
    /// `/` anchors it to the root, every other pattern matches at any depth.
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut any = GlobSetBuilder::new();
        let mut directories = GlobSetBuilder::new();

        for pattern in patterns {
            let (pattern, directory_only) = match pattern.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (pattern.as_str(), false),
            };
            let glob = match pattern.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None if pattern.contains('/') => pattern.to_string(),
                None => format!("**/{pattern}"),
            };
            let glob = GlobBuilder::new(&glob).literal_separator(true).build()?;

            if directory_only {
                directories.add(glob);
            } else {
                any.add(glob);
            }
        }

        Ok(Self {
            any: any.build()?,
            directories: directories.build()?,
        })
    }

    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        self.any.is_match(relative) || (is_dir && self.directories.is_match(relative))
    }
}

fn walk(
    root: &Path,
    excludes: &ExcludeSet,
    skip: Option<PathBuf>,
) -> impl Iterator<Item = Result<DirEntry, ignore::Error>> {
    let filter_root = root.to_path_buf();
    let filter_excludes = excludes.clone();

    WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map_or(false, |kind| kind.is_dir());

            match entry.path().strip_prefix(&filter_root) {
                Ok(relative) if !relative.as_os_str().is_empty() => {
                    skip.as_deref() != Some(relative) && !filter_excludes.is_excluded(relative, is_dir)
                }
                _ => true,
            }
        })
        .build()
}

/// `target` relative to `source` when it lies inside it
fn nested_target(source: &Path, target: &Path) -> Option<PathBuf> {
    let source = source.canonicalize().ok()?;
    let target = target.canonicalize().ok()?;
    let relative = target.strip_prefix(&source).ok()?;

    (!relative.as_os_str().is_empty()).then(|| relative.to_path_buf())
}

/// Mirror `source` into `target` like `rsync -a --delete`. A target inside the
/// source is left out of the copy. Returns the number of copied files.
#[instrument(skip(exclude), level = "debug")]
pub fn mirror(source: &Path, target: &Path, exclude: &[String]) -> Result<usize, io::Error> {
    let excludes = ExcludeSet::new(exclude).map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    let mut kept = BTreeSet::new();
    let mut copied = 0;

    fs::create_dir_all(target)?;
    let nested = nested_target(source, target);

    for entry in walk(source, &excludes, nested) {
        let entry = entry.map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => continue,
        };
        let destination = target.join(&relative);
        let Some(kind) = entry.file_type() else {
            continue;
        };

        if kind.is_dir() {
            fs::create_dir_all(&destination)?;
        } else if kind.is_symlink() {
            if destination.symlink_metadata().is_ok() {
                fs::remove_file(&destination)?;
            }
            symlink(fs::read_link(entry.path())?, &destination)?;
        } else {
            trace!(path = ?relative, "Copying");
            fs::copy(entry.path(), &destination)?;
            copied += 1;
        }

        kept.insert(relative);
    }

    // delete everything in the target that is neither mirrored nor excluded,
    // shallow paths first so a removed directory takes its children with it
    let stale = walk(target, &excludes, None)
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(target).ok()?.to_path_buf();

            (!relative.as_os_str().is_empty() && !kept.contains(&relative)).then_some(relative)
        })
        .sorted_by_key(|relative| relative.components().count())
        .collect_vec();

    for relative in stale {
        let path = target.join(&relative);

        match path.symlink_metadata() {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            // already gone with its parent
            Err(_) => continue,
        }
        debug!(path = ?relative, "Deleted stale path");
    }

    Ok(copied)
}
