//! Archival mover
//!
//! Layout: `{archive_root}/{catalogue-ref}/{archive-date}/{instrument}/{file}`.
//! The destination is a pure function of its inputs; the move itself is the
//! single point where the scratch copy is consumed.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

/// What to do when the destination file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Refuse; the record is dead-lettered with an archive conflict
    #[default]
    Fail,
    /// Replace the existing file
    Overwrite,
    /// Append `.1`, `.2`, … to the file name until it is free
    Rename,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive destination already exists: {}", .0.display())]
    Conflict(PathBuf),

    #[error("Working copy has no file name: {}", .0.display())]
    NoFileName(PathBuf),

    #[error("Archive I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory components must not escape their level of the layout
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Deterministic archive destination
pub fn archive_destination(
    archive_root: &Path,
    reference_id: &str,
    archive_date: &str,
    instrument: &str,
    file_name: &str,
) -> PathBuf {
    archive_root
        .join(path_component(reference_id))
        .join(path_component(archive_date))
        .join(path_component(instrument))
        .join(path_component(file_name))
}

/// Final location of an archived working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    pub path: PathBuf,
    /// Earlier file set aside by an overwrite; restored on roll back
    pub displaced: Option<PathBuf>,
}

impl ArchivedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, displaced: None }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn already_exists(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AlreadyExists
}

/// Place a copy of `from` at `to`, failing with `AlreadyExists` rather than
/// replacing a file. Hard links when it can, otherwise copies into a file
/// created with `create_new`.
pub async fn link_or_copy_new(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) if already_exists(&e) => return Err(e),
        Err(link_err) => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %link_err,
                "Hard link failed, falling back to copy"
            );
        }
    }

    let mut target = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .await?;

    let copied = copy_into(from, &mut target).await;
    drop(target);
    if copied.is_err() {
        if let Err(e) = tokio::fs::remove_file(to).await {
            tracing::warn!(path = %to.display(), error = %e, "Partial copy left behind");
        }
    }
    copied
}

async fn copy_into(from: &Path, target: &mut tokio::fs::File) -> io::Result<()> {
    let mut source = tokio::fs::File::open(from).await?;
    tokio::io::copy(&mut source, target).await?;
    target.sync_all().await
}

/// Move `from` to `to` without ever replacing an existing file
pub async fn move_new(from: &Path, to: &Path) -> io::Result<()> {
    link_or_copy_new(from, to).await?;

    if let Err(e) = tokio::fs::remove_file(from).await {
        // Keep exactly one copy
        if let Err(undo) = tokio::fs::remove_file(to).await {
            tracing::warn!(path = %to.display(), error = %undo, "Failed to undo move");
        }
        return Err(e);
    }
    Ok(())
}

/// Move `from` to the first free name among `base`, `base.1`, `base.2`, …
///
/// Each candidate is claimed atomically, so concurrent callers never land
/// on the same name.
pub async fn move_to_free_name(from: &Path, base: &Path) -> io::Result<PathBuf> {
    let mut candidate = base.to_path_buf();
    let mut suffix = 0u32;
    loop {
        match move_new(from, &candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if already_exists(&e) => {
                suffix += 1;
                candidate = with_suffix(base, &format!(".{}", suffix));
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct ArchivalMover {
    archive_root: PathBuf,
    policy: CollisionPolicy,
    /// Serializes set-aside + replace for overwrites
    overwrite_lock: Mutex<()>,
}

impl ArchivalMover {
    pub fn new(archive_root: impl Into<PathBuf>, policy: CollisionPolicy) -> Self {
        Self {
            archive_root: archive_root.into(),
            policy,
            overwrite_lock: Mutex::new(()),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Move `working_copy` to its destination
    pub async fn archive(
        &self,
        working_copy: &Path,
        reference_id: &str,
        archive_date: &str,
        instrument: &str,
    ) -> Result<ArchivedFile, ArchiveError> {
        let file_name = working_copy
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ArchiveError::NoFileName(working_copy.to_path_buf()))?;

        let destination = archive_destination(
            &self.archive_root,
            reference_id,
            archive_date,
            instrument,
            &file_name,
        );

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let archived = match self.policy {
            CollisionPolicy::Fail => match move_new(working_copy, &destination).await {
                Ok(()) => ArchivedFile::new(destination),
                Err(e) if already_exists(&e) => return Err(ArchiveError::Conflict(destination)),
                Err(source) => {
                    return Err(ArchiveError::Io {
                        path: destination,
                        source,
                    })
                }
            },
            CollisionPolicy::Rename => {
                let path = move_to_free_name(working_copy, &destination)
                    .await
                    .map_err(|source| ArchiveError::Io {
                        path: destination.clone(),
                        source,
                    })?;
                if path != destination {
                    tracing::warn!(
                        destination = %destination.display(),
                        renamed = %path.display(),
                        "Archive destination taken, renaming"
                    );
                }
                ArchivedFile::new(path)
            }
            CollisionPolicy::Overwrite => self.overwrite(working_copy, destination).await?,
        };

        tracing::debug!(destination = %archived.path.display(), "Working copy archived");
        Ok(archived)
    }

    /// Set the current file aside as `*.bak` and put the working copy in its
    /// place. The earlier file is only dropped by [`ArchivalMover::commit`].
    async fn overwrite(&self, working_copy: &Path, destination: PathBuf) -> Result<ArchivedFile, ArchiveError> {
        let _guard = self.overwrite_lock.lock().await;

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArchiveError::Io { path, source }
        };

        match move_new(working_copy, &destination).await {
            Ok(()) => return Ok(ArchivedFile::new(destination)),
            Err(e) if already_exists(&e) => {}
            Err(e) => return Err(io_err(&destination)(e)),
        }

        let backup = move_to_free_name(&destination, &with_suffix(&destination, ".bak"))
            .await
            .map_err(io_err(&destination))?;
        tracing::warn!(
            destination = %destination.display(),
            displaced = %backup.display(),
            "Overwriting existing archive file"
        );

        match move_new(working_copy, &destination).await {
            Ok(()) => Ok(ArchivedFile {
                path: destination,
                displaced: Some(backup),
            }),
            Err(e) => {
                if let Err(restore_err) = move_new(&backup, &destination).await {
                    tracing::error!(
                        destination = %destination.display(),
                        displaced = %backup.display(),
                        error = %restore_err,
                        "Failed to restore displaced archive file"
                    );
                }
                if already_exists(&e) {
                    Err(ArchiveError::Conflict(destination))
                } else {
                    Err(io_err(&destination)(e))
                }
            }
        }
    }

    /// Undo an archive move: drop the archived file and put back whatever
    /// it displaced
    pub async fn roll_back(&self, archived: &ArchivedFile) -> io::Result<()> {
        match &archived.displaced {
            Some(backup) => tokio::fs::rename(backup, &archived.path).await,
            None => tokio::fs::remove_file(&archived.path).await,
        }
    }

    /// The archived record is stored; the displaced file is no longer needed
    pub async fn commit(&self, archived: &ArchivedFile) -> io::Result<()> {
        match &archived.displaced {
            Some(backup) => tokio::fs::remove_file(backup).await,
            None => Ok(()),
        }
    }
}
