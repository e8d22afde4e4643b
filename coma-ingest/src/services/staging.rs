//! Scratch working copies
//!
//! Every record gets its own scratch directory so files with the same name
//! from different nights cannot collide while processed concurrently.

use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct Stager {
    scratch_dir: PathBuf,
}

impl Stager {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn record_dir(&self, record_id: Uuid) -> PathBuf {
        self.scratch_dir.join(record_id.to_string())
    }

    /// Copy `source` to `{scratch}/{record_id}/{filename}`
    pub async fn stage(&self, record_id: Uuid, source: &Path) -> io::Result<PathBuf> {
        let file_name = source.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no file name in {}", source.display()),
            )
        })?;

        let dir = self.record_dir(record_id);
        tokio::fs::create_dir_all(&dir).await?;

        let working_copy = dir.join(file_name);
        tokio::fs::copy(source, &working_copy).await?;
        Ok(working_copy)
    }

    /// Remove whatever is left of a record's scratch directory
    pub async fn discard(&self, record_id: Uuid) {
        let dir = self.record_dir(record_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to discard scratch directory"),
        }
    }
}
