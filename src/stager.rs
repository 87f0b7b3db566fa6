//! Local staging of source audio and cleanup of everything derived from it

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use md5::{Digest, Md5};

use crate::error::{RunnerError, Result};
use crate::job::{Detection, Job};
use crate::storage::ObjectStorage;

/// Local copy of a job's source audio.
///
/// Consumed by [`FileStager::release`], so a staged file can only be released once.
#[derive(Debug, PartialEq, Eq)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct FileStager {
    storage: Arc<dyn ObjectStorage>,
    dir: PathBuf,
}

impl FileStager {
    pub fn new(storage: Arc<dyn ObjectStorage>, dir: impl Into<PathBuf>) -> Self {
        Self { storage, dir: dir.into() }
    }

    /// Download the job's source object into the scratch directory under its base filename.
    pub async fn stage(&self, job: &Job) -> Result<StagedFile> {
        let filename = job.source_filename();
        if filename.is_empty() {
            return Err(RunnerError::config(format!("Job {} has no source filename", job.id)));
        }
        let path = self.dir.join(filename);

        if let Err(e) = self.storage.download_to(job.source_bucket(), &job.file_path, &path).await {
            remove_quietly(&path).await;
            return Err(e);
        }

        debug!("Staged s3://{}/{} at {}", job.source_bucket(), job.file_path, path.display());
        Ok(StagedFile { path })
    }

    /// Delete the staged file and every artifact the detections reference.
    ///
    /// Missing files are not an error. Returns the number of files actually removed.
    pub async fn release(&self, staged: StagedFile, detections: &[Detection]) -> usize {
        let mut removed = 0;
        let paths = std::iter::once(staged.path.as_path())
            .chain(detections.iter().flat_map(|d| d.artifact_paths()));
        for path in paths {
            if remove_quietly(path).await {
                removed += 1;
            }
        }
        debug!("Released {} local files", removed);
        removed
    }
}

async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Cannot remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Hex MD5 of a file's contents.
pub async fn file_checksum(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RunnerError::io(format!("Cannot checksum {}: {}", path.display(), e)))?;
    Ok(hex::encode(Md5::digest(&bytes)))
}
