//! In-progress artifact builds

use crate::error::{VectisError, VectisResult};
use crate::store::artifact::ArtifactKey;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// A staging file reserved for one build
///
/// The producer writes the artifact to [`StagingArtifact::path`], then
/// seals it. Dropping an unpublished staging artifact removes its file.
#[derive(Debug)]
pub struct StagingArtifact {
    key: ArtifactKey,
    path: PathBuf,
    final_path: PathBuf,
    sealed_len: Option<u64>,
    finished: bool,
}

impl StagingArtifact {
    pub(crate) fn new(key: ArtifactKey, path: PathBuf, final_path: PathBuf) -> Self {
        Self {
            key,
            path,
            final_path,
            sealed_len: None,
            finished: false,
        }
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Where the producer writes
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the artifact will be published
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flush the file to disk and record its length
    ///
    /// An empty file is never a complete artifact.
    pub async fn seal(&mut self) -> VectisResult<u64> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| self.incomplete(format!("cannot open staging file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| VectisError::io(format!("syncing {}", self.path.display()), e))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| VectisError::io(format!("inspecting {}", self.path.display()), e))?
            .len();
        if len == 0 {
            return Err(self.incomplete("staging file is empty".to_string()));
        }

        debug!("Sealed {} ({} bytes)", self.path.display(), len);
        self.sealed_len = Some(len);
        Ok(len)
    }

    /// Check the staging file is still exactly what was sealed
    pub(crate) async fn verify(&self) -> VectisResult<()> {
        let Some(sealed) = self.sealed_len else {
            return Err(self.incomplete("staging file was never sealed".to_string()));
        };

        let len = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(self.incomplete("staging file is missing".to_string()))
            }
            Err(e) => return Err(VectisError::io(format!("inspecting {}", self.path.display()), e)),
        };

        if len != sealed {
            return Err(self.incomplete(format!(
                "staging file changed after sealing ({} bytes, sealed at {})",
                len, sealed
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_published(&mut self) {
        self.finished = true;
    }

    /// Remove the staging file without publishing it
    pub async fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        match fs::remove_file(&self.path).await {
            Ok(()) => debug!("Discarded {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }

    fn incomplete(&self, reason: String) -> VectisError {
        VectisError::ArtifactBuildIncomplete {
            key: self.key.to_string(),
            reason,
        }
    }
}

impl Drop for StagingArtifact {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.path.display(), e);
                }
            }
        }
    }
}
