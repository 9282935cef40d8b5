//! Build artifact store
//!
//! Artifacts live at `<root>/<arch>/<vendor>/<suite>/<file>`. They are built
//! into a uniquely named staging file next to their final name and
//! published by a no-clobber hard link, so readers only ever see complete
//! files and concurrent builders of the same key cannot overwrite each
//! other.
//!
//! # Artifact States
//!
//! | State | On disk | Description |
//! |-------|---------|-------------|
//! | Building | `<file>.new-<uuid>` | In progress, or left by a crash |
//! | Published | `<file>` | Complete, immutable |
//! | Linked | `<file>` → elsewhere | Complete, read-only |

pub mod artifact;
mod staging;

pub use artifact::{format_bytes, ArtifactEntry, ArtifactHandle, ArtifactKey, ArtifactKind, ArtifactState};
pub use staging::StagingArtifact;

use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Marker between an artifact's file name and the staging suffix
const STAGING_MARKER: &str = ".new-";

/// Artifact storage rooted at one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of an artifact
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Find the published artifact for `key`
    ///
    /// A symlink is followed and reported read-only; a dangling symlink
    /// counts as absent.
    pub async fn lookup(&self, key: &ArtifactKey) -> VectisResult<Option<ArtifactHandle>> {
        let path = self.path_for(key);

        let meta = match fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VectisError::io(format!("inspecting {}", path.display()), e)),
        };

        let read_only = meta.file_type().is_symlink();
        if read_only {
            match fs::metadata(&path).await {
                Ok(target) if target.is_file() => {}
                Ok(_) => {
                    return Err(VectisError::User(format!(
                        "{} does not point to a regular file",
                        path.display()
                    )))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Ignoring dangling symlink {}", path.display());
                    return Ok(None);
                }
                Err(e) => return Err(VectisError::io(format!("following {}", path.display()), e)),
            }
        } else if !meta.is_file() {
            return Err(VectisError::User(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Some(ArtifactHandle {
            key: key.clone(),
            path,
            read_only,
        }))
    }

    /// Find the artifact of `kind` for `suite` or its nearest ancestor
    pub async fn lookup_chain(
        &self,
        kind: ArtifactKind,
        suite: &Suite,
    ) -> VectisResult<Option<ArtifactHandle>> {
        for ancestor in suite.hierarchy() {
            let key = ArtifactKey::new(&suite.architecture, &ancestor.vendor, &ancestor.name, kind);
            if let Some(handle) = self.lookup(&key).await? {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    /// Reserve a fresh staging file for `key`
    pub async fn begin_build(&self, key: &ArtifactKey) -> VectisResult<StagingArtifact> {
        let final_path = self.path_for(key);
        let dir = parent_dir(&final_path)?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", dir.display()), e))?;

        let staging_path = dir.join(format!(
            "{}{}{}",
            key.kind.file_name(),
            STAGING_MARKER,
            uuid::Uuid::new_v4().simple()
        ));

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging_path)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", staging_path.display()), e))?;

        debug!("Staging {} at {}", key, staging_path.display());
        Ok(StagingArtifact::new(key.clone(), staging_path, final_path))
    }

    /// Reserve a staging file holding a copy of `source`
    ///
    /// The source is only read, so a read-only (symlinked) parent is safe
    /// to derive from.
    pub async fn begin_build_from(
        &self,
        key: &ArtifactKey,
        source: &ArtifactHandle,
    ) -> VectisResult<StagingArtifact> {
        let staging = self.begin_build(key).await?;
        info!("Copying {} to start {}", source.path.display(), key);
        fs::copy(&source.path, staging.path()).await.map_err(|e| {
            VectisError::io(
                format!("copying {} to {}", source.path.display(), staging.path().display()),
                e,
            )
        })?;
        Ok(staging)
    }

    /// Publish a sealed staging file under its final name
    ///
    /// Exactly one of several racing publishers wins; the others discard
    /// their staging file and get the winner's artifact. An unsealed,
    /// missing or modified staging file is discarded and reported as
    /// [`VectisError::ArtifactBuildIncomplete`].
    pub async fn publish(&self, mut staging: StagingArtifact) -> VectisResult<ArtifactHandle> {
        let key = staging.key().clone();

        if let Err(e) = staging.verify().await {
            staging.discard().await;
            return Err(e);
        }

        let final_path = staging.final_path().to_path_buf();
        self.clear_dangling(&final_path).await?;

        match fs::hard_link(staging.path(), &final_path).await {
            Ok(()) => {
                staging.mark_published();
                if let Err(e) = fs::remove_file(staging.path()).await {
                    warn!("Failed to remove {}: {}", staging.path().display(), e);
                }
                sync_dir(parent_dir(&final_path)?).await?;
                info!("Published {}", key);
                Ok(ArtifactHandle {
                    key,
                    path: final_path,
                    read_only: false,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!("{} was published concurrently, discarding this build", key);
                staging.discard().await;
                self.lookup(&key).await?.ok_or_else(|| {
                    VectisError::Internal(format!("{} vanished after a concurrent publish", key))
                })
            }
            Err(e) => {
                staging.discard().await;
                Err(VectisError::io(format!("publishing {}", final_path.display()), e))
            }
        }
    }

    /// A writable artifact at the handle's location
    ///
    /// A symlinked artifact is replaced by a private copy (the link itself
    /// is renamed over, its target is left untouched). Writable handles are
    /// returned as they are.
    pub async fn materialize_writable_copy(
        &self,
        handle: &ArtifactHandle,
    ) -> VectisResult<ArtifactHandle> {
        if !handle.read_only {
            return Ok(handle.clone());
        }

        let mut staging = self.begin_build(&handle.key).await?;
        fs::copy(&handle.path, staging.path()).await.map_err(|e| {
            VectisError::io(format!("copying {}", handle.path.display()), e)
        })?;
        staging.seal().await?;
        staging.verify().await?;

        fs::rename(staging.path(), &handle.path)
            .await
            .map_err(|e| VectisError::io(format!("replacing {}", handle.path.display()), e))?;
        staging.mark_published();
        sync_dir(parent_dir(&handle.path)?).await?;

        info!("Replaced symlink {} with a private copy", handle.path.display());
        Ok(ArtifactHandle {
            key: handle.key.clone(),
            path: handle.path.clone(),
            read_only: false,
        })
    }

    /// Remove a published artifact; returns whether there was one
    ///
    /// A symlink is removed, never its target.
    pub async fn remove(&self, key: &ArtifactKey) -> VectisResult<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VectisError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Delete staging files left behind by interrupted builds
    ///
    /// A build still running in another process loses its staging file and
    /// fails at publication, so only call this when nothing is building.
    pub async fn clean_staging(&self) -> VectisResult<Vec<ArtifactEntry>> {
        let mut removed = Vec::new();
        for entry in self.list().await? {
            if entry.state != ArtifactState::Building {
                continue;
            }
            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    info!("Removed leftover {}", entry.path.display());
                    removed.push(entry);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(VectisError::io(format!("removing {}", entry.path.display()), e))
                }
            }
        }
        Ok(removed)
    }

    /// Every artifact and staging file in the store
    pub async fn list(&self) -> VectisResult<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();

        for arch_dir in read_subdirs(&self.root).await? {
            for vendor_dir in read_subdirs(&arch_dir).await? {
                for suite_dir in read_subdirs(&vendor_dir).await? {
                    self.list_suite_dir(&suite_dir, &mut entries).await?;
                }
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key).then(a.path.cmp(&b.path)));
        Ok(entries)
    }

    async fn list_suite_dir(&self, dir: &Path, entries: &mut Vec<ArtifactEntry>) -> VectisResult<()> {
        let (Some(architecture), Some(vendor), Some(suite)) = (
            component(dir, 2),
            component(dir, 1),
            component(dir, 0),
        ) else {
            return Ok(());
        };

        let mut reader = fs::read_dir(dir)
            .await
            .map_err(|e| VectisError::io(format!("reading {}", dir.display()), e))?;

        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| VectisError::io(format!("reading {}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (kind, staged) = match name.split_once(STAGING_MARKER) {
                Some((base, _)) => (ArtifactKind::from_file_name(base), true),
                None => (ArtifactKind::from_file_name(&name), false),
            };
            let Some(kind) = kind else {
                continue;
            };

            let path = entry.path();
            let link = fs::symlink_metadata(&path)
                .await
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            let size_bytes = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

            let state = if staged {
                ArtifactState::Building
            } else if link {
                ArtifactState::Linked
            } else {
                ArtifactState::Published
            };

            entries.push(ArtifactEntry {
                key: ArtifactKey::new(&architecture, &vendor, &suite, kind),
                state,
                path,
                size_bytes,
            });
        }

        Ok(())
    }

    async fn clear_dangling(&self, path: &Path) -> VectisResult<()> {
        let is_link = matches!(fs::symlink_metadata(path).await, Ok(m) if m.file_type().is_symlink());
        if is_link && fs::metadata(path).await.is_err() {
            warn!("Removing dangling symlink {}", path.display());
            fs::remove_file(path)
                .await
                .map_err(|e| VectisError::io(format!("removing {}", path.display()), e))?;
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> VectisResult<&Path> {
    path.parent()
        .ok_or_else(|| VectisError::Internal(format!("{} has no parent", path.display())))
}

/// Name of the directory `up` levels above `dir` (0 is `dir` itself)
fn component(dir: &Path, up: usize) -> Option<String> {
    dir.ancestors()
        .nth(up)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
}

async fn read_subdirs(dir: &Path) -> VectisResult<Vec<PathBuf>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VectisError::io(format!("reading {}", dir.display()), e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| VectisError::io(format!("reading {}", dir.display()), e))?
    {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Flush a directory entry change to disk
async fn sync_dir(dir: &Path) -> VectisResult<()> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| VectisError::io(format!("opening {}", dir.display()), e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| VectisError::io(format!("syncing {}", dir.display()), e))
}
