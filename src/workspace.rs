//! Per-run artifact storage.
//!
//! The workspace is the idempotency ledger for stage execution: if a stage's
//! artifact file exists, the stage is treated as already done.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::errors::RunError;
use crate::run::RunId;

#[async_trait]
pub trait WorkspaceGate: Send + Sync {
    /// Absolute location of an artifact, whether or not it exists yet.
    fn locate(&self, run_id: RunId, relative_path: &str) -> Result<PathBuf, RunError>;

    async fn exists(&self, run_id: RunId, relative_path: &str) -> Result<bool, RunError>;

    /// Write `contents` and return the absolute location written.
    async fn write_text(
        &self,
        run_id: RunId,
        relative_path: &str,
        contents: &str,
    ) -> Result<PathBuf, RunError>;
}

/// Filesystem workspace rooted at `root/<run id, hyphen-free>/`.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.simple())
    }

    /// Resolve a relative artifact path inside the run's subtree.
    ///
    /// Only plain path segments are accepted; absolute paths, `..`, and
    /// empty paths fail with `UnsafePath`.
    pub fn resolve(&self, run_id: RunId, relative_path: &str) -> Result<PathBuf, RunError> {
        let unsafe_path = || RunError::UnsafePath {
            path: relative_path.to_string(),
        };
        let rel = Path::new(relative_path);
        let mut has_segment = false;
        for component in rel.components() {
            match component {
                Component::Normal(_) => has_segment = true,
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(unsafe_path());
                }
            }
        }
        if !has_segment {
            return Err(unsafe_path());
        }

        let run_dir = self.run_dir(run_id);
        let full = run_dir.join(rel);
        if !full.starts_with(&run_dir) || full == run_dir {
            return Err(unsafe_path());
        }
        Ok(full)
    }
}

#[async_trait]
impl WorkspaceGate for FsWorkspace {
    fn locate(&self, run_id: RunId, relative_path: &str) -> Result<PathBuf, RunError> {
        self.resolve(run_id, relative_path)
    }

    async fn exists(&self, run_id: RunId, relative_path: &str) -> Result<bool, RunError> {
        let path = self.resolve(run_id, relative_path)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to check {}", path.display()))
            .map_err(RunError::storage)
    }

    async fn write_text(
        &self,
        run_id: RunId,
        relative_path: &str,
        contents: &str,
    ) -> Result<PathBuf, RunError> {
        let path = self.resolve(run_id, relative_path)?;
        write_atomic(&path, contents)
            .await
            .map_err(RunError::storage)?;
        tracing::debug!(run_id = %run_id, path = %path.display(), bytes = contents.len(), "Artifact written");
        Ok(path)
    }
}

// Write to a sibling temp file and rename, so a crash mid-write never leaves
// a partial file that `exists` would report as a finished artifact.
async fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to move artifact into {}", path.display()));
    }
    Ok(())
}
