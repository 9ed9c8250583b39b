//! The four-directory filesystem queue.
//!
//! `pending/` holds submitted session files, `processing/` the one the
//! merger currently owns, `done/` merged sessions, `failed/` rejects.
//! Rename is the only coordination primitive: whoever renames a file out of
//! `pending/` owns it.

use grove_core::{GroveError, Result, SessionId};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MergeQueue {
    root: PathBuf,
}

impl MergeQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn done_dir(&self) -> PathBuf {
        self.root.join("done")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.pending_dir(),
            self.processing_dir(),
            self.done_dir(),
            self.failed_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// The session id a queue file belongs to.
    pub fn session_id(path: &Path) -> Result<SessionId> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(SessionId::from)
            .ok_or_else(|| {
                GroveError::invalid_input(format!("not a session file: {}", path.display()))
            })
    }

    /// Claim the oldest pending session by renaming it into `processing/`.
    ///
    /// FIFO order is filesystem modification time. A failed rename means a
    /// concurrent claimer won the race; the next candidate is tried.
    pub async fn claim_oldest(&self) -> Result<Option<PathBuf>> {
        let mut candidates = self.files_by_mtime(&self.pending_dir()).await?;
        candidates.sort_by_key(|(mtime, _)| *mtime);

        for (_, path) in candidates {
            let target = self.processing_dir().join(path.file_name().unwrap_or_default());
            match tokio::fs::rename(&path, &target).await {
                Ok(()) => {
                    debug!("Claimed {}", target.display());
                    return Ok(Some(target));
                }
                Err(e) => {
                    warn!("Lost claim race for {}: {e}", path.display());
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Move a processed session from `processing/` to `done/`.
    pub async fn finish(&self, processing_path: &Path) -> Result<PathBuf> {
        self.move_to(processing_path, &self.done_dir()).await
    }

    /// Move a rejected session from `processing/` to `failed/`.
    pub async fn fail(&self, processing_path: &Path) -> Result<PathBuf> {
        self.move_to(processing_path, &self.failed_dir()).await
    }

    async fn move_to(&self, from: &Path, dir: &Path) -> Result<PathBuf> {
        let to = dir.join(
            from.file_name()
                .ok_or_else(|| GroveError::invalid_input("queue path has no file name"))?,
        );
        tokio::fs::rename(from, &to).await?;
        Ok(to)
    }

    /// Move every leftover `processing/` file to `failed/`.
    ///
    /// A file stranded there means the previous merger died mid-merge; we
    /// cannot know whether its canonical transaction committed, so it is
    /// never resumed. Operators may inspect and requeue by hand.
    pub async fn recover_interrupted(&self) -> Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for (_, path) in self.files_by_mtime(&self.processing_dir()).await? {
            let to = self.fail(&path).await?;
            warn!("Recovered interrupted session file to {}", to.display());
            moved.push(to);
        }
        Ok(moved)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.files_by_mtime(&self.pending_dir()).await?.len())
    }

    /// Session files in `done/`, with modification times, for the GC.
    pub async fn done_files(&self) -> Result<Vec<(SystemTime, PathBuf)>> {
        self.files_by_mtime(&self.done_dir()).await
    }

    /// Session files in `failed/`, with modification times, for the GC.
    pub async fn failed_files(&self) -> Result<Vec<(SystemTime, PathBuf)>> {
        self.files_by_mtime(&self.failed_dir()).await
    }

    async fn files_by_mtime(&self, dir: &Path) -> Result<Vec<(SystemTime, PathBuf)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let mtime = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((mtime, path));
        }
        Ok(out)
    }
}
