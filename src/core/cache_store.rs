//! On-disk layout of the preview cache.
//!
//! ```text
//! <cache-root>/<document-id>/preview/<chunk>.<ext>          rendered chunks
//! <cache-root>/<document-id>/preview/undo/<step>/<chunk>.<ext>  history snapshots
//! ```
//!
//! CacheStore never writes chunk files itself (the render engine does, at
//! `file_path(id)`). It only removes, archives into history, restores out of
//! history and prunes. Moves are `rename`s inside the same tree; restores copy
//! to a hidden temp name first and rename into place, so a chunk path either
//! holds a complete file or nothing.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, trace, warn};

use crate::core::chunks::ChunkId;
use crate::core::error::{PreviewError, Result};

/// Leaf name of the primary cache directory
pub const PREVIEW_DIR_NAME: &str = "preview";
/// Name of the history directory inside the primary directory
pub const HISTORY_DIR_NAME: &str = "undo";
/// Scene description exported for the current batch
pub const SCENE_FILE_NAME: &str = "preview.scene";

#[derive(Debug, Clone)]
pub struct CacheStore {
    primary: PathBuf,
    history: PathBuf,
    extension: String,
    document_id: String,
}

/// Document ids end up in a path: no separators, no dot tricks.
fn validate_document_id(document_id: &str) -> Result<()> {
    let ok = !document_id.is_empty()
        && document_id != "."
        && document_id != ".."
        && document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PreviewError::InvalidDocumentId(document_id.to_string()))
    }
}

impl CacheStore {
    /// Open (and create if needed) the cache for one document.
    ///
    /// Fails loudly when the resulting directory is not a `preview` folder
    /// living under a path that embeds the document id.
    pub fn open(cache_root: &Path, document_id: &str, extension: &str) -> Result<Self> {
        validate_document_id(document_id)?;
        let extension = extension.trim().trim_start_matches('.');
        if extension.is_empty() {
            return Err(PreviewError::MissingRenderParameters);
        }

        let root = std::path::absolute(cache_root)
            .map_err(|source| PreviewError::CacheRootUnavailable { path: cache_root.to_path_buf(), source })?;
        let primary = root.join(document_id).join(PREVIEW_DIR_NAME);
        let history = primary.join(HISTORY_DIR_NAME);

        fs::create_dir_all(&history)
            .map_err(|source| PreviewError::CacheRootUnavailable { path: history.clone(), source })?;

        let store = Self {
            primary,
            history,
            extension: extension.to_string(),
            document_id: document_id.to_string(),
        };
        store.check_identity()?;

        info!(
            "Preview cache opened: {} (ext={}, {} chunk files on disk)",
            store.primary.display(),
            store.extension,
            store.chunk_files().len()
        );
        Ok(store)
    }

    /// Guard against ever operating on (and deleting) an unrelated directory.
    fn check_identity(&self) -> Result<()> {
        let leaf_ok = self.primary.file_name().is_some_and(|n| n == PREVIEW_DIR_NAME);
        let owner_ok = self
            .primary
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|n| n == self.document_id.as_str());
        let history_ok = self.history.file_name().is_some_and(|n| n == HISTORY_DIR_NAME)
            && self.history.parent() == Some(self.primary.as_path());
        if leaf_ok && owner_ok && history_ok && self.primary.is_dir() {
            Ok(())
        } else {
            Err(PreviewError::ForeignDirectory(self.primary.clone()))
        }
    }

    pub fn primary_dir(&self) -> &Path {
        &self.primary
    }

    pub fn history_dir(&self) -> &Path {
        &self.history
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn file_name(&self, id: ChunkId) -> String {
        format!("{}.{}", id, self.extension)
    }

    /// Path of the chunk file. Pure, never touches disk.
    pub fn file_path(&self, id: ChunkId) -> PathBuf {
        self.primary.join(self.file_name(id))
    }

    pub fn scene_path(&self) -> PathBuf {
        self.primary.join(SCENE_FILE_NAME)
    }

    fn snapshot_dir(&self, step: usize) -> PathBuf {
        self.history.join(step.to_string())
    }

    fn snapshot_file(&self, id: ChunkId, step: usize) -> PathBuf {
        self.snapshot_dir(step).join(self.file_name(id))
    }

    /// A chunk exists only as a non-empty regular file.
    pub fn exists(&self, id: ChunkId) -> bool {
        fs::metadata(self.file_path(id))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    pub fn modified(&self, id: ChunkId) -> Option<SystemTime> {
        fs::metadata(self.file_path(id)).and_then(|m| m.modified()).ok()
    }

    /// Delete a chunk file. Returns whether a file was removed.
    pub fn remove(&self, id: ChunkId) -> io::Result<bool> {
        match fs::remove_file(self.file_path(id)) {
            Ok(()) => {
                trace!("Removed chunk file {}", id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Chunk ids with a file in the primary directory, ascending.
    pub fn chunk_files(&self) -> Vec<ChunkId> {
        let Ok(entries) = fs::read_dir(&self.primary) else {
            return Vec::new();
        };
        let mut ids: Vec<ChunkId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some(self.extension.as_str()) {
                    return None;
                }
                path.file_stem()?.to_str()?.parse::<ChunkId>().ok()
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    // ========== History ==========

    pub fn has_snapshot(&self, step: usize) -> bool {
        self.snapshot_dir(step).is_dir()
    }

    pub fn snapshot_contains(&self, id: ChunkId, step: usize) -> bool {
        self.snapshot_file(id, step).is_file()
    }

    /// Create the snapshot folder for `step`. Returns true if it was created.
    pub fn create_snapshot(&self, step: usize) -> io::Result<bool> {
        let dir = self.snapshot_dir(step);
        if dir.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&dir)?;
        Ok(true)
    }

    /// Remove the snapshot folder for `step` if it holds nothing.
    pub fn remove_snapshot_if_empty(&self, step: usize) -> io::Result<bool> {
        let dir = self.snapshot_dir(step);
        match fs::read_dir(&dir).map(|mut entries| entries.next().is_none()) {
            Ok(true) => {
                fs::remove_dir(&dir)?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move the chunk file into the snapshot for `step`.
    ///
    /// If the snapshot already holds this chunk, the primary copy is dropped
    /// instead (the snapshot version is the one valid at `step`). Returns true
    /// when a file was moved into the snapshot.
    pub fn archive(&self, id: ChunkId, step: usize) -> io::Result<bool> {
        let src = self.file_path(id);
        if !src.is_file() {
            return Ok(false);
        }
        if self.snapshot_contains(id, step) {
            fs::remove_file(&src)?;
            trace!("Chunk {} already archived in step {}, dropped primary copy", id, step);
            return Ok(false);
        }
        fs::create_dir_all(self.snapshot_dir(step))?;
        fs::rename(&src, self.snapshot_file(id, step))?;
        trace!("Archived chunk {} into step {}", id, step);
        Ok(true)
    }

    /// Copy the chunk file from the snapshot for `step` back into place.
    /// Returns false when the snapshot has no file for this chunk.
    pub fn restore(&self, id: ChunkId, step: usize) -> io::Result<bool> {
        let src = self.snapshot_file(id, step);
        if !src.is_file() {
            return Ok(false);
        }
        let tmp = self.primary.join(format!(".{}.restore", self.file_name(id)));
        if let Err(e) = fs::copy(&src, &tmp).and_then(|_| fs::rename(&tmp, self.file_path(id))) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        trace!("Restored chunk {} from step {}", id, step);
        Ok(true)
    }

    /// Numbered snapshot folders, natural numeric order ("2" before "10").
    /// Non-numeric entries are never reported (and so never deleted).
    pub fn history_steps(&self) -> Vec<usize> {
        let Ok(entries) = fs::read_dir(&self.history) else {
            return Vec::new();
        };
        let mut steps: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str()?.parse::<usize>().ok())
            .collect();
        steps.sort_unstable();
        steps
    }

    fn remove_snapshot(&self, step: usize) -> bool {
        match fs::remove_dir_all(self.snapshot_dir(step)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove history step {}: {}", step, e);
                false
            }
        }
    }

    /// Keep the `keep` most recent snapshots, oldest removed first.
    /// Returns the removed steps.
    pub fn prune_history(&self, keep: usize) -> Vec<usize> {
        let mut steps = self.history_steps();
        steps.sort_unstable_by_key(|&s| Reverse(s));
        let mut stale: Vec<usize> = steps.into_iter().skip(keep).collect();
        stale.sort_unstable();
        let removed: Vec<usize> = stale.into_iter().filter(|&s| self.remove_snapshot(s)).collect();
        if !removed.is_empty() {
            debug!("Pruned history steps {:?} (keep={})", removed, keep);
        }
        removed
    }

    /// Drop every snapshot numbered `>= step` (unreachable redo futures).
    pub fn remove_history_from(&self, step: usize) -> Vec<usize> {
        let removed: Vec<usize> = self
            .history_steps()
            .into_iter()
            .filter(|&s| s >= step)
            .filter(|&s| self.remove_snapshot(s))
            .collect();
        if !removed.is_empty() {
            debug!("Removed invalid history steps {:?}", removed);
        }
        removed
    }

    /// Session end. History never outlives the undo stack. The primary
    /// directory is kept for the next session of the document, unless it is
    /// empty, or holds no chunk while the document was never saved.
    pub fn teardown(&self, saved: bool) {
        if self.history.file_name().is_some_and(|n| n == HISTORY_DIR_NAME) {
            if let Err(e) = fs::remove_dir_all(&self.history) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove history dir {}: {}", self.history.display(), e);
                }
            }
        }
        let _ = fs::remove_file(self.scene_path());

        let is_empty = fs::read_dir(&self.primary).map(|mut e| e.next().is_none()).unwrap_or(false);
        let disposable = is_empty || (!saved && self.chunk_files().is_empty());
        if disposable && self.check_identity_leaf() {
            match fs::remove_dir_all(&self.primary) {
                Ok(()) => {
                    info!("Removed preview cache {}", self.primary.display());
                    if let Some(doc_dir) = self.primary.parent() {
                        // Only succeeds when nothing else lives there
                        let _ = fs::remove_dir(doc_dir);
                    }
                }
                Err(e) => warn!("Failed to remove preview cache {}: {}", self.primary.display(), e),
            }
        } else {
            debug!("Keeping preview cache {} for next session", self.primary.display());
        }
    }

    fn check_identity_leaf(&self) -> bool {
        self.primary.file_name().is_some_and(|n| n == PREVIEW_DIR_NAME)
            && self.primary.parent().and_then(Path::file_name).is_some_and(|n| n == self.document_id.as_str())
    }
}
