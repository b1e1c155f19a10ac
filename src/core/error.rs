//! Error types for the preview cache.
//!
//! Initialization errors disable previewing for the session. Render errors
//! are recovered locally (one requeue) before they surface here.

use std::path::PathBuf;

use crate::core::chunks::ChunkId;

#[derive(Debug)]
pub enum PreviewError {
    /// Cache directory could not be created.
    CacheRootUnavailable { path: PathBuf, source: std::io::Error },
    /// Directory identity check failed (wrong leaf name or foreign document).
    ForeignDirectory(PathBuf),
    /// Document id is empty or contains path tricks.
    InvalidDocumentId(String),
    /// No consumer parameters or output extension configured.
    MissingRenderParameters,
    /// Second consecutive failure of the same chunk; carries engine output.
    RenderFailed { chunk: ChunkId, log: String },
    /// Filesystem error on a specific path.
    Io { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for PreviewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewError::CacheRootUnavailable { path, source } => {
                write!(f, "Cannot create folder {}: {}", path.display(), source)
            }
            PreviewError::ForeignDirectory(path) => {
                write!(f, "Something is wrong with cache folder {}", path.display())
            }
            PreviewError::InvalidDocumentId(id) => {
                write!(f, "Wrong document ID '{}', cannot create cache folder", id)
            }
            PreviewError::MissingRenderParameters => write!(f, "Invalid timeline preview parameters"),
            PreviewError::RenderFailed { chunk, log } => {
                write!(f, "Preview rendering failed at chunk {}: {}", chunk, log)
            }
            PreviewError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for PreviewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PreviewError::CacheRootUnavailable { source, .. } | PreviewError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl PreviewError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PreviewError::Io { path: path.into(), source }
    }

    /// Initialization errors are fatal for the session's preview feature.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            PreviewError::CacheRootUnavailable { .. }
                | PreviewError::ForeignDirectory(_)
                | PreviewError::InvalidDocumentId(_)
                | PreviewError::MissingRenderParameters
        )
    }
}

pub type Result<T, E = PreviewError> = std::result::Result<T, E>;
