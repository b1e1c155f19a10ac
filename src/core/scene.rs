//! Scene descriptions handed to the render engine.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The composition being previewed.
pub trait SceneSource: Send + Sync {
    /// Timeline length in frames.
    fn duration(&self) -> i32;
    /// Write the current composition as a scene description at `target`.
    fn export_scene(&self, target: &Path) -> Result<()>;
}

/// Scene already serialized on disk; exporting copies it.
#[derive(Debug, Clone)]
pub struct FileScene {
    source: PathBuf,
    duration: i32,
}

impl FileScene {
    pub fn new(source: impl Into<PathBuf>, duration: i32) -> Self {
        Self { source: source.into(), duration: duration.max(0) }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl SceneSource for FileScene {
    fn duration(&self) -> i32 {
        self.duration
    }

    fn export_scene(&self, target: &Path) -> Result<()> {
        fs::copy(&self.source, target)
            .with_context(|| format!("Failed to export scene {} to {}", self.source.display(), target.display()))?;
        Ok(())
    }
}
