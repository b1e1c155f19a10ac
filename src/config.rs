//! Preview configuration.
//!
//! `PreviewConfig` holds the process-wide knobs (chunk size, renderer, debounce)
//! and is handed to the scheduler explicitly so tests can vary it.
//! `DocumentSettings` holds what the document stores for itself: its id and the
//! `previewparameters` / `previewextension` pair chosen once and reused.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::PreviewError;

/// Frames per chunk used when nothing else is configured
pub const DEFAULT_CHUNK_SIZE: i32 = 25;
/// Debounce before a burst of edits triggers one render batch
pub const DEFAULT_DEBOUNCE_MS: u64 = 3000;
/// Number of numbered history snapshots kept on disk
pub const DEFAULT_HISTORY_KEEP: usize = 5;

/// Process-wide preview settings (persistent via preview.json)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Frames per chunk
    pub chunk_size: i32,
    /// Render engine executable
    pub renderer: PathBuf,
    /// Start rendering automatically after edits settle
    pub autopreview: bool,
    /// Render trigger debounce
    pub debounce_ms: u64,
    /// Snapshots kept in the history directory
    pub history_keep: usize,
    /// How often a running engine process is polled for exit
    pub poll_interval_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            renderer: PathBuf::from("melt"),
            autopreview: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            history_keep: DEFAULT_HISTORY_KEEP,
            poll_interval_ms: 10,
        }
    }
}

impl PreviewConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Load from JSON; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No preview config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read preview config: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse preview config: {}", path.display()))?;
        config.chunk_size = config.chunk_size.max(1);
        info!("Preview config loaded from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize preview config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write preview config: {}", path.display()))
    }
}

/// Per-document preview settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSettings {
    /// Unique document id; embedded in the cache path
    pub document_id: String,
    /// Document has a persisted location (was saved at least once)
    pub saved: bool,
    /// Space separated consumer parameters (`previewparameters`)
    pub preview_parameters: String,
    /// Chunk file extension (`previewextension`)
    pub preview_extension: String,
    /// Last time the document was saved
    pub last_saved: Option<SystemTime>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            document_id: Uuid::new_v4().simple().to_string(),
            saved: false,
            preview_parameters: "f=mp4 vcodec=libx264 crf=23 preset=veryfast g=1 bf=0".to_string(),
            preview_extension: "mp4".to_string(),
            last_saved: None,
        }
    }
}

impl DocumentSettings {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }

    /// Consumer parameters handed to the render engine.
    ///
    /// Frame-rate (`r=`) and frame-size (`s=`) overrides are stripped: the
    /// engine derives these from its own profile. Audio is disabled.
    pub fn consumer_params(&self) -> Result<Vec<String>, PreviewError> {
        if self.preview_extension.trim().is_empty() {
            return Err(PreviewError::MissingRenderParameters);
        }
        let mut params: Vec<String> = self
            .preview_parameters
            .split_whitespace()
            .filter(|p| !p.starts_with("r=") && !p.starts_with("s="))
            .map(str::to_string)
            .collect();
        if params.is_empty() {
            return Err(PreviewError::MissingRenderParameters);
        }
        if !params.iter().any(|p| p.starts_with("an=")) {
            params.push("an=1".to_string());
        }
        Ok(params)
    }

    pub fn extension(&self) -> &str {
        self.preview_extension.trim().trim_start_matches('.')
    }
}
