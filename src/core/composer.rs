//! Hidden preview tracks spliced into the host composition.
//!
//! The preview track sequences rendered chunk files at their timeline offsets
//! with blank gaps everywhere else. An optional overlay track carries an A/B
//! comparison clip list with its own lifecycle.
//!
//! Tracks only exist inside the host while connected. Detaching before a
//! save or export keeps them out of persisted projects; nothing about them
//! is persisted, so after a crash between `disconnect()` and `reconnect()`
//! the next session rebuilds them from the chunk lists (`load_chunks`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::core::chunks::ChunkId;

pub const PREVIEW_TRACK_ID: &str = "timeline_preview";
pub const OVERLAY_TRACK_ID: &str = "timeline_overlay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    /// Rendered chunk file played from its first frame
    Chunk { id: ChunkId, path: PathBuf, start: i32, length: i32 },
    Blank { start: i32, length: i32 },
}

impl Segment {
    pub fn start(&self) -> i32 {
        match self {
            Segment::Chunk { start, .. } | Segment::Blank { start, .. } => *start,
        }
    }

    pub fn length(&self) -> i32 {
        match self {
            Segment::Chunk { length, .. } | Segment::Blank { length, .. } => *length,
        }
    }
}

/// One hidden track as handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub id: String,
    pub segments: Vec<Segment>,
    /// Disabled tracks stay attached but are not played
    pub enabled: bool,
}

/// The composition hidden tracks are inserted into.
///
/// Implemented by the application owning the timeline; the composer never
/// touches user tracks.
pub trait CompositionHost: Send {
    /// Insert the track, or replace it if already present.
    fn attach(&mut self, track: &TrackState) -> Result<()>;
    /// Remove the track. Removing an absent track is not an error.
    fn detach(&mut self, track_id: &str) -> Result<()>;
}

/// Gap-filled segment list for `chunks` over `[0, length)`.
///
/// Chunks past `length` are dropped, the last one is cut at `length`.
/// Without a length the list ends with the last chunk.
pub fn compose_segments(chunks: &BTreeMap<ChunkId, PathBuf>, chunk_size: i32, length: Option<i32>) -> Vec<Segment> {
    let size = chunk_size.max(1);
    let end = length.unwrap_or_else(|| chunks.keys().next_back().map_or(0, |&id| id + size));
    let mut segments = Vec::new();
    let mut cursor = 0;
    for (&id, path) in chunks.range(0..end) {
        if id > cursor {
            segments.push(Segment::Blank { start: cursor, length: id - cursor });
        }
        let len = size.min(end - id);
        segments.push(Segment::Chunk { id, path: path.clone(), start: id, length: len });
        cursor = id + len;
    }
    if cursor < end {
        segments.push(Segment::Blank { start: cursor, length: end - cursor });
    }
    segments
}

pub struct PreviewTrackComposer {
    host: Box<dyn CompositionHost>,
    chunk_size: i32,
    length: Option<i32>,
    chunks: BTreeMap<ChunkId, PathBuf>,
    overlay: Option<Vec<Segment>>,
    built: bool,
    connected: bool,
    enabled: bool,
}

impl std::fmt::Debug for PreviewTrackComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewTrackComposer")
            .field("chunks", &self.chunks.len())
            .field("built", &self.built)
            .field("connected", &self.connected)
            .field("enabled", &self.enabled)
            .field("overlay", &self.overlay.is_some())
            .finish()
    }
}

impl PreviewTrackComposer {
    pub fn new(host: Box<dyn CompositionHost>, chunk_size: i32) -> Self {
        Self {
            host,
            chunk_size: chunk_size.max(1),
            length: None,
            chunks: BTreeMap::new(),
            overlay: None,
            built: false,
            connected: true,
            enabled: true,
        }
    }

    /// Timeline length in frames; trailing gap and truncation follow it.
    pub fn set_length(&mut self, frames: i32) {
        if self.length != Some(frames) {
            self.length = Some(frames.max(0));
            self.sync_preview();
        }
    }

    pub fn segments(&self) -> Vec<Segment> {
        compose_segments(&self.chunks, self.chunk_size, self.length)
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    pub fn has_preview_track(&self) -> bool {
        self.built
    }

    pub fn has_overlay_track(&self) -> bool {
        self.overlay.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hidden tracks currently present in the host.
    pub fn added_tracks(&self) -> usize {
        if !self.connected {
            return 0;
        }
        usize::from(self.built) + usize::from(self.overlay.is_some())
    }

    // ========== Preview track ==========

    pub fn build_preview_track(&mut self) -> Result<()> {
        if self.built {
            return Ok(());
        }
        self.built = true;
        if self.connected {
            self.host
                .attach(&self.preview_state())
                .context("Failed to insert preview track")?;
        }
        debug!("Preview track built ({} chunks)", self.chunks.len());
        Ok(())
    }

    /// Remove the preview track and forget every spliced chunk.
    pub fn delete_preview_track(&mut self) -> Result<()> {
        self.chunks.clear();
        if !self.built {
            return Ok(());
        }
        self.built = false;
        if self.connected {
            self.host.detach(PREVIEW_TRACK_ID).context("Failed to remove preview track")?;
        }
        debug!("Preview track deleted");
        Ok(())
    }

    /// Splice rendered chunks in. One host update for the whole batch.
    pub fn insert_chunks<I>(&mut self, chunks: I) -> bool
    where
        I: IntoIterator<Item = (ChunkId, PathBuf)>,
    {
        let mut changed = false;
        for (id, path) in chunks {
            changed |= self.chunks.insert(id, path.clone()) != Some(path);
        }
        if changed {
            self.sync_preview();
        }
        changed
    }

    /// Cut chunks out, leaving gaps. One host update for the whole batch.
    pub fn remove_chunks<I>(&mut self, ids: I) -> bool
    where
        I: IntoIterator<Item = ChunkId>,
    {
        let mut changed = false;
        for id in ids {
            changed |= self.chunks.remove(&id).is_some();
        }
        if changed {
            self.sync_preview();
        }
        changed
    }

    pub fn clear_chunks(&mut self) {
        if !self.chunks.is_empty() {
            self.chunks.clear();
            self.sync_preview();
        }
    }

    fn preview_state(&self) -> TrackState {
        TrackState {
            id: PREVIEW_TRACK_ID.to_string(),
            segments: self.segments(),
            enabled: self.enabled,
        }
    }

    fn overlay_state(&self) -> Option<TrackState> {
        self.overlay.as_ref().map(|segments| TrackState {
            id: OVERLAY_TRACK_ID.to_string(),
            segments: segments.clone(),
            enabled: self.enabled,
        })
    }

    fn sync_preview(&mut self) {
        if !(self.built && self.connected) {
            return;
        }
        let state = self.preview_state();
        trace!("Preview track now has {} segments", state.segments.len());
        if let Err(e) = self.host.attach(&state) {
            warn!("Failed to update preview track: {:#}", e);
        }
    }

    // ========== Overlay track ==========

    pub fn set_overlay_track(&mut self, segments: Vec<Segment>) -> Result<()> {
        self.overlay = Some(segments);
        if let (true, Some(state)) = (self.connected, self.overlay_state()) {
            self.host.attach(&state).context("Failed to insert overlay track")?;
        }
        Ok(())
    }

    pub fn remove_overlay_track(&mut self) -> Result<()> {
        if self.overlay.take().is_some() && self.connected {
            self.host.detach(OVERLAY_TRACK_ID).context("Failed to remove overlay track")?;
        }
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Detach every hidden track from the host (before save or export).
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        if self.overlay.is_some() {
            self.host.detach(OVERLAY_TRACK_ID).context("Failed to detach overlay track")?;
        }
        if self.built {
            self.host.detach(PREVIEW_TRACK_ID).context("Failed to detach preview track")?;
        }
        debug!("Preview tracks disconnected");
        Ok(())
    }

    /// Reattach after `disconnect()`, with the current chunk layout.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.connected = true;
        if self.built {
            self.host.attach(&self.preview_state()).context("Failed to reattach preview track")?;
        }
        if let Some(state) = self.overlay_state() {
            self.host.attach(&state).context("Failed to reattach overlay track")?;
        }
        debug!("Preview tracks reconnected");
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.set_enabled(true)
    }

    pub fn disable(&mut self) -> Result<()> {
        self.set_enabled(false)
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.enabled == enabled {
            return Ok(());
        }
        self.enabled = enabled;
        if !self.connected {
            return Ok(());
        }
        if self.built {
            self.host.attach(&self.preview_state())?;
        }
        if let Some(state) = self.overlay_state() {
            self.host.attach(&state)?;
        }
        Ok(())
    }
}

/// Host writing each hidden track as `<track id>.json` into a directory.
///
/// Used by the command line front end; the files live as long as the tracks
/// stay connected.
#[derive(Debug, Clone)]
pub struct PlaylistDirHost {
    dir: PathBuf,
}

impl PlaylistDirHost {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn track_path(&self, track_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", track_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CompositionHost for PlaylistDirHost {
    fn attach(&mut self, track: &TrackState) -> Result<()> {
        let path = self.track_path(&track.id);
        let json = serde_json::to_string_pretty(track).context("Failed to serialize track")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn detach(&mut self, track_id: &str) -> Result<()> {
        let path = self.track_path(track_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
