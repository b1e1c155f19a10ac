//! Preview cache notifications.

use std::path::PathBuf;

use crate::core::chunks::ChunkId;

// === Chunk state ===

/// The dirty set changed (once per operation, not per chunk)
#[derive(Clone, Debug)]
pub struct DirtyChunksChanged;

/// The rendered set changed (once per operation, not per chunk)
#[derive(Clone, Debug)]
pub struct RenderedChunksChanged;

/// The chunk currently in flight changed; `None` when idle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingChanged {
    pub id: Option<ChunkId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRendered {
    pub id: ChunkId,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDirtied {
    pub ids: Vec<ChunkId>,
}

// === Batch ===

/// Batch progress in permille. -1 means the batch failed, 1000 that it ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderProgress {
    pub permille: i32,
}

/// Second consecutive failure of a chunk; the batch was aborted
#[derive(Clone, Debug)]
pub struct RenderFailed {
    pub chunk: ChunkId,
    pub log: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFinished {
    pub rendered: usize,
    pub aborted: bool,
}
