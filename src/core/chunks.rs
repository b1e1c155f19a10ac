//! Chunk bookkeeping: which timeline chunks are rendered, dirty or in flight.
//!
//! A chunk is identified by its first frame. `rendered` and `dirty` are kept
//! disjoint; `working` (at most one id) is always a member of `dirty`.
//!
//! ChunkSet is plain data: it never notifies anyone. Callers batch their
//! mutations and emit one `DirtyChunksChanged` / `RenderedChunksChanged`
//! per logical operation.

use std::collections::BTreeSet;

/// Chunk identifier = first frame of the chunk.
pub type ChunkId = i32;

/// Quantize a frame to the start of the chunk containing it.
pub fn chunk_start(frame: i32, chunk_size: i32) -> ChunkId {
    let size = chunk_size.max(1);
    frame - frame.rem_euclid(size)
}

/// All chunk ids covering `[start_frame, end_frame]` (inclusive, quantized).
pub fn chunks_covering(start_frame: i32, end_frame: i32, chunk_size: i32) -> Vec<ChunkId> {
    let size = chunk_size.max(1);
    let (lo, hi) = if start_frame <= end_frame {
        (start_frame, end_frame)
    } else {
        (end_frame, start_frame)
    };
    let first = chunk_start(lo.max(0), size);
    let last = chunk_start(hi.max(0), size);
    (first..=last).step_by(size as usize).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSet {
    rendered: BTreeSet<ChunkId>,
    dirty: BTreeSet<ChunkId>,
    working: Option<ChunkId>,
    /// Working chunk was invalidated while rendering; its output must be discarded.
    working_stale: bool,
}

impl ChunkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move ids into `dirty`. Returns the ids whose state actually changed.
    ///
    /// Does not touch `working`, but a working id hit by this call is flagged
    /// stale so the render loop drops its output.
    pub fn mark_dirty<I>(&mut self, ids: I) -> Vec<ChunkId>
    where
        I: IntoIterator<Item = ChunkId>,
    {
        let mut changed = Vec::new();
        for id in ids {
            self.rendered.remove(&id);
            if self.dirty.insert(id) {
                changed.push(id);
            }
            if self.working == Some(id) {
                self.working_stale = true;
            }
        }
        changed
    }

    /// Record a finished chunk. Returns false when the id was neither dirty
    /// nor working (nothing is changed in that case).
    pub fn mark_rendered(&mut self, id: ChunkId) -> bool {
        let was_working = self.working == Some(id);
        if !self.dirty.remove(&id) && !was_working {
            return false;
        }
        self.rendered.insert(id);
        if was_working {
            self.working = None;
            self.working_stale = false;
        }
        true
    }

    /// Render failed or was aborted: the id stays dirty, `working` is cleared.
    pub fn requeue(&mut self, id: ChunkId) {
        self.rendered.remove(&id);
        self.dirty.insert(id);
        if self.working == Some(id) {
            self.working = None;
            self.working_stale = false;
        }
    }

    /// Forget ids entirely (range revoked or cache wiped).
    pub fn clear<I>(&mut self, ids: I) -> bool
    where
        I: IntoIterator<Item = ChunkId>,
    {
        let mut changed = false;
        for id in ids {
            changed |= self.rendered.remove(&id);
            changed |= self.dirty.remove(&id);
            if self.working == Some(id) {
                self.working = None;
                self.working_stale = false;
            }
        }
        changed
    }

    /// Forget everything.
    pub fn clear_all(&mut self) {
        self.rendered.clear();
        self.dirty.clear();
        self.working = None;
        self.working_stale = false;
    }

    /// Pick `id` as the chunk being rendered. It must be dirty.
    pub fn set_working(&mut self, id: ChunkId) -> bool {
        if !self.dirty.contains(&id) {
            return false;
        }
        self.working = Some(id);
        self.working_stale = false;
        true
    }

    /// Drop the working marker without changing membership.
    pub fn clear_working(&mut self) -> Option<ChunkId> {
        self.working_stale = false;
        self.working.take()
    }

    pub fn working(&self) -> Option<ChunkId> {
        self.working
    }

    pub fn is_working_stale(&self) -> bool {
        self.working.is_some() && self.working_stale
    }

    /// Smallest dirty id `>= from` accepted by `eligible`.
    pub fn next_dirty(&self, from: ChunkId, eligible: impl Fn(ChunkId) -> bool) -> Option<ChunkId> {
        self.dirty.range(from..).copied().find(|&id| eligible(id))
    }

    pub fn is_dirty(&self, id: ChunkId) -> bool {
        self.dirty.contains(&id)
    }

    pub fn is_rendered(&self, id: ChunkId) -> bool {
        self.rendered.contains(&id)
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.is_dirty(id) || self.is_rendered(id)
    }

    pub fn rendered(&self) -> &BTreeSet<ChunkId> {
        &self.rendered
    }

    pub fn dirty(&self) -> &BTreeSet<ChunkId> {
        &self.dirty
    }

    pub fn rendered_ids(&self) -> Vec<ChunkId> {
        self.rendered.iter().copied().collect()
    }

    pub fn dirty_ids(&self) -> Vec<ChunkId> {
        self.dirty.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty() && self.dirty.is_empty()
    }

    /// `rendered ∩ dirty = ∅` and `working ∈ dirty`.
    pub fn is_consistent(&self) -> bool {
        self.rendered.is_disjoint(&self.dirty)
            && self.working.is_none_or(|id| self.dirty.contains(&id))
    }
}
