//! Keeps cached chunks in step with the document's undo stack.
//!
//! Snapshot folder `undo/<k>` holds chunk files rendered while the stack was
//! at index `k` (after `k` commands). On every move `from -> to` the chunks
//! touched by the commands in between are:
//! 1. archived into `undo/<from>` (moved, or dropped if already archived there)
//! 2. restored from `undo/<to>` when that snapshot has them, otherwise left
//!    without a file and marked dirty
//!
//! so the primary directory only ever shows renders that match the current
//! history state. Applying this to push/undo/redo makes any undo/redo walk
//! restore byte-identical files for as long as the snapshots survive pruning.

use std::collections::BTreeSet;

use log::{debug, trace, warn};

use crate::core::cache_store::CacheStore;
use crate::core::chunks::{ChunkId, ChunkSet};

/// Position in the host's linear undo stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryBinding {
    pub current_index: usize,
    pub stack_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A fresh command was pushed (stack length changed)
    NewAction { from: usize, to: usize },
    Undo { from: usize, to: usize },
    Redo { from: usize, to: usize },
    /// Index did not move
    Stay { at: usize },
}

impl Transition {
    fn endpoints(self) -> (usize, usize) {
        match self {
            Transition::NewAction { from, to } | Transition::Undo { from, to } | Transition::Redo { from, to } => {
                (from, to)
            }
            Transition::Stay { at } => (at, at),
        }
    }
}

impl HistoryBinding {
    pub fn new(current_index: usize, stack_count: usize) -> Self {
        Self { current_index, stack_count }
    }

    /// What moving to `(index, count)` means relative to the current position.
    pub fn classify(&self, index: usize, count: usize) -> Transition {
        let from = self.current_index;
        if count != self.stack_count {
            Transition::NewAction { from, to: index }
        } else if index < from {
            Transition::Undo { from, to: index }
        } else if index > from {
            Transition::Redo { from, to: index }
        } else {
            Transition::Stay { at: index }
        }
    }
}

/// What a history notification did to the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryOutcome {
    pub transition: Transition,
    /// Moved into the snapshot of the step being left
    pub archived: Vec<ChunkId>,
    /// Copied back from the arrival snapshot, now rendered
    pub restored: Vec<ChunkId>,
    /// Left without a file, now dirty
    pub dirtied: Vec<ChunkId>,
    /// Snapshot folders deleted by pruning or truncation
    pub pruned: Vec<usize>,
}

impl HistoryOutcome {
    fn new(transition: Transition) -> Self {
        Self {
            transition,
            archived: Vec::new(),
            restored: Vec::new(),
            dirtied: Vec::new(),
            pruned: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UndoArchive {
    binding: HistoryBinding,
    keep: usize,
}

impl UndoArchive {
    pub fn new(keep: usize) -> Self {
        Self { binding: HistoryBinding::default(), keep }
    }

    /// Align with the host stack without touching any file (document load).
    pub fn bind(&mut self, current_index: usize, stack_count: usize) {
        self.binding = HistoryBinding::new(current_index, stack_count);
    }

    pub fn binding(&self) -> HistoryBinding {
        self.binding
    }

    /// The undo stack moved to `current_index` (of `stack_count` commands).
    ///
    /// `touched` are the chunks affected by the commands between the old and
    /// the new index. The working chunk is never touched on disk (the engine
    /// is writing it); it is flagged stale and stays dirty.
    pub fn on_history_changed(
        &mut self,
        store: &CacheStore,
        chunks: &mut ChunkSet,
        current_index: usize,
        stack_count: usize,
        touched: &BTreeSet<ChunkId>,
    ) -> HistoryOutcome {
        let transition = self.binding.classify(current_index, stack_count);
        self.binding = HistoryBinding::new(current_index, stack_count);
        let mut outcome = HistoryOutcome::new(transition);
        debug!("History {:?}, {} touched chunks", transition, touched.len());

        let working = chunks.working();
        let (from, to) = transition.endpoints();

        if let Transition::NewAction { .. } = transition {
            // Whatever was archived at or above the new index belongs to a
            // branch that can no longer be reached
            outcome.pruned.extend(store.remove_history_from(to.max(from + 1)));
        }

        if from == to {
            for &id in touched {
                if Some(id) == working {
                    chunks.mark_dirty([id]);
                    continue;
                }
                if let Err(e) = store.remove(id) {
                    warn!("Failed to delete stale chunk {}: {}", id, e);
                }
                if chunks.contains(id) {
                    chunks.mark_dirty([id]);
                    outcome.dirtied.push(id);
                }
            }
            return outcome;
        }

        let created = match store.create_snapshot(from) {
            Ok(created) => created,
            Err(e) => {
                warn!("Failed to create history step {}: {}", from, e);
                false
            }
        };

        for &id in touched {
            if Some(id) == working {
                trace!("Chunk {} is rendering, left for the render loop", id);
                chunks.mark_dirty([id]);
                continue;
            }
            match store.archive(id, from) {
                Ok(true) => outcome.archived.push(id),
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to archive chunk {} into step {}: {}", id, from, e);
                    if let Err(e) = store.remove(id) {
                        warn!("Failed to delete chunk {}: {}", id, e);
                    }
                }
            }
            let known = chunks.contains(id);
            match store.restore(id, to) {
                Ok(true) => {
                    chunks.mark_dirty([id]);
                    chunks.mark_rendered(id);
                    outcome.restored.push(id);
                }
                Ok(false) => {
                    if known {
                        chunks.mark_dirty([id]);
                        outcome.dirtied.push(id);
                    }
                }
                Err(e) => {
                    warn!("Failed to restore chunk {} from step {}: {}", id, to, e);
                    if known {
                        chunks.mark_dirty([id]);
                        outcome.dirtied.push(id);
                    }
                }
            }
        }

        if created {
            match store.remove_snapshot_if_empty(from) {
                Ok(true) => trace!("No chunk archived for step {}, snapshot removed", from),
                Ok(false) => outcome.pruned.extend(store.prune_history(self.keep)),
                Err(e) => warn!("Failed to clean history step {}: {}", from, e),
            }
        }

        debug!(
            "History step {} -> {}: archived {:?}, restored {:?}, dirtied {:?}",
            from, to, outcome.archived, outcome.restored, outcome.dirtied
        );
        outcome
    }

    /// The host dropped its redo tail at `ix`: every snapshot `>= ix` is unreachable.
    pub fn on_history_index_invalidated(&mut self, store: &CacheStore, ix: usize) -> Vec<usize> {
        // The stack now ends at the current index; the next push is a new action
        self.binding.stack_count = self.binding.current_index.min(ix);
        store.remove_history_from(ix)
    }
}
