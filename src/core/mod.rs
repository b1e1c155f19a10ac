//! Core preview cache modules - chunk bookkeeping, cache directory, render
//! jobs, scheduling, undo archival and track composition.
//!
//! Independent of any front end; the CLI in `main.rs` is one host.

pub mod cache_store;
pub mod chunks;
pub mod composer;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod render_job;
pub mod scene;
pub mod scheduler;
pub mod undo_archive;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use cache_store::CacheStore;
pub use chunks::{ChunkId, ChunkSet};
pub use composer::{CompositionHost, PlaylistDirHost, PreviewTrackComposer, Segment, TrackState};
pub use engine::{ProcessEngine, RenderEngine};
pub use error::PreviewError;
pub use event_bus::EventBus;
pub use render_job::{JobOutcome, RenderJob, RenderJobRunner};
pub use scene::{FileScene, SceneSource};
pub use scheduler::PreviewScheduler;
pub use undo_archive::{HistoryOutcome, Transition, UndoArchive};
