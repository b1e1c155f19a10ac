//! Preview scheduler - drains dirty chunks through the render engine.
//!
//! Foreground calls (`invalidate`, `add_preview_range`, history notifications)
//! only mutate state under one mutex and return. A single `preview-render`
//! thread renders dirty chunks one at a time in ascending order; a debounced
//! trigger thread starts it once edits settle.
//!
//! Invalidated chunks are remembered as *pending* until the host reports the
//! history step that caused them, so their old renders can be archived. The
//! render loop skips pending chunks; a render start without a history step
//! in between drops their files instead.
//!
//! Notifications are collected while the state is locked and emitted after
//! unlocking, one `DirtyChunksChanged` / `RenderedChunksChanged` per operation.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::SystemTime;

use log::{debug, error, info, trace, warn};
use once_cell::sync::OnceCell;

use crate::config::{DocumentSettings, PreviewConfig};
use crate::core::cache_store::CacheStore;
use crate::core::chunks::{ChunkId, ChunkSet, chunks_covering};
use crate::core::composer::{CompositionHost, PreviewTrackComposer, Segment};
use crate::core::debounce::RenderTrigger;
use crate::core::engine::RenderEngine;
use crate::core::error::{PreviewError, Result};
use crate::core::event_bus::EventBus;
use crate::core::events::{
    BatchFinished, ChunkDirtied, ChunkRendered, DirtyChunksChanged, RenderFailed, RenderProgress,
    RenderedChunksChanged, WorkingChanged,
};
use crate::core::render_job::{JobOutcome, RenderJob, RenderJobRunner};
use crate::core::scene::SceneSource;
use crate::core::undo_archive::{HistoryOutcome, UndoArchive};

/// Failures of one chunk within a batch that abort the batch
const MAX_CHUNK_FAILURES: u32 = 2;

enum Notice {
    Working(Option<ChunkId>),
    Rendered(ChunkId, PathBuf),
    Dirtied(Vec<ChunkId>),
    Progress(i32),
    Failed(ChunkId, String),
    Finished { rendered: usize, aborted: bool },
}

/// Notifications gathered under the state lock.
#[derive(Default)]
struct Notices {
    dirty_changed: bool,
    rendered_changed: bool,
    events: Vec<Notice>,
}

impl Notices {
    fn dirty(&mut self) {
        self.dirty_changed = true;
    }

    fn rendered(&mut self) {
        self.rendered_changed = true;
    }

    fn push(&mut self, notice: Notice) {
        self.events.push(notice);
    }

    fn emit(self, bus: &EventBus) {
        let mut tail = Vec::new();
        for notice in self.events {
            match notice {
                Notice::Working(id) => bus.emit(WorkingChanged { id }),
                Notice::Rendered(id, path) => bus.emit(ChunkRendered { id, path }),
                Notice::Dirtied(ids) => bus.emit(ChunkDirtied { ids }),
                other => tail.push(other),
            }
        }
        if self.dirty_changed {
            bus.emit(DirtyChunksChanged);
        }
        if self.rendered_changed {
            bus.emit(RenderedChunksChanged);
        }
        for notice in tail {
            match notice {
                Notice::Progress(permille) => bus.emit(RenderProgress { permille }),
                Notice::Failed(chunk, log) => bus.emit(RenderFailed { chunk, log }),
                Notice::Finished { rendered, aborted } => bus.emit(BatchFinished { rendered, aborted }),
                _ => {}
            }
        }
    }
}

struct State {
    chunks: ChunkSet,
    /// Invalidated, waiting for the history step that caused it
    pending: BTreeSet<ChunkId>,
    archive: UndoArchive,
    composer: PreviewTrackComposer,
    batch_active: bool,
    /// Render threads spawned and not yet exited
    live_threads: usize,
    /// Ids of the live render threads that have started running
    render_threads: Vec<ThreadId>,
    /// Bumped on every invalidation; the batch re-exports the scene when it moves
    generation: u64,
    last_failure: Option<(ChunkId, String)>,
}

/// Per-batch bookkeeping owned by the render thread
struct Batch {
    cursor: ChunkId,
    processed: usize,
    rendered: usize,
    exported: Option<u64>,
    failures: HashMap<ChunkId, u32>,
}

enum Step {
    Finished { aborted: bool },
    /// File already on disk, accepted without rendering
    Accepted,
    Render { job: RenderJob, export: bool, base: i32, total: usize },
}

struct Inner {
    config: PreviewConfig,
    saved: bool,
    params: Vec<String>,
    store: CacheStore,
    runner: RenderJobRunner,
    scene: Arc<dyn SceneSource>,
    bus: EventBus,
    state: Mutex<State>,
    /// Signalled whenever a render thread exits
    idle: Condvar,
    task: Mutex<Option<JoinHandle<()>>>,
    batch_abort: AtomicBool,
    trigger: OnceCell<RenderTrigger>,
}

/// Owns the preview cache of one document.
///
/// Dropping it stops the trigger, aborts rendering (blocking), detaches the
/// hidden tracks and tears the cache directory down.
pub struct PreviewScheduler {
    inner: Arc<Inner>,
    trigger_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PreviewScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PreviewScheduler")
            .field("cache", &self.inner.store.primary_dir())
            .field("rendered", &state.chunks.rendered().len())
            .field("dirty", &state.chunks.dirty().len())
            .field("working", &state.chunks.working())
            .field("batch_active", &state.batch_active)
            .finish()
    }
}

impl PreviewScheduler {
    /// Open the cache of `document` under `cache_root` and spawn the trigger thread.
    ///
    /// Any error here is an initialization error: previewing stays off.
    pub fn new(
        config: PreviewConfig,
        document: &DocumentSettings,
        cache_root: &Path,
        engine: Arc<dyn RenderEngine>,
        scene: Arc<dyn SceneSource>,
        host: Box<dyn CompositionHost>,
        bus: EventBus,
    ) -> Result<Self> {
        let params = document.consumer_params()?;
        let store = CacheStore::open(cache_root, &document.document_id, document.extension())?;
        let runner = RenderJobRunner::new(engine, config.renderer.clone(), config.poll_interval());

        let mut composer = PreviewTrackComposer::new(host, config.chunk_size);
        composer.set_length(scene.duration());
        if let Err(e) = composer.build_preview_track() {
            warn!("{:#}", e);
        }

        let state = State {
            chunks: ChunkSet::new(),
            pending: BTreeSet::new(),
            archive: UndoArchive::new(config.history_keep),
            composer,
            batch_active: false,
            live_threads: 0,
            render_threads: Vec::new(),
            generation: 0,
            last_failure: None,
        };
        let debounce = config.debounce();
        let inner = Arc::new(Inner {
            config,
            saved: document.saved,
            params,
            store,
            runner,
            scene,
            bus,
            state: Mutex::new(state),
            idle: Condvar::new(),
            task: Mutex::new(None),
            batch_abort: AtomicBool::new(false),
            trigger: OnceCell::new(),
        });

        let weak = Arc::downgrade(&inner);
        let (trigger, handle) = RenderTrigger::spawn(debounce, move || {
            if let Some(inner) = weak.upgrade() {
                inner.start_render();
            }
        })
        .map_err(|e| PreviewError::io(inner.store.primary_dir(), e))?;
        let _ = inner.trigger.set(trigger);

        info!(
            "Timeline preview ready: {} (chunk size {}, renderer {})",
            inner.store.primary_dir().display(),
            inner.config.chunk_size,
            inner.config.renderer.display()
        );
        Ok(Self { inner, trigger_thread: Some(handle) })
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    // ========== Timeline edits ==========

    /// An edit changed frames `[start_frame, end_frame]`.
    ///
    /// Covered chunks are cut from the preview track at once and marked dirty.
    /// A chunk being rendered keeps rendering; its output will be dropped.
    pub fn invalidate(&self, start_frame: i32, end_frame: i32) {
        let ids = chunks_covering(start_frame, end_frame, self.inner.config.chunk_size);
        let mut notices = Notices::default();
        let arm = {
            let mut st = self.inner.lock();
            let had_rendered = ids.iter().any(|id| st.chunks.is_rendered(*id));
            let changed = st.chunks.mark_dirty(ids.iter().copied());
            st.composer.remove_chunks(ids.iter().copied());
            st.pending.extend(ids.iter().copied());
            st.generation += 1;
            if had_rendered {
                notices.rendered();
            }
            if !changed.is_empty() {
                notices.dirty();
                notices.push(Notice::Dirtied(changed));
            }
            trace!("Invalidated frames {}-{}: chunks {:?}", start_frame, end_frame, ids);
            self.inner.config.autopreview || self.inner.trigger_pending()
        };
        notices.emit(&self.inner.bus);
        if arm {
            self.inner.arm_trigger();
        }
    }

    /// Request (`add`) or revoke caching for frames `[start_frame, end_frame]`.
    ///
    /// Revoking a range that holds the chunk in flight aborts the batch first,
    /// then deletes the revoked files; rendering resumes after the debounce.
    pub fn add_preview_range(&self, start_frame: i32, end_frame: i32, add: bool) {
        let ids = chunks_covering(start_frame, end_frame, self.inner.config.chunk_size);
        let mut notices = Notices::default();

        if add {
            let arm = {
                let mut st = self.inner.lock();
                let fresh: Vec<ChunkId> = ids.into_iter().filter(|id| !st.chunks.contains(*id)).collect();
                let changed = st.chunks.mark_dirty(fresh);
                if !changed.is_empty() {
                    debug!("Preview range extended by {} chunks", changed.len());
                    notices.dirty();
                    notices.push(Notice::Dirtied(changed));
                }
                self.inner.config.autopreview && !st.batch_active
            };
            notices.emit(&self.inner.bus);
            if arm {
                self.inner.arm_trigger();
            }
            return;
        }

        let revokes_working = {
            let st = self.inner.lock();
            st.chunks.working().is_some_and(|w| ids.contains(&w))
        };
        if revokes_working {
            self.inner.abort_rendering();
        }
        let resume = {
            let mut st = self.inner.lock();
            let mut had_rendered = false;
            let mut had_dirty = false;
            for &id in &ids {
                if st.chunks.is_rendered(id) {
                    had_rendered = true;
                    if let Err(e) = self.inner.store.remove(id) {
                        warn!("Failed to delete chunk {}: {}", id, e);
                    }
                } else if st.chunks.is_dirty(id) {
                    had_dirty = true;
                }
                st.pending.remove(&id);
            }
            st.composer.remove_chunks(ids.iter().copied());
            st.chunks.clear(ids.iter().copied());
            if had_rendered {
                notices.rendered();
            }
            if had_dirty {
                notices.dirty();
            }
            debug!("Preview range revoked: {:?}", ids);
            (revokes_working || self.inner.config.autopreview) && !st.chunks.dirty().is_empty()
        };
        notices.emit(&self.inner.bus);
        if resume {
            self.inner.arm_trigger();
        }
    }

    /// Drop every rendered chunk. With `reset_zones` the preview range is
    /// forgotten too, otherwise the rendered chunks become dirty.
    pub fn clear_preview_range(&self, reset_zones: bool) {
        if let Some(t) = self.inner.trigger.get() {
            t.cancel();
        }
        self.inner.abort_rendering();
        let mut notices = Notices::default();
        {
            let mut st = self.inner.lock();
            let rendered = st.chunks.rendered_ids();
            for &id in &rendered {
                if let Err(e) = self.inner.store.remove(id) {
                    warn!("Failed to delete chunk {}: {}", id, e);
                }
            }
            st.composer.clear_chunks();
            st.pending.clear();
            if reset_zones {
                st.chunks.clear_all();
            } else {
                st.chunks.mark_dirty(rendered.iter().copied());
            }
            notices.rendered();
            notices.dirty();
            info!("Preview cleared ({} rendered chunks deleted, reset zones: {})", rendered.len(), reset_zones);
        }
        notices.emit(&self.inner.bus);
    }

    // ========== Rendering ==========

    /// Start a render batch now (the debounce trigger calls this too).
    ///
    /// With nothing requested yet the whole timeline becomes the preview
    /// range. If a batch is already running, new dirty chunks are merged into it.
    pub fn start_render(&self) {
        self.inner.start_render();
    }

    /// Abort the batch and block until the render thread has exited.
    pub fn abort_rendering(&self) {
        self.inner.abort_rendering();
    }

    /// Block until no render thread is left (batches finish on their own).
    ///
    /// Returns at once when called from the render thread.
    pub fn wait_idle(&self) {
        let st = self.inner.lock();
        if st.render_threads.contains(&thread::current().id()) {
            return;
        }
        drop(self.inner.wait_for_threads(st));
    }

    pub fn is_rendering(&self) -> bool {
        self.inner.lock().batch_active
    }

    /// Failure that aborted the last batch, if any. Cleared when read.
    pub fn take_failure(&self) -> Option<PreviewError> {
        self.inner
            .lock()
            .last_failure
            .take()
            .map(|(chunk, log)| PreviewError::RenderFailed { chunk, log })
    }

    // ========== History ==========

    /// Align with the document's undo stack (document load).
    pub fn bind_history(&self, current_index: usize, stack_count: usize) {
        self.inner.lock().archive.bind(current_index, stack_count);
    }

    /// The undo stack moved (push, undo or redo). Chunks invalidated since the
    /// last notification are archived under the step being left and restored
    /// from the step arrived at.
    pub fn on_history_changed(&self, current_index: usize, stack_count: usize) -> HistoryOutcome {
        let mut notices = Notices::default();
        let (outcome, arm) = {
            let mut st = self.inner.lock();
            let touched = std::mem::take(&mut st.pending);
            let st = &mut *st;
            let outcome =
                st.archive.on_history_changed(&self.inner.store, &mut st.chunks, current_index, stack_count, &touched);

            if !outcome.dirtied.is_empty() {
                st.composer.remove_chunks(outcome.dirtied.iter().copied());
                notices.dirty();
                notices.push(Notice::Dirtied(outcome.dirtied.clone()));
            }
            if !outcome.restored.is_empty() {
                let store = &self.inner.store;
                st.composer.insert_chunks(outcome.restored.iter().map(|&id| (id, store.file_path(id))));
                for &id in &outcome.restored {
                    notices.push(Notice::Rendered(id, store.file_path(id)));
                }
                notices.rendered();
                notices.dirty();
            }
            let arm = !st.chunks.dirty().is_empty()
                && (self.inner.config.autopreview || st.batch_active || self.inner.trigger_pending());
            (outcome, arm)
        };
        notices.emit(&self.inner.bus);
        if arm {
            self.inner.arm_trigger();
        }
        outcome
    }

    /// The host dropped its redo tail at `ix`.
    pub fn on_history_index_invalidated(&self, ix: usize) -> Vec<usize> {
        let mut st = self.inner.lock();
        st.archive.on_history_index_invalidated(&self.inner.store, ix)
    }

    // ========== Persistence ==========

    /// Restore chunk lists saved with the document.
    ///
    /// Rendered chunks whose file is missing, or older than
    /// `document_timestamp`, become dirty (stale files are deleted). Empty
    /// lists mean "what is currently known".
    pub fn load_chunks(&self, rendered: &[ChunkId], dirty: &[ChunkId], document_timestamp: Option<SystemTime>) {
        let mut notices = Notices::default();
        {
            let mut st = self.inner.lock();
            let rendered = if rendered.is_empty() { st.chunks.rendered_ids() } else { rendered.to_vec() };
            let mut dirty = if dirty.is_empty() { st.chunks.dirty_ids() } else { dirty.to_vec() };
            let mut accepted = Vec::new();

            for id in rendered {
                if !self.inner.store.exists(id) {
                    dirty.push(id);
                    continue;
                }
                let stale = match (document_timestamp, self.inner.store.modified(id)) {
                    (Some(doc), Some(file)) => file < doc,
                    _ => false,
                };
                if stale {
                    debug!("Chunk {} predates the document, deleting", id);
                    if let Err(e) = self.inner.store.remove(id) {
                        warn!("Failed to delete stale chunk {}: {}", id, e);
                    }
                    dirty.push(id);
                } else {
                    accepted.push(id);
                }
            }

            for &id in &accepted {
                st.chunks.mark_dirty([id]);
                st.chunks.mark_rendered(id);
            }
            let dirty: Vec<ChunkId> = dirty.into_iter().filter(|id| !accepted.contains(id)).collect();
            let changed = st.chunks.mark_dirty(dirty);
            let store = &self.inner.store;
            st.composer.insert_chunks(accepted.iter().map(|&id| (id, store.file_path(id))));

            if !accepted.is_empty() {
                notices.rendered();
            }
            if !changed.is_empty() {
                notices.dirty();
            }
            info!("Loaded {} rendered and {} dirty chunks", accepted.len(), st.chunks.dirty().len());
        }
        notices.emit(&self.inner.bus);
    }

    /// Rendered and dirty ids as strings, ascending, for saving with the document.
    pub fn preview_chunks(&self) -> (Vec<String>, Vec<String>) {
        let st = self.inner.lock();
        let to_strings = |ids: Vec<ChunkId>| ids.into_iter().map(|id| id.to_string()).collect();
        (to_strings(st.chunks.rendered_ids()), to_strings(st.chunks.dirty_ids()))
    }

    pub fn rendered_chunks(&self) -> Vec<ChunkId> {
        self.inner.lock().chunks.rendered_ids()
    }

    pub fn dirty_chunks(&self) -> Vec<ChunkId> {
        self.inner.lock().chunks.dirty_ids()
    }

    pub fn working_chunk(&self) -> Option<ChunkId> {
        self.inner.lock().chunks.working()
    }

    /// Snapshot of the chunk bookkeeping.
    pub fn chunk_set(&self) -> ChunkSet {
        self.inner.lock().chunks.clone()
    }

    // ========== Preview tracks ==========

    pub fn build_preview_track(&self) -> anyhow::Result<()> {
        let mut st = self.inner.lock();
        st.composer.set_length(self.inner.scene.duration());
        st.composer.build_preview_track()?;
        let store = &self.inner.store;
        let rendered = st.chunks.rendered_ids();
        st.composer.insert_chunks(rendered.into_iter().map(|id| (id, store.file_path(id))));
        Ok(())
    }

    pub fn delete_preview_track(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.delete_preview_track()
    }

    pub fn has_preview_track(&self) -> bool {
        self.inner.lock().composer.has_preview_track()
    }

    pub fn set_overlay_track(&self, segments: Vec<Segment>) -> anyhow::Result<()> {
        self.inner.lock().composer.set_overlay_track(segments)
    }

    pub fn remove_overlay_track(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.remove_overlay_track()
    }

    pub fn has_overlay_track(&self) -> bool {
        self.inner.lock().composer.has_overlay_track()
    }

    pub fn added_tracks(&self) -> usize {
        self.inner.lock().composer.added_tracks()
    }

    /// Detach the hidden tracks before saving or exporting the composition.
    pub fn disconnect(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.disconnect()
    }

    pub fn reconnect(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.reconnect()
    }

    pub fn enable(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.enable()
    }

    pub fn disable(&self) -> anyhow::Result<()> {
        self.inner.lock().composer.disable()
    }
}

impl Drop for PreviewScheduler {
    fn drop(&mut self) {
        if let Some(trigger) = self.inner.trigger.get() {
            trigger.shutdown();
        }
        if let Some(handle) = self.trigger_thread.take() {
            let _ = handle.join();
        }
        self.inner.abort_rendering();
        let handle = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Preview render thread panicked");
            }
        }
        {
            let mut st = self.inner.lock();
            // Left on disk they would pass for valid renders next session
            self.inner.purge_pending(&mut st);
            if let Err(e) = st.composer.disconnect() {
                warn!("{:#}", e);
            }
        }
        self.inner.store.teardown(self.inner.saved);
        debug!("Preview scheduler closed");
    }
}

/// Deregisters the render thread once it is done, panicking or not.
struct LiveThread<'a>(&'a Inner);

impl Drop for LiveThread<'_> {
    fn drop(&mut self) {
        let mut st = self.0.lock();
        let id = thread::current().id();
        st.render_threads.retain(|t| *t != id);
        st.live_threads = st.live_threads.saturating_sub(1);
        if thread::panicking() {
            st.batch_active = false;
            let _ = st.chunks.clear_working();
        }
        self.0.idle.notify_all();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm_trigger(&self) {
        if let Some(trigger) = self.trigger.get() {
            trigger.schedule();
        }
    }

    fn wait_for_threads<'a>(&self, st: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.idle.wait_while(st, |st| st.live_threads > 0).unwrap_or_else(|e| e.into_inner())
    }

    fn trigger_pending(&self) -> bool {
        self.trigger.get().is_some_and(RenderTrigger::is_pending)
    }

    /// Invalidations never followed by a history step: their files are stale.
    fn purge_pending(&self, st: &mut State) {
        let working = st.chunks.working();
        for id in std::mem::take(&mut st.pending) {
            if Some(id) == working {
                continue;
            }
            match self.store.remove(id) {
                Ok(true) => trace!("Dropped stale chunk {}", id),
                Ok(false) => {}
                Err(e) => warn!("Failed to delete stale chunk {}: {}", id, e),
            }
        }
    }

    fn start_render(self: &Arc<Self>) {
        let duration = self.scene.duration();
        let mut notices = Notices::default();
        let spawn = {
            let mut st = self.lock();
            self.purge_pending(&mut st);
            st.composer.set_length(duration);
            if st.chunks.is_empty() && duration > 0 {
                let ids = chunks_covering(0, duration - 1, self.config.chunk_size);
                debug!("Nothing requested yet, previewing the whole timeline ({} chunks)", ids.len());
                let changed = st.chunks.mark_dirty(ids);
                notices.dirty();
                notices.push(Notice::Dirtied(changed));
            }
            if st.batch_active {
                trace!("Render batch running, dirty chunks merged");
                false
            } else if st.chunks.dirty().is_empty() {
                trace!("Nothing to render");
                false
            } else {
                st.batch_active = true;
                st.live_threads += 1;
                st.last_failure = None;
                // Reset under the lock so an abort arriving from here on reaches the new thread
                self.batch_abort.store(false, Ordering::SeqCst);
                self.runner.clear_abort();
                true
            }
        };
        if spawn {
            if let Some(trigger) = self.trigger.get() {
                trigger.cancel();
            }
            self.spawn_batch();
        }
        // After spawning: a subscriber may abort, which waits for the new thread
        notices.emit(&self.bus);
    }

    fn spawn_batch(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("preview-render".into())
            .spawn(move || inner.run_batch());
        let old = match spawned {
            Ok(handle) => self.task.lock().unwrap_or_else(|e| e.into_inner()).replace(handle),
            Err(e) => {
                error!("Failed to spawn preview render thread: {}", e);
                let mut st = self.lock();
                st.batch_active = false;
                st.live_threads -= 1;
                self.idle.notify_all();
                return;
            }
        };
        // The previous batch flagged itself inactive and is exiting
        if let Some(old) = old {
            if old.thread().id() != thread::current().id() && old.join().is_err() {
                error!("Preview render thread panicked");
            }
        }
    }

    /// Stop the batch and block until every render thread has exited.
    fn abort_rendering(&self) {
        let st = self.lock();
        self.batch_abort.store(true, Ordering::SeqCst);
        self.runner.abort();
        if st.render_threads.contains(&thread::current().id()) {
            // Called from a notification on the render thread; it stops on its own
            return;
        }
        if st.live_threads > 0 {
            debug!("Aborting preview rendering");
            drop(self.wait_for_threads(st));
        }
    }

    fn run_batch(self: Arc<Self>) {
        self.lock().render_threads.push(thread::current().id());
        let _live = LiveThread(&self);
        self.run_steps();
    }

    fn run_steps(&self) {
        debug!("Preview render batch started");
        let mut batch = Batch {
            cursor: ChunkId::MIN,
            processed: 0,
            rendered: 0,
            exported: None,
            failures: HashMap::new(),
        };
        loop {
            let mut notices = Notices::default();
            let step = self.next_step(&mut batch, &mut notices);
            notices.emit(&self.bus);
            let (job, export, base, total) = match step {
                Step::Finished { aborted } => {
                    debug!("Preview render batch finished ({} rendered, aborted: {})", batch.rendered, aborted);
                    return;
                }
                Step::Accepted => continue,
                Step::Render { job, export, base, total } => (job, export, base, total),
            };

            let outcome = self.render(&job, export, base, total);
            let mut notices = Notices::default();
            let finished = self.settle(&mut batch, outcome, &mut notices);
            notices.emit(&self.bus);
            if finished {
                debug!("Preview render batch failed at chunk {}", job.chunk);
                return;
            }
        }
    }

    /// Pick the next chunk under the lock.
    fn next_step(&self, batch: &mut Batch, notices: &mut Notices) -> Step {
        let duration = self.scene.duration();
        let mut st = self.lock();
        if self.batch_abort.load(Ordering::SeqCst) {
            self.finish_batch(&mut st, batch, notices, false);
            return Step::Finished { aborted: true };
        }

        // Pending chunks wait for their history step; chunks past the end are skipped
        let pending = st.pending.clone();
        let eligible = move |id: ChunkId| !pending.contains(&id) && (duration <= 0 || id < duration);
        let next = st
            .chunks
            .next_dirty(batch.cursor, &eligible)
            .or_else(|| st.chunks.next_dirty(ChunkId::MIN, &eligible));
        let Some(id) = next else {
            self.finish_batch(&mut st, batch, notices, false);
            return Step::Finished { aborted: false };
        };

        let remaining = st.chunks.dirty().iter().filter(|&&d| eligible(d)).count();
        let total = batch.processed + remaining;
        let base = (1000 * batch.processed / total.max(1)) as i32;
        st.chunks.set_working(id);
        notices.push(Notice::Working(Some(id)));
        notices.push(Notice::Progress(base));

        if self.store.exists(id) {
            trace!("Chunk {} already on disk, no render needed", id);
            self.accept(&mut st, batch, id, notices);
            return Step::Accepted;
        }

        let export = batch.exported != Some(st.generation);
        batch.exported = Some(st.generation);
        trace!("Rendering chunk {} ({} remaining)", id, remaining);
        let job = RenderJob::for_chunk(
            id,
            self.config.chunk_size,
            &self.store.scene_path(),
            self.store.file_path(id),
            &self.params,
        );
        Step::Render { job, export, base, total }
    }

    /// Run one job outside the lock.
    fn render(&self, job: &RenderJob, export: bool, base: i32, total: usize) -> JobOutcome {
        if export {
            debug!("Exporting scene to {}", job.scene.display());
            if let Err(e) = self.scene.export_scene(&job.scene) {
                warn!("{:#}", e);
                return JobOutcome::Failed { chunk: job.chunk, log: format!("{:#}", e) };
            }
        }
        let share = total.max(1) as i32;
        let result = self.runner.run(job, |hint| {
            self.bus.emit(RenderProgress { permille: base + hint / share });
        });
        result.unwrap_or_else(|e| JobOutcome::Failed { chunk: job.chunk, log: e.to_string() })
    }

    /// Record a job outcome. Returns true when the batch is over.
    fn settle(&self, batch: &mut Batch, outcome: JobOutcome, notices: &mut Notices) -> bool {
        let mut st = self.lock();
        let id = outcome.chunk();
        let stale = st.chunks.working() != Some(id) || st.chunks.is_working_stale();
        if stale {
            // Invalidated or revoked while rendering: the output shows an old state
            if let Err(e) = self.store.remove(id) {
                warn!("Failed to delete outdated chunk {}: {}", id, e);
            }
            if st.chunks.working() == Some(id) {
                st.chunks.clear_working();
            }
            notices.push(Notice::Working(None));
            trace!("Chunk {} changed while rendering, output dropped", id);
            batch.cursor = id.saturating_add(1);
            return false;
        }

        match outcome {
            JobOutcome::Succeeded { .. } => {
                batch.failures.remove(&id);
                self.accept(&mut st, batch, id, notices);
                false
            }
            JobOutcome::Aborted { .. } => {
                st.chunks.requeue(id);
                notices.push(Notice::Working(None));
                false
            }
            JobOutcome::Failed { log, .. } => {
                st.chunks.requeue(id);
                notices.push(Notice::Working(None));
                let failures = batch.failures.entry(id).or_insert(0);
                *failures += 1;
                if *failures < MAX_CHUNK_FAILURES {
                    warn!("Rendering chunk {} failed, retrying", id);
                    batch.cursor = id;
                    return false;
                }
                error!("Rendering chunk {} failed again, aborting preview batch:\n{}", id, log);
                st.last_failure = Some((id, log.clone()));
                notices.push(Notice::Failed(id, log));
                notices.push(Notice::Progress(-1));
                self.finish_batch(&mut st, batch, notices, true);
                true
            }
        }
    }

    /// Working chunk has a complete file: splice it in.
    fn accept(&self, st: &mut State, batch: &mut Batch, id: ChunkId, notices: &mut Notices) {
        st.chunks.mark_rendered(id);
        let path = self.store.file_path(id);
        st.composer.insert_chunks([(id, path.clone())]);
        notices.push(Notice::Working(None));
        notices.push(Notice::Rendered(id, path));
        notices.rendered();
        notices.dirty();
        batch.processed += 1;
        batch.rendered += 1;
        batch.cursor = id.saturating_add(1);
    }

    fn finish_batch(&self, st: &mut State, batch: &Batch, notices: &mut Notices, failed: bool) {
        st.batch_active = false;
        if st.chunks.clear_working().is_some() {
            notices.push(Notice::Working(None));
        }
        let _ = std::fs::remove_file(self.store.scene_path());
        let aborted = failed || self.batch_abort.load(Ordering::SeqCst);
        if !failed {
            notices.push(Notice::Progress(1000));
        }
        notices.push(Notice::Finished { rendered: batch.rendered, aborted });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{Behavior, RecordingHost, ScriptedEngine, VersionedScene};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        engine: Arc<ScriptedEngine>,
        scene: Arc<VersionedScene>,
        host: RecordingHost,
        bus: EventBus,
        scheduler: PreviewScheduler,
    }

    fn config() -> PreviewConfig {
        PreviewConfig {
            chunk_size: 25,
            autopreview: false,
            debounce_ms: 60_000,
            poll_interval_ms: 1,
            ..PreviewConfig::default()
        }
    }

    fn fixture_with(config: PreviewConfig, behavior: Behavior, duration: i32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(ScriptedEngine::new(behavior));
        let scene = Arc::new(VersionedScene::new(duration));
        let host = RecordingHost::default();
        let bus = EventBus::new();
        let scheduler = PreviewScheduler::new(
            config,
            &DocumentSettings::new("1700000000000"),
            dir.path(),
            engine.clone(),
            scene.clone(),
            Box::new(host.clone()),
            bus.clone(),
        )
        .unwrap();
        Fixture { dir, engine, scene, host, bus, scheduler }
    }

    fn fixture(behavior: Behavior) -> Fixture {
        fixture_with(config(), behavior, 1000)
    }

    impl Fixture {
        fn render(&self) {
            self.scheduler.start_render();
            self.scheduler.wait_idle();
        }

        fn read(&self, id: ChunkId) -> Vec<u8> {
            fs::read(self.scheduler.store().file_path(id)).unwrap()
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn counter<E: std::any::Any + Send + Sync>(bus: &EventBus) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe::<E, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_invalidate_render_invalidate_scenario() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.invalidate(0, 40);
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);
        assert!(fx.scheduler.rendered_chunks().is_empty());

        fx.render();
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25]);
        assert!(fx.scheduler.dirty_chunks().is_empty());
        assert_eq!(fx.host.preview_chunks(), vec![0, 25]);

        fx.scheduler.invalidate(10, 15);
        assert_eq!(fx.scheduler.rendered_chunks(), vec![25]);
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0]);
        // Evicted from the preview track at once
        assert_eq!(fx.host.preview_chunks(), vec![25]);
        assert!(fx.scheduler.chunk_set().is_consistent());
    }

    #[test]
    fn test_render_in_ascending_order() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(100, 124, true);
        fx.scheduler.add_preview_range(0, 60, true);
        fx.render();
        assert_eq!(fx.engine.launched_chunks(), vec![0, 25, 50, 100]);
        let launches = fx.engine.launches();
        assert_eq!((launches[3].first_frame, launches[3].last_frame), (100, 124));
        assert!(launches.iter().all(|l| l.params.contains(&"an=1".to_string())));
    }

    #[test]
    fn test_existing_files_accepted_without_rendering() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 49, true);
        fs::write(fx.scheduler.store().file_path(0), b"from last session").unwrap();
        fs::write(fx.scheduler.store().file_path(25), b"from last session").unwrap();

        fx.render();
        assert!(fx.engine.launches().is_empty());
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25]);
        assert_eq!(fx.read(0), b"from last session");
    }

    #[test]
    fn test_single_failure_is_retried() {
        let fx = fixture(Behavior::Write);
        fx.engine.script(25, [Behavior::Fail]);
        fx.scheduler.add_preview_range(0, 74, true);
        fx.render();
        assert_eq!(fx.engine.launched_chunks(), vec![0, 25, 25, 50]);
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25, 50]);
        assert!(fx.scheduler.take_failure().is_none());
    }

    #[test]
    fn test_second_failure_aborts_batch() {
        let fx = fixture(Behavior::Write);
        fx.engine.script(25, [Behavior::Fail, Behavior::Fail]);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failures);
        fx.bus.subscribe::<RenderFailed, _>(move |e| f.lock().unwrap().push((e.chunk, e.log.clone())));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&progress);
        fx.bus.subscribe::<RenderProgress, _>(move |e| p.lock().unwrap().push(e.permille));

        fx.scheduler.add_preview_range(0, 74, true);
        fx.render();
        assert_eq!(fx.engine.launched_chunks(), vec![0, 25, 25]);
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0]);
        assert_eq!(fx.scheduler.dirty_chunks(), vec![25, 50]);
        assert!(!fx.scheduler.store().file_path(25).exists());

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 25);
        assert!(failures[0].1.contains("error decoding frame"));
        assert_eq!(progress.lock().unwrap().last(), Some(&-1));
        assert!(matches!(fx.scheduler.take_failure(), Some(PreviewError::RenderFailed { chunk: 25, .. })));
        assert!(fx.scheduler.take_failure().is_none());
    }

    #[test]
    fn test_always_failing_engine_leaves_chunks_dirty() {
        let fx = fixture(Behavior::Fail);
        fx.scheduler.invalidate(0, 40);
        fx.render();
        assert!(fx.scheduler.rendered_chunks().is_empty());
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);
        assert!(fx.scheduler.store().chunk_files().is_empty());
        assert!(!fx.scheduler.is_rendering());
        assert_eq!(fx.scheduler.working_chunk(), None);
    }

    #[test]
    fn test_abort_leaves_no_partial_file() {
        let fx = fixture(Behavior::BlockUntilKilled);
        fx.scheduler.add_preview_range(0, 49, true);
        fx.scheduler.start_render();
        let path = fx.scheduler.store().file_path(0);
        wait_until("partial output", || path.exists());
        assert_eq!(fx.scheduler.working_chunk(), Some(0));

        fx.scheduler.abort_rendering();
        assert!(!fx.scheduler.is_rendering());
        assert!(!path.exists());
        assert!(!fx.scheduler.store().exists(0));
        assert_eq!(fx.scheduler.working_chunk(), None);
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);

        // A later batch picks up where it stopped
        fx.engine.set_default(Behavior::Write);
        fx.render();
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25]);
    }

    #[test]
    fn test_one_notification_per_operation() {
        let fx = fixture(Behavior::Write);
        let dirty = counter::<DirtyChunksChanged>(&fx.bus);
        let rendered = counter::<RenderedChunksChanged>(&fx.bus);
        let dirtied = counter::<ChunkDirtied>(&fx.bus);

        fx.scheduler.invalidate(0, 249);
        assert_eq!(dirty.load(Ordering::SeqCst), 1);
        assert_eq!(rendered.load(Ordering::SeqCst), 0);
        assert_eq!(dirtied.load(Ordering::SeqCst), 1);

        fx.render();
        assert_eq!(fx.scheduler.rendered_chunks().len(), 10);
        let after_render = rendered.load(Ordering::SeqCst);
        assert_eq!(after_render, 10);

        let before = dirty.load(Ordering::SeqCst);
        fx.scheduler.invalidate(0, 249);
        assert_eq!(dirty.load(Ordering::SeqCst), before + 1);
        assert_eq!(rendered.load(Ordering::SeqCst), after_render + 1);
    }

    #[test]
    fn test_chunk_invalidated_while_rendering_is_rerendered() {
        let fx = fixture(Behavior::SlowWrite(Duration::from_millis(100)));
        fx.scheduler.add_preview_range(0, 10, true);
        fx.scheduler.start_render();
        wait_until("chunk 0 launched", || fx.engine.launches().len() == 1);

        fx.scene.edit();
        fx.scheduler.invalidate(0, 10);
        fx.scheduler.wait_idle();
        // Output rendered against the old scene was dropped
        assert!(fx.scheduler.rendered_chunks().is_empty());
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0]);
        assert!(!fx.scheduler.store().exists(0));

        fx.engine.set_default(Behavior::Write);
        fx.render();
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0]);
        let launches = fx.engine.launch_log();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].scene, "scene v0");
        assert_eq!(launches[1].scene, "scene v1");
        assert_eq!(fx.scene.export_count(), 2);
    }

    #[test]
    fn test_scene_exported_once_per_batch() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 99, true);
        fx.render();
        assert_eq!(fx.engine.launches().len(), 4);
        assert_eq!(fx.scene.export_count(), 1);
        // Scene description is removed when the batch ends
        assert!(!fx.scheduler.store().scene_path().exists());
    }

    #[test]
    fn test_start_render_promotes_whole_timeline() {
        let fx = fixture_with(config(), Behavior::Write, 60);
        fx.render();
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25, 50]);
    }

    #[test]
    fn test_debounce_coalesces_edit_burst() {
        let config = PreviewConfig { autopreview: true, debounce_ms: 30, ..config() };
        let fx = fixture_with(config, Behavior::Write, 1000);
        for frame in [0, 5, 10, 30, 40] {
            fx.scheduler.invalidate(frame, frame);
            thread::sleep(Duration::from_millis(2));
        }
        wait_until("batch to render", || fx.scheduler.rendered_chunks() == vec![0, 25]);
        fx.scheduler.wait_idle();
        assert_eq!(fx.engine.launched_chunks(), vec![0, 25]);
    }

    #[test]
    fn test_undo_redo_restores_renders() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 49, true);
        fx.render();
        let original = fx.read(0);

        // Edit A touches chunk 0
        fx.scheduler.invalidate(0, 10);
        let outcome = fx.scheduler.on_history_changed(1, 1);
        assert_eq!(outcome.archived, vec![0]);
        fx.render();
        let edited = fx.read(0);
        assert_ne!(original, edited);

        // Undo
        fx.scheduler.invalidate(0, 10);
        let outcome = fx.scheduler.on_history_changed(0, 1);
        assert_eq!(outcome.restored, vec![0]);
        assert_eq!(fx.read(0), original);
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25]);
        assert_eq!(fx.host.preview_chunks(), vec![0, 25]);

        // Redo
        fx.scheduler.invalidate(0, 10);
        fx.scheduler.on_history_changed(1, 1);
        assert_eq!(fx.read(0), edited);
        assert!(fx.scheduler.dirty_chunks().is_empty());
        // Restores never launch the engine
        assert_eq!(fx.engine.launches().len(), 3);
    }

    #[test]
    fn test_invalidate_without_history_step_drops_old_file() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 24, true);
        fx.render();
        let first = fx.read(0);
        fx.scheduler.invalidate(0, 0);
        assert!(fx.scheduler.store().exists(0));
        fx.render();
        assert_ne!(fx.read(0), first);
        assert_eq!(fx.engine.launches().len(), 2);
    }

    #[test]
    fn test_revoke_range() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 74, true);
        fx.render();
        fx.scheduler.add_preview_range(25, 49, false);
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 50]);
        assert!(!fx.scheduler.store().file_path(25).exists());
        assert_eq!(fx.host.preview_chunks(), vec![0, 50]);
    }

    #[test]
    fn test_revoke_range_aborts_chunk_in_flight() {
        let fx = fixture(Behavior::BlockUntilKilled);
        fx.scheduler.add_preview_range(0, 49, true);
        fx.scheduler.start_render();
        wait_until("chunk 0 in flight", || fx.scheduler.working_chunk() == Some(0));

        fx.scheduler.add_preview_range(0, 10, false);
        assert!(!fx.scheduler.is_rendering());
        assert!(!fx.scheduler.store().file_path(0).exists());
        assert_eq!(fx.scheduler.dirty_chunks(), vec![25]);
    }

    #[test]
    fn test_clear_preview_range() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 49, true);
        fx.render();

        fx.scheduler.clear_preview_range(false);
        assert!(fx.scheduler.rendered_chunks().is_empty());
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);
        assert!(fx.scheduler.store().chunk_files().is_empty());
        assert!(fx.host.preview_chunks().is_empty());

        fx.scheduler.clear_preview_range(true);
        assert!(fx.scheduler.dirty_chunks().is_empty());
    }

    #[test]
    fn test_load_chunks_checks_files() {
        let fx = fixture(Behavior::Write);
        let store = fx.scheduler.store();
        fs::write(store.file_path(0), b"fresh").unwrap();
        fs::write(store.file_path(25), b"stale").unwrap();
        let now = SystemTime::now();
        let old = now - Duration::from_secs(7200);
        fs::File::options().write(true).open(store.file_path(25)).unwrap().set_modified(old).unwrap();

        fx.scheduler
            .load_chunks(&[0, 25, 50], &[75], Some(now - Duration::from_secs(3600)));
        assert_eq!(fx.scheduler.rendered_chunks(), vec![0]);
        assert_eq!(fx.scheduler.dirty_chunks(), vec![25, 50, 75]);
        assert!(!store.file_path(25).exists());
        assert_eq!(fx.host.preview_chunks(), vec![0]);

        let (rendered, dirty) = fx.scheduler.preview_chunks();
        assert_eq!(rendered, vec!["0"]);
        assert_eq!(dirty, vec!["25", "50", "75"]);
    }

    #[test]
    fn test_tracks_detach_and_reattach() {
        let fx = fixture(Behavior::Write);
        fx.scheduler.add_preview_range(0, 24, true);
        fx.render();
        assert_eq!(fx.scheduler.added_tracks(), 1);

        fx.scheduler.disconnect().unwrap();
        assert_eq!(fx.scheduler.added_tracks(), 0);
        assert!(fx.host.track_ids().is_empty());
        fx.scheduler.reconnect().unwrap();
        assert_eq!(fx.host.preview_chunks(), vec![0]);

        fx.scheduler.set_overlay_track(vec![Segment::Blank { start: 0, length: 25 }]).unwrap();
        assert_eq!(fx.scheduler.added_tracks(), 2);
        fx.scheduler.remove_overlay_track().unwrap();
        fx.scheduler.delete_preview_track().unwrap();
        assert_eq!(fx.scheduler.added_tracks(), 0);
        fx.scheduler.build_preview_track().unwrap();
        assert_eq!(fx.host.preview_chunks(), vec![0]);
    }

    #[test]
    fn test_drop_tears_down_cache() {
        let fx = fixture(Behavior::Write);
        let primary = fx.scheduler.store().primary_dir().to_path_buf();
        fx.scheduler.add_preview_range(0, 24, true);
        fx.render();
        fx.scheduler.invalidate(0, 0);
        fx.scheduler.on_history_changed(1, 1);
        assert!(fx.scheduler.store().has_snapshot(0));

        let Fixture { dir, scheduler, host, .. } = fx;
        drop(scheduler);
        // Unsaved document without chunks: nothing is kept
        assert!(!primary.exists());
        assert!(host.track_ids().is_empty());
        drop(dir);
    }

    #[test]
    fn test_abort_blocks_while_another_thread_waits_idle() {
        let fx = fixture(Behavior::BlockUntilKilled);
        fx.scheduler.add_preview_range(0, 49, true);
        fx.scheduler.start_render();
        let path = fx.scheduler.store().file_path(0);
        wait_until("partial output", || path.exists());

        thread::scope(|s| {
            let waiter = s.spawn(|| fx.scheduler.wait_idle());
            thread::sleep(Duration::from_millis(20));
            fx.scheduler.abort_rendering();
            assert!(!fx.scheduler.is_rendering());
            assert!(!path.exists());
            assert_eq!(fx.scheduler.working_chunk(), None);
            waiter.join().unwrap();
        });
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);
    }

    #[test]
    fn test_abort_right_after_request_stops_new_batch() {
        let fx = fixture_with(config(), Behavior::BlockUntilKilled, 50);
        let inner = Arc::downgrade(&fx.scheduler.inner);
        let aborted = Arc::new(AtomicBool::new(false));
        let a = Arc::clone(&aborted);
        fx.bus.subscribe::<DirtyChunksChanged, _>(move |_| {
            if !a.swap(true, Ordering::SeqCst) {
                if let Some(inner) = inner.upgrade() {
                    inner.abort_rendering();
                }
            }
        });

        // Promoting the whole timeline notifies while the new batch is starting;
        // a lost abort would leave the engine blocked forever
        fx.render();
        assert!(aborted.load(Ordering::SeqCst));
        assert!(!fx.scheduler.is_rendering());
        assert_eq!(fx.scheduler.dirty_chunks(), vec![0, 25]);
        assert_eq!(fx.scheduler.working_chunk(), None);
        assert!(fx.scheduler.store().chunk_files().is_empty());
    }

    #[test]
    fn test_edit_ahead_of_batch_renders_with_new_scene() {
        let fx = fixture(Behavior::SlowWrite(Duration::from_millis(50)));
        fx.scheduler.add_preview_range(0, 99, true);
        fx.scheduler.start_render();
        wait_until("chunk 0 launched", || fx.engine.launches().len() == 1);

        fx.scene.edit();
        fx.scheduler.invalidate(75, 80);
        fx.scheduler.on_history_changed(1, 1);
        fx.scheduler.wait_idle();

        assert_eq!(fx.scheduler.rendered_chunks(), vec![0, 25, 50, 75]);
        assert!(fx.scheduler.dirty_chunks().is_empty());
        let launches = fx.engine.launch_log();
        let last: Vec<&str> = launches
            .iter()
            .filter(|l| l.invocation.first_frame == 75)
            .map(|l| l.scene.as_str())
            .collect();
        assert_eq!(last, vec!["scene v1"]);
        assert_eq!(launches[0].scene, "scene v0");
    }

    fn open_session(
        dir: &Path,
        engine: &Arc<ScriptedEngine>,
        scene: &Arc<VersionedScene>,
        host: &RecordingHost,
    ) -> PreviewScheduler {
        let mut document = DocumentSettings::new("1700000000000");
        document.saved = true;
        PreviewScheduler::new(
            config(),
            &document,
            dir,
            engine.clone(),
            scene.clone(),
            Box::new(host.clone()),
            EventBus::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_pending_invalidation_not_reused_next_session() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(ScriptedEngine::new(Behavior::Write));
        let scene = Arc::new(VersionedScene::new(1000));
        let host = RecordingHost::default();

        let first = open_session(dir.path(), &engine, &scene, &host);
        first.add_preview_range(0, 24, true);
        first.start_render();
        first.wait_idle();
        let path = first.store().file_path(0);
        let before = fs::read(&path).unwrap();

        // Edited, then closed before any history step or render
        scene.edit();
        first.invalidate(0, 10);
        let (rendered, dirty) = first.preview_chunks();
        assert!(rendered.is_empty());
        drop(first);
        assert!(!path.exists());

        let second = open_session(dir.path(), &engine, &scene, &host);
        let dirty: Vec<ChunkId> = dirty.iter().map(|id| id.parse().unwrap()).collect();
        second.load_chunks(&[], &dirty, None);
        second.start_render();
        second.wait_idle();

        assert_eq!(engine.launches().len(), 2);
        assert_eq!(second.rendered_chunks(), vec![0]);
        assert_ne!(fs::read(&path).unwrap(), before);
        assert_eq!(engine.launch_log()[1].scene, "scene v1");
    }
}
