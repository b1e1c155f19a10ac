//! Single-chunk render job runner.
//!
//! State machine: `Idle -> Starting -> Running -> {Succeeded, Failed, Aborted}`.
//! A terminal state is kept until the next `run()` so callers can inspect it.
//!
//! Guarantee: when `run()` returns, the output path holds either a complete
//! file (non-empty, engine exit 0) or nothing. Failed and aborted jobs
//! delete whatever the engine left behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::core::chunks::ChunkId;
use crate::core::engine::{EngineExit, EngineProcess, Invocation, RenderEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Everything needed to render one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub chunk: ChunkId,
    /// First frame (inclusive)
    pub first_frame: i32,
    /// Last frame (inclusive)
    pub last_frame: i32,
    pub scene: PathBuf,
    pub output: PathBuf,
    pub params: Vec<String>,
}

impl RenderJob {
    /// Job covering `[chunk, chunk + chunk_size)`.
    pub fn for_chunk(chunk: ChunkId, chunk_size: i32, scene: &Path, output: PathBuf, params: &[String]) -> Self {
        Self {
            chunk,
            first_frame: chunk,
            last_frame: chunk + chunk_size.max(1) - 1,
            scene: scene.to_path_buf(),
            output,
            params: params.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { chunk: ChunkId, path: PathBuf },
    Failed { chunk: ChunkId, log: String },
    Aborted { chunk: ChunkId },
}

impl JobOutcome {
    pub fn chunk(&self) -> ChunkId {
        match self {
            JobOutcome::Succeeded { chunk, .. } | JobOutcome::Failed { chunk, .. } | JobOutcome::Aborted { chunk } => {
                *chunk
            }
        }
    }
}

#[derive(Debug)]
pub enum RenderError {
    AlreadyRunning,
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::AlreadyRunning => write!(f, "Render job already running"),
        }
    }
}

impl std::error::Error for RenderError {}

fn is_complete(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted incomplete output {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete incomplete output {}: {}", path.display(), e),
    }
}

pub struct RenderJobRunner {
    engine: Arc<dyn RenderEngine>,
    program: PathBuf,
    poll_interval: Duration,
    state: Mutex<JobState>,
    current: Mutex<Option<Arc<dyn EngineProcess>>>,
    abort_requested: AtomicBool,
}

impl std::fmt::Debug for RenderJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderJobRunner")
            .field("program", &self.program)
            .field("state", &self.state())
            .field("abort_requested", &self.abort_requested.load(Ordering::Relaxed))
            .finish()
    }
}

impl RenderJobRunner {
    pub fn new(engine: Arc<dyn RenderEngine>, program: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            engine,
            program: program.into(),
            poll_interval,
            state: Mutex::new(JobState::Idle),
            current: Mutex::new(None),
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: JobState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        trace!("RenderJobRunner: {:?} -> {:?}", *current, state);
        *current = state;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), JobState::Starting | JobState::Running)
    }

    /// Request termination of the in-flight process. Sticky until `clear_abort()`,
    /// so a job started after the request is aborted before launching.
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        if let Some(process) = self.current.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            debug!("Aborting running render process");
            if let Err(e) = process.kill() {
                warn!("Failed to kill render process: {}", e);
            }
        }
    }

    pub fn clear_abort(&self) {
        self.abort_requested.store(false, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Render one chunk, blocking until the engine exits. No timeout: a hung
    /// engine hangs the job until `abort()`.
    ///
    /// `on_progress` receives the engine's advisory per-job progress (0-1000).
    pub fn run(&self, job: &RenderJob, mut on_progress: impl FnMut(i32)) -> Result<JobOutcome, RenderError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, JobState::Starting | JobState::Running) {
                return Err(RenderError::AlreadyRunning);
            }
            *state = JobState::Starting;
        }

        if self.abort_requested() {
            self.set_state(JobState::Aborted);
            return Ok(JobOutcome::Aborted { chunk: job.chunk });
        }

        let invocation = Invocation {
            program: self.program.clone(),
            scene: job.scene.clone(),
            first_frame: job.first_frame,
            last_frame: job.last_frame,
            target: job.output.clone(),
            params: job.params.clone(),
        };

        let process = match self.engine.launch(&invocation) {
            Ok(process) => process,
            Err(e) => {
                warn!("Failed to launch renderer {}: {}", self.program.display(), e);
                discard(&job.output);
                self.set_state(JobState::Failed);
                return Ok(JobOutcome::Failed {
                    chunk: job.chunk,
                    log: format!("Failed to launch {}: {}", self.program.display(), e),
                });
            }
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&process));
        self.set_state(JobState::Running);

        // abort() may have run between the check above and publishing `current`
        if self.abort_requested() {
            let _ = process.kill();
        }

        let exit = self.wait(process.as_ref(), &mut on_progress);
        self.current.lock().unwrap_or_else(|e| e.into_inner()).take();

        let outcome = if exit.success() && is_complete(&job.output) {
            JobOutcome::Succeeded { chunk: job.chunk, path: job.output.clone() }
        } else {
            discard(&job.output);
            if self.abort_requested() {
                JobOutcome::Aborted { chunk: job.chunk }
            } else if exit.success() {
                JobOutcome::Failed {
                    chunk: job.chunk,
                    log: format!("Renderer exited cleanly but {} is missing or empty\n{}", job.output.display(), exit.log()),
                }
            } else {
                JobOutcome::Failed {
                    chunk: job.chunk,
                    log: format!("Renderer exited with {:?}\n{}", exit.code, exit.log()),
                }
            }
        };

        self.set_state(match outcome {
            JobOutcome::Succeeded { .. } => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Aborted { .. } => JobState::Aborted,
        });
        debug!("Chunk {} render finished: {:?}", job.chunk, self.state());
        Ok(outcome)
    }

    fn wait(&self, process: &dyn EngineProcess, on_progress: &mut impl FnMut(i32)) -> EngineExit {
        let mut last_hint = None;
        loop {
            match process.try_wait() {
                Ok(Some(exit)) => return exit,
                Ok(None) => {}
                Err(e) => {
                    warn!("Lost track of render process: {}", e);
                    let _ = process.kill();
                    return EngineExit { code: None, log_tail: vec![e.to_string()] };
                }
            }
            let hint = process.progress_hint();
            if hint.is_some() && hint != last_hint {
                last_hint = hint;
                if let Some(p) = hint {
                    on_progress(p);
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}
