//! Render Engine boundary.
//!
//! The engine is an opaque external process: it gets a scene description,
//! a frame range, an output path and consumer parameters, and either leaves a
//! complete file behind (exit 0) or not. `RenderEngine` / `EngineProcess` are
//! the narrow seam so tests can script the engine without spawning anything.
//!
//! `ProcessEngine` runs the real executable. Its stderr is drained on a reader
//! thread into a bounded tail (shown to the user on failure) and scraped for
//! a `percentage: N` marker. That percentage is telemetry only.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

/// Lines of engine output kept for error reports
const LOG_TAIL_LINES: usize = 50;

/// Engine progress marker, e.g. `Current Frame:  12, percentage:  48`
static PROGRESS_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"percentage:\s*(\d{1,3})").expect("valid progress regex"));

/// One engine invocation: `<program> <scene> in=<first> out=<last> <target> <params...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub scene: PathBuf,
    pub first_frame: i32,
    pub last_frame: i32,
    pub target: PathBuf,
    pub params: Vec<String>,
}

impl Invocation {
    /// Positional arguments in engine order.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.scene.to_string_lossy().into_owned(),
            format!("in={}", self.first_frame),
            format!("out={}", self.last_frame),
            self.target.to_string_lossy().into_owned(),
        ];
        args.extend(
            self.params
                .iter()
                .filter(|p| !p.starts_with("r=") && !p.starts_with("s="))
                .cloned(),
        );
        args
    }
}

/// How an engine process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineExit {
    /// Exit code; `None` when killed by a signal or crashed
    pub code: Option<i32>,
    /// Last lines of engine output
    pub log_tail: Vec<String>,
}

impl EngineExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn log(&self) -> String {
        self.log_tail.join("\n")
    }
}

/// A launched engine process. Shared between the thread waiting on it and
/// whoever wants to abort it.
pub trait EngineProcess: Send + Sync {
    /// Non-blocking exit check.
    fn try_wait(&self) -> io::Result<Option<EngineExit>>;
    /// Request termination.
    fn kill(&self) -> io::Result<()>;
    /// Best-effort progress of this invocation (0-1000), if the engine reports any.
    fn progress_hint(&self) -> Option<i32> {
        None
    }
}

pub trait RenderEngine: Send + Sync {
    fn launch(&self, invocation: &Invocation) -> io::Result<Arc<dyn EngineProcess>>;
}

/// Extract permille progress from one line of engine output.
pub fn parse_progress(line: &str) -> Option<i32> {
    let caps = PROGRESS_MARKER.captures(line)?;
    let percent: i32 = caps.get(1)?.as_str().parse().ok()?;
    Some(percent.clamp(0, 100) * 10)
}

/// Real engine: spawns `invocation.program` as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEngine;

impl ProcessEngine {
    pub fn new() -> Self {
        Self
    }
}

impl RenderEngine for ProcessEngine {
    fn launch(&self, invocation: &Invocation) -> io::Result<Arc<dyn EngineProcess>> {
        let args = invocation.args();
        debug!("Launching {} {:?}", invocation.program.display(), args);
        let mut child = Command::new(&invocation.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let progress = Arc::new(AtomicI32::new(-1));
        let reader = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            let progress = Arc::clone(&progress);
            thread::Builder::new()
                .name("preview-engine-log".into())
                .spawn(move || drain_log(stderr, &tail, &progress))
        });
        let reader = match reader.transpose() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Arc::new(ChildProcess {
            child: Mutex::new(child),
            tail,
            progress,
            reader: Mutex::new(reader),
        }))
    }
}

fn drain_log(stderr: impl io::Read, tail: &Mutex<VecDeque<String>>, progress: &AtomicI32) {
    // Engines rewrite progress lines with '\r'; split on both
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let text = String::from_utf8_lossy(&buf);
        for line in text.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(permille) = parse_progress(line) {
                progress.store(permille, Ordering::Relaxed);
                continue;
            }
            trace!("engine: {}", line);
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() >= LOG_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }
}

struct ChildProcess {
    child: Mutex<Child>,
    tail: Arc<Mutex<VecDeque<String>>>,
    progress: Arc<AtomicI32>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EngineProcess for ChildProcess {
    fn try_wait(&self) -> io::Result<Option<EngineExit>> {
        let status = self.child.lock().unwrap_or_else(|e| e.into_inner()).try_wait()?;
        let Some(status) = status else {
            return Ok(None);
        };
        // Stderr hits EOF once the child is gone; join so the tail is complete
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        let log_tail = self.tail.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
        Ok(Some(EngineExit { code: status.code(), log_tail }))
    }

    fn kill(&self) -> io::Result<()> {
        match self.child.lock().unwrap_or_else(|e| e.into_inner()).kill() {
            // Already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn progress_hint(&self) -> Option<i32> {
        let value = self.progress.load(Ordering::Relaxed);
        (value >= 0).then_some(value)
    }
}
