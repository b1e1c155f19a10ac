//! Test doubles: a scriptable in-process render engine, a recording
//! composition host and a versioned scene.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::composer::{CompositionHost, PREVIEW_TRACK_ID, Segment, TrackState};
use crate::core::engine::{EngineExit, EngineProcess, Invocation, RenderEngine};
use crate::core::scene::SceneSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Write a unique complete file and exit 0
    Write,
    /// Write a partial file and exit 1
    Fail,
    /// Exit 0 without producing output
    ExitWithoutOutput,
    /// `launch()` itself fails
    LaunchError,
    /// Write a partial file, then hang until killed
    BlockUntilKilled,
    /// Report progress for a while, then behave like `Write`
    SlowWrite(Duration),
}

/// One recorded launch: the invocation and the scene text at launch time.
#[derive(Debug, Clone)]
pub struct Launch {
    pub invocation: Invocation,
    pub scene: String,
}

pub struct ScriptedEngine {
    default: Mutex<Behavior>,
    script: Mutex<HashMap<i32, VecDeque<Behavior>>>,
    launches: Mutex<Vec<Launch>>,
    counter: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(default: Behavior) -> Self {
        Self {
            default: Mutex::new(default),
            script: Mutex::new(HashMap::new()),
            launches: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default.lock().unwrap() = behavior;
    }

    /// Queue behaviors for the chunk starting at `first_frame`, used before the default.
    pub fn script(&self, first_frame: i32, behaviors: impl IntoIterator<Item = Behavior>) {
        self.script.lock().unwrap().entry(first_frame).or_default().extend(behaviors);
    }

    pub fn launches(&self) -> Vec<Invocation> {
        self.launches.lock().unwrap().iter().map(|l| l.invocation.clone()).collect()
    }

    pub fn launch_log(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launched_chunks(&self) -> Vec<i32> {
        self.launches().iter().map(|i| i.first_frame).collect()
    }

    fn next_behavior(&self, first_frame: i32) -> Behavior {
        let scripted = self.script.lock().unwrap().get_mut(&first_frame).and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

impl RenderEngine for ScriptedEngine {
    fn launch(&self, invocation: &Invocation) -> io::Result<Arc<dyn EngineProcess>> {
        let behavior = self.next_behavior(invocation.first_frame);
        if behavior == Behavior::LaunchError {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such renderer"));
        }
        let scene = fs::read_to_string(&invocation.scene).unwrap_or_default();
        self.launches.lock().unwrap().push(Launch { invocation: invocation.clone(), scene });
        let serial = self.counter.fetch_add(1, Ordering::SeqCst);
        let content = format!("render #{} frames {}-{}", serial, invocation.first_frame, invocation.last_frame);
        let target = invocation.target.clone();

        let process = Arc::new(FakeProcess::default());
        match behavior {
            Behavior::Write => {
                fs::write(&target, content)?;
                process.finish(Some(0), &[]);
            }
            Behavior::Fail => {
                fs::write(&target, "partial")?;
                process.finish(Some(1), &["renderer: error decoding frame"]);
            }
            Behavior::ExitWithoutOutput => process.finish(Some(0), &[]),
            Behavior::BlockUntilKilled => {
                fs::write(&target, "partial")?;
                let p = Arc::clone(&process);
                thread::spawn(move || {
                    while !p.killed.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    p.finish(None, &["killed"]);
                });
            }
            Behavior::SlowWrite(duration) => {
                let p = Arc::clone(&process);
                thread::spawn(move || {
                    let steps = 10u32;
                    for step in 0..steps {
                        if p.killed.load(Ordering::SeqCst) {
                            p.finish(None, &["killed"]);
                            return;
                        }
                        *p.hint.lock().unwrap() = Some((step * 100) as i32);
                        thread::sleep(duration / steps);
                    }
                    let _ = fs::write(&target, content);
                    p.finish(Some(0), &[]);
                });
            }
            Behavior::LaunchError => unreachable!(),
        }
        Ok(process)
    }
}

#[derive(Default)]
struct FakeProcess {
    exit: Mutex<Option<EngineExit>>,
    killed: AtomicBool,
    hint: Mutex<Option<i32>>,
}

impl FakeProcess {
    fn finish(&self, code: Option<i32>, log: &[&str]) {
        *self.exit.lock().unwrap() = Some(EngineExit {
            code,
            log_tail: log.iter().map(|s| s.to_string()).collect(),
        });
    }
}

impl EngineProcess for FakeProcess {
    fn try_wait(&self) -> io::Result<Option<EngineExit>> {
        Ok(self.exit.lock().unwrap().clone())
    }

    fn kill(&self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn progress_hint(&self) -> Option<i32> {
        *self.hint.lock().unwrap()
    }
}

/// Composition host recording what the composer attached. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingHost {
    tracks: Arc<Mutex<HashMap<String, TrackState>>>,
    attaches: Arc<AtomicUsize>,
}

impl RecordingHost {
    pub fn track(&self, id: &str) -> Option<TrackState> {
        self.tracks.lock().unwrap().get(id).cloned()
    }

    pub fn track_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracks.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Chunk ids currently spliced into the preview track.
    pub fn preview_chunks(&self) -> Vec<i32> {
        self.track(PREVIEW_TRACK_ID)
            .map(|t| {
                t.segments
                    .iter()
                    .filter_map(|s| match s {
                        Segment::Chunk { id, .. } => Some(*id),
                        Segment::Blank { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl CompositionHost for RecordingHost {
    fn attach(&mut self, track: &TrackState) -> anyhow::Result<()> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        self.tracks.lock().unwrap().insert(track.id.clone(), track.clone());
        Ok(())
    }

    fn detach(&mut self, track_id: &str) -> anyhow::Result<()> {
        self.tracks.lock().unwrap().remove(track_id);
        Ok(())
    }
}

/// Scene whose exported text carries a version bumped by `edit()`.
pub struct VersionedScene {
    duration: AtomicUsize,
    version: AtomicUsize,
    exports: AtomicUsize,
}

impl VersionedScene {
    pub fn new(duration: i32) -> Self {
        Self {
            duration: AtomicUsize::new(duration.max(0) as usize),
            version: AtomicUsize::new(0),
            exports: AtomicUsize::new(0),
        }
    }

    pub fn edit(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn text(&self) -> String {
        format!("scene v{}", self.version.load(Ordering::SeqCst))
    }

    pub fn export_count(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

impl SceneSource for VersionedScene {
    fn duration(&self) -> i32 {
        self.duration.load(Ordering::SeqCst) as i32
    }

    fn export_scene(&self, target: &Path) -> anyhow::Result<()> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        fs::write(target, self.text())?;
        Ok(())
    }
}
