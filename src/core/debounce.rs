//! Debounced render trigger - delays a render batch after edits.
//!
//! When edits arrive in bursts (dragging a clip, typing in an effect), we
//! don't want one render batch per edit. Instead:
//! 1. Every edit (re)arms the trigger
//! 2. Once no edit arrived for the configured delay, the callback fires once
//!
//! `Debouncer` is the pure timing state; `RenderTrigger` drives it from a
//! dedicated timer thread so foreground calls never block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::trace;

/// Debounce timing state.
///
/// # Usage
/// ```ignore
/// // On edit:
/// debouncer.schedule();
///
/// // In timer loop:
/// if debouncer.tick() {
///     start_render();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Debouncer {
    /// Delay before firing
    delay: Duration,
    /// Pending trigger time
    pending: Option<Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            pending: None,
        }
    }
}

impl Debouncer {
    /// Create with custom delay
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: None }
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the trigger. If already pending, resets the timer (debounce behavior).
    pub fn schedule(&mut self) {
        self.pending = Some(Instant::now() + self.delay);
        trace!("Debouncer: scheduled in {}ms", self.delay.as_millis());
    }

    /// Cancel any pending trigger
    pub fn cancel(&mut self) {
        if self.pending.is_some() {
            trace!("Debouncer: cancelled pending trigger");
        }
        self.pending = None;
    }

    /// Returns true (once) when the delay has elapsed; clears the pending state.
    pub fn tick(&mut self) -> bool {
        let Some(trigger_at) = self.pending else {
            return false;
        };
        if Instant::now() >= trigger_at {
            self.pending = None;
            trace!("Debouncer: triggering");
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left until the trigger fires
    pub fn remaining(&self) -> Option<Duration> {
        self.pending.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

enum TriggerMsg {
    Schedule,
    Cancel,
    Shutdown,
}

/// Handle to the timer thread. Cloneable; all clones drive the same timer.
#[derive(Clone)]
pub struct RenderTrigger {
    tx: Sender<TriggerMsg>,
    pending: Arc<AtomicBool>,
}

impl std::fmt::Debug for RenderTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTrigger").field("pending", &self.is_pending()).finish()
    }
}

impl RenderTrigger {
    /// Spawn the timer thread. `on_fire` runs on that thread.
    pub fn spawn<F>(delay: Duration, on_fire: F) -> std::io::Result<(Self, thread::JoinHandle<()>)>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("preview-trigger".into())
            .spawn(move || run_timer(Debouncer::new(delay), rx, flag, on_fire))?;
        Ok((Self { tx, pending }, handle))
    }

    pub fn schedule(&self) {
        self.pending.store(true, Ordering::SeqCst);
        let _ = self.tx.send(TriggerMsg::Schedule);
    }

    pub fn cancel(&self) {
        self.pending.store(false, Ordering::SeqCst);
        let _ = self.tx.send(TriggerMsg::Cancel);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(TriggerMsg::Shutdown);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

fn run_timer<F: Fn()>(mut debouncer: Debouncer, rx: Receiver<TriggerMsg>, pending: Arc<AtomicBool>, on_fire: F) {
    loop {
        let msg = match debouncer.remaining() {
            Some(wait) => rx.recv_timeout(wait),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(TriggerMsg::Schedule) => debouncer.schedule(),
            Ok(TriggerMsg::Cancel) => debouncer.cancel(),
            Ok(TriggerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if debouncer.tick() {
            pending.store(false, Ordering::SeqCst);
            on_fire();
        }
    }
    trace!("Render trigger thread stopped");
}
