//! Crash injection for durability tests.
//!
//! A [`CrashInjector`] watches the steps of a commit protocol and says
//! "crash now" on the n-th occurrence of a chosen step. It is generic over
//! the step type so the engine's metadata hook can be fed straight into it:
//!
//! ```text
//! blob write → header write → sync → header write (god byte) → sync
//!            0              0      0                        1      1
//! ```
//!
//! Crashing on the first header write leaves the old image in place; on the
//! second sync, the new image is committed but not yet known to be durable.
//! Recovery must cope with every one of these states.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Triggers a simulated crash on the `occurrence`-th (zero based) time
/// `target` is reported while armed.
///
/// # Thread Safety
///
/// Counters are atomic; the injector can be shared with a hook closure.
#[derive(Debug)]
pub struct CrashInjector<S> {
    target: S,
    occurrence: u32,
    seen: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl<S: PartialEq + Copy> CrashInjector<S> {
    /// Creates a disarmed injector.
    pub fn new(target: S, occurrence: u32) -> Arc<Self> {
        Arc::new(Self {
            target,
            occurrence,
            seen: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Arms the injector and resets its counters.
    ///
    /// The injector starts disarmed so setup (creating tables, the first
    /// checkpoint) runs without interference.
    pub fn arm(&self) {
        self.seen.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the crash has fired.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Number of matching steps seen since arming.
    pub fn seen(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }

    /// Records a step; returns `true` when the crash should happen here.
    ///
    /// Fires at most once per arming.
    pub fn on_step(&self, step: S) -> bool {
        if !self.armed.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            return false;
        }
        if step != self.target {
            return false;
        }
        let count = self.seen.fetch_add(1, Ordering::SeqCst);
        let fire = count == self.occurrence;
        if fire {
            self.crashed.store(true, Ordering::SeqCst);
        }
        fire
    }
}
