//! Stepping requests driven by call/line/return events.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use strum_macros::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(i32)]
pub enum StepKind {
    None = 0,
    Into = 1,
    Over = 2,
    /// Armed for depth tracking only, completion is detected by native breakpoints.
    Out = 3,
}

/// Outcome of an event for the stepping thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Complete,
    /// The frame the step started in has unwound.
    FallThrough,
}

/// Current stepping request. Armed and cleared by the controller, advanced by the
/// trace callback of the stepping thread.
#[repr(C)]
pub struct Stepper {
    kind: AtomicI32,
    thread: AtomicU64,
    /// Frames entered since the request was armed.
    depth: AtomicI32,
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper {
    pub const fn new() -> Self {
        Self {
            kind: AtomicI32::new(StepKind::None as i32),
            thread: AtomicU64::new(0),
            depth: AtomicI32::new(0),
        }
    }

    pub fn arm(&self, kind: StepKind, thread: u64) {
        self.depth.store(0, Ordering::SeqCst);
        self.thread.store(thread, Ordering::SeqCst);
        self.kind.store(kind as i32, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.kind.store(StepKind::None as i32, Ordering::SeqCst);
    }

    pub fn kind(&self) -> StepKind {
        StepKind::from_repr(self.kind.load(Ordering::SeqCst)).unwrap_or(StepKind::None)
    }

    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn thread(&self) -> u64 {
        self.thread.load(Ordering::SeqCst)
    }

    fn is_stepping_thread(&self, thread: u64) -> bool {
        self.thread.load(Ordering::SeqCst) == thread
    }

    /// True if a step is armed for `thread`.
    pub fn is_pending_for(&self, thread: u64) -> bool {
        self.kind() != StepKind::None && self.is_stepping_thread(thread)
    }

    pub fn on_line(&self, thread: u64) -> Option<StepEvent> {
        if !self.is_stepping_thread(thread) {
            return None;
        }
        match self.kind() {
            StepKind::Into => {}
            StepKind::Over if self.depth() == 0 => {}
            _ => return None,
        }
        self.clear();
        Some(StepEvent::Complete)
    }

    pub fn on_call(&self, thread: u64) -> Option<StepEvent> {
        if !self.is_stepping_thread(thread) {
            return None;
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.kind() == StepKind::Into {
            self.clear();
            return Some(StepEvent::Complete);
        }
        None
    }

    pub fn on_return(&self, thread: u64) -> Option<StepEvent> {
        if !self.is_stepping_thread(thread) {
            return None;
        }
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.kind() != StepKind::None && depth == -1 {
            return Some(StepEvent::FallThrough);
        }
        None
    }
}
