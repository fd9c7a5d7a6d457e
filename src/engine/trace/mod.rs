//! Trace callback core: breakpoints, stepping, evaluation at stops and deferred releases.
//!
//! [`TraceState::dispatch`] is called for every trace event of every traced
//! interpreter thread. It must never block, never log and never run
//! interpreter code except through [`TraceHook`].

pub mod breakpoint;
pub mod eval;
pub mod notify;
pub mod release;
pub mod step;

use breakpoint::{BreakpointBuffer, BreakpointTable};
use eval::{EvalCell, EvalOutcome};
use release::ReleaseQueue;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use step::{StepEvent, StepKind, Stepper};
use strum_macros::{Display, FromRepr};

/// Event codes passed to a `Py_tracefunc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(i32)]
pub enum TraceEvent {
    Call = 0,
    Exception = 1,
    Line = 2,
    Return = 3,
    CCall = 4,
    CException = 5,
    CReturn = 6,
    Opcode = 7,
}

/// Source names longer than this are truncated in [`SourceLocationCell`].
pub const MAX_SOURCE_NAME: usize = 512;

/// Location of the last breakpoint hit, read by the controller while the
/// process is stopped in [`notify::pystalker_on_breakpoint_hit`].
#[repr(C)]
pub struct SourceLocationCell {
    line: AtomicI32,
    len: AtomicU32,
    file: [AtomicU8; MAX_SOURCE_NAME],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: i32,
    pub file: String,
}

impl SourceLocationCell {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU8 = AtomicU8::new(0);

    pub const fn new() -> Self {
        Self {
            line: AtomicI32::new(0),
            len: AtomicU32::new(0),
            file: [Self::ZERO; MAX_SOURCE_NAME],
        }
    }

    fn record(&self, line: i32, file: &str) {
        let bytes = &file.as_bytes()[..file.len().min(MAX_SOURCE_NAME)];
        for (cell, b) in self.file.iter().zip(bytes) {
            cell.store(*b, Ordering::Relaxed);
        }
        self.len.store(bytes.len() as u32, Ordering::Release);
        self.line.store(line, Ordering::Release);
    }

    pub fn load(&self) -> SourceLocation {
        let len = self.len.load(Ordering::Acquire) as usize;
        let bytes: Vec<u8> = self.file[..len]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        SourceLocation {
            line: self.line.load(Ordering::Acquire),
            file: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

impl Default for SourceLocationCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the frame an event was raised for.
pub trait TraceFrame {
    fn line(&self) -> i32;

    /// True if the frame's code was loaded from `name`.
    fn file_is(&self, name: &str) -> bool;

    fn address(&self) -> *mut c_void {
        std::ptr::null_mut()
    }
}

/// Side effects of the dispatcher.
pub trait TraceHook {
    /// Drop one deferred object reference.
    fn release(&self, object: *mut c_void);

    fn breakpoint_hit(&self) {
        notify::pystalker_on_breakpoint_hit()
    }

    fn step_complete(&self) {
        notify::pystalker_on_step_complete()
    }

    fn step_fallthrough(&self) {
        notify::pystalker_on_step_fallthrough()
    }

    /// Evaluate `source` in the scope of `frame`.
    fn evaluate(&self, _frame: *mut c_void, _source: &CStr) -> EvalOutcome {
        EvalOutcome::default()
    }

    fn eval_complete(&self) {
        notify::pystalker_on_eval_complete()
    }
}

/// Process wide trace state shared by every traced thread and the controller.
#[repr(C)]
pub struct TraceState {
    pub stepper: Stepper,
    pub location: SourceLocationCell,
    pub breakpoints: BreakpointBuffer,
    pub releases: ReleaseQueue,
    pub eval: EvalCell,
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceState {
    pub const fn new() -> Self {
        Self {
            stepper: Stepper::new(),
            location: SourceLocationCell::new(),
            breakpoints: BreakpointBuffer::new(),
            releases: ReleaseQueue::new(),
            eval: EvalCell::new(),
        }
    }

    /// Handle one trace event raised on `thread`.
    pub fn dispatch(
        &self,
        thread: u64,
        event: TraceEvent,
        frame: &impl TraceFrame,
        hook: &impl TraceHook,
    ) {
        self.releases.drain(|object| hook.release(object));

        let step_event = match event {
            TraceEvent::Call => self.stepper.on_call(thread),
            TraceEvent::Return => self.stepper.on_return(thread),
            TraceEvent::Line => match self.stepper.on_line(thread) {
                Some(e) => Some(e),
                None if self.stepper.is_pending_for(thread) => None,
                None => {
                    if self.check_breakpoint(frame) {
                        self.eval
                            .serve(thread, frame.address(), hook, || hook.breakpoint_hit());
                    }
                    None
                }
            },
            _ => None,
        };

        match step_event {
            Some(StepEvent::Complete) => {
                self.eval
                    .serve(thread, frame.address(), hook, || hook.step_complete())
            }
            Some(StepEvent::FallThrough) => hook.step_fallthrough(),
            None => {}
        }
    }

    /// Look up the frame's line in the current table and record the location on a match.
    fn check_breakpoint(&self, frame: &impl TraceFrame) -> bool {
        let Ok(line) = u32::try_from(frame.line()) else {
            return false;
        };

        self.breakpoints.read(|table| {
            let Some(table) = table else {
                return false;
            };
            if line > table.max_line() {
                return false;
            }
            match table.find(line, |name| frame.file_is(name)) {
                Some(file) => {
                    self.location.record(line as i32, file);
                    true
                }
                None => false,
            }
        })
    }

    pub fn set_breakpoints(&self, table: BreakpointTable) {
        self.breakpoints.publish(table)
    }

    pub fn last_location(&self) -> SourceLocation {
        self.location.load()
    }
}

/// Trace state of this process, exported for the controller.
#[no_mangle]
pub static PYSTALKER_TRACE: TraceState = TraceState::new();

/// Breakpoint location passed by a controller.
#[repr(C)]
pub struct BreakpointEntry {
    pub line: u32,
    pub file: *const c_char,
}

/// Replace the breakpoint table. Must be called while the debuggee is paused.
///
/// # Safety
///
/// `entries` must point to `count` valid entries with null-terminated file names.
#[no_mangle]
pub unsafe extern "C" fn pystalker_set_breakpoints(
    entries: *const BreakpointEntry,
    count: usize,
) -> c_int {
    let res = catch_unwind(AssertUnwindSafe(|| {
        let mut builder = BreakpointTable::builder();
        if !entries.is_null() {
            for entry in std::slice::from_raw_parts(entries, count) {
                if entry.file.is_null() {
                    continue;
                }
                let file = CStr::from_ptr(entry.file).to_string_lossy();
                builder.insert(entry.line, file.into_owned());
            }
        }
        PYSTALKER_TRACE.set_breakpoints(builder.build());
    }));
    if res.is_ok() {
        0
    } else {
        -1
    }
}

/// Arm a step of `kind` (see [`StepKind`]) for the native thread `thread`.
#[no_mangle]
pub extern "C" fn pystalker_step(kind: c_int, thread: u64) -> c_int {
    match StepKind::from_repr(kind) {
        Some(kind) => {
            PYSTALKER_TRACE.stepper.arm(kind, thread);
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn pystalker_clear_step() {
    PYSTALKER_TRACE.stepper.clear()
}

/// Queue a reference to be dropped by the next trace event.
#[no_mangle]
pub extern "C" fn pystalker_release_later(object: *mut c_void) {
    PYSTALKER_TRACE.releases.push(object)
}
