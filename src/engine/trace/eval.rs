//! Expression evaluation on a thread stopped at a breakpoint or after a step.
//!
//! While the process is stopped in a notification function the controller finds
//! the stopped thread in [`EvalCell::thread`], writes a NUL-terminated expression
//! into the input buffer and resumes. The thread evaluates it in the scope of its
//! frame, publishes the outcome and stops again in
//! [`super::notify::pystalker_on_eval_complete`]. Resuming with empty input ends the loop.

use super::TraceHook;
use std::ffi::{c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

pub const EVAL_INPUT_SIZE: usize = 0x1000;

/// Owned references produced by one evaluation, null when absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    pub result: *mut c_void,
    pub exc_type: *mut c_void,
    pub exc_value: *mut c_void,
    /// `str()` of the exception value.
    pub exc_str: *mut c_void,
}

impl Default for EvalOutcome {
    fn default() -> Self {
        Self {
            result: ptr::null_mut(),
            exc_type: ptr::null_mut(),
            exc_value: ptr::null_mut(),
            exc_str: ptr::null_mut(),
        }
    }
}

impl EvalOutcome {
    fn objects(&self) -> [*mut c_void; 4] {
        [self.result, self.exc_type, self.exc_value, self.exc_str]
    }
}

#[repr(C)]
pub struct EvalCell {
    /// Native id of the thread waiting for input, 0 while it evaluates or runs.
    thread: AtomicU64,
    frame: AtomicPtr<c_void>,
    input: [AtomicU8; EVAL_INPUT_SIZE],
    result: AtomicPtr<c_void>,
    exc_type: AtomicPtr<c_void>,
    exc_value: AtomicPtr<c_void>,
    exc_str: AtomicPtr<c_void>,
}

impl Default for EvalCell {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalCell {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU8 = AtomicU8::new(0);

    pub const fn new() -> Self {
        Self {
            thread: AtomicU64::new(0),
            frame: AtomicPtr::new(ptr::null_mut()),
            input: [Self::ZERO; EVAL_INPUT_SIZE],
            result: AtomicPtr::new(ptr::null_mut()),
            exc_type: AtomicPtr::new(ptr::null_mut()),
            exc_value: AtomicPtr::new(ptr::null_mut()),
            exc_str: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn thread(&self) -> u64 {
        self.thread.load(Ordering::Acquire)
    }

    pub fn frame(&self) -> *mut c_void {
        self.frame.load(Ordering::Acquire)
    }

    /// Write the next expression. Return false if it does not fit or contains NUL.
    pub fn submit(&self, source: &str) -> bool {
        let bytes = source.as_bytes();
        if bytes.len() >= EVAL_INPUT_SIZE || bytes.contains(&0) {
            return false;
        }
        for (cell, b) in self.input.iter().zip(bytes).skip(1) {
            cell.store(*b, Ordering::Relaxed);
        }
        self.input[bytes.len()].store(0, Ordering::Relaxed);
        // first byte last, a non-empty first byte means complete input
        if let Some(first) = bytes.first() {
            self.input[0].store(*first, Ordering::Release);
        }
        true
    }

    /// Outcome of the last evaluation, valid until the thread resumes.
    pub fn outcome(&self) -> EvalOutcome {
        EvalOutcome {
            result: self.result.load(Ordering::Acquire),
            exc_type: self.exc_type.load(Ordering::Acquire),
            exc_value: self.exc_value.load(Ordering::Acquire),
            exc_str: self.exc_str.load(Ordering::Acquire),
        }
    }

    fn publish(&self, outcome: &EvalOutcome) {
        self.result.store(outcome.result, Ordering::Release);
        self.exc_type.store(outcome.exc_type, Ordering::Release);
        self.exc_value.store(outcome.exc_value, Ordering::Release);
        self.exc_str.store(outcome.exc_str, Ordering::Release);
    }

    /// Move pending input into `buf` and clear it.
    fn take_input<'b>(&self, buf: &'b mut [u8; EVAL_INPUT_SIZE]) -> Option<&'b CStr> {
        let first = self.input[0].load(Ordering::Acquire);
        if first == 0 {
            return None;
        }
        buf[0] = first;
        for (i, cell) in self.input.iter().enumerate().skip(1) {
            buf[i] = cell.load(Ordering::Relaxed);
            if buf[i] == 0 {
                break;
            }
        }
        buf[EVAL_INPUT_SIZE - 1] = 0;
        self.input[0].store(0, Ordering::Release);
        CStr::from_bytes_until_nul(&buf[..]).ok()
    }

    /// Announce `thread` stopped in `frame` through `stopped`, then evaluate
    /// expressions until the controller resumes without one.
    pub fn serve(
        &self,
        thread: u64,
        frame: *mut c_void,
        hook: &impl TraceHook,
        stopped: impl FnOnce(),
    ) {
        self.frame.store(frame, Ordering::Release);
        self.thread.store(thread, Ordering::Release);
        stopped();

        let mut buf = [0u8; EVAL_INPUT_SIZE];
        while let Some(source) = self.take_input(&mut buf) {
            self.thread.store(0, Ordering::Release);
            let outcome = hook.evaluate(frame, source);
            self.publish(&outcome);
            self.thread.store(thread, Ordering::Release);
            hook.eval_complete();

            self.publish(&EvalOutcome::default());
            for object in outcome.objects() {
                if !object.is_null() {
                    hook.release(object);
                }
            }
        }

        self.thread.store(0, Ordering::Release);
        self.frame.store(ptr::null_mut(), Ordering::Release);
    }
}
