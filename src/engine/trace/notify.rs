//! Functions an external debugger sets native breakpoints on.
//!
//! Each body touches its own counter so the linker can not fold them into one address.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};

static BREAKPOINT_HITS: AtomicU64 = AtomicU64::new(0);
static STEP_COMPLETIONS: AtomicU64 = AtomicU64::new(0);
static STEP_FALLTHROUGHS: AtomicU64 = AtomicU64::new(0);
static EVAL_COMPLETIONS: AtomicU64 = AtomicU64::new(0);

#[no_mangle]
#[inline(never)]
pub extern "C" fn pystalker_on_breakpoint_hit() {
    black_box(BREAKPOINT_HITS.fetch_add(1, Ordering::SeqCst));
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn pystalker_on_step_complete() {
    black_box(STEP_COMPLETIONS.fetch_add(1, Ordering::SeqCst));
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn pystalker_on_step_fallthrough() {
    black_box(STEP_FALLTHROUGHS.fetch_add(1, Ordering::SeqCst));
}

/// Outcome of an evaluation is ready in [`super::eval::EvalCell`].
#[no_mangle]
#[inline(never)]
pub extern "C" fn pystalker_on_eval_complete() {
    black_box(EVAL_COMPLETIONS.fetch_add(1, Ordering::SeqCst));
}

/// Notification counters: (breakpoint hits, step completions, step fall-throughs).
pub fn counters() -> (u64, u64, u64) {
    (
        BREAKPOINT_HITS.load(Ordering::SeqCst),
        STEP_COMPLETIONS.load(Ordering::SeqCst),
        STEP_FALLTHROUGHS.load(Ordering::SeqCst),
    )
}

pub fn eval_completions() -> u64 {
    EVAL_COMPLETIONS.load(Ordering::SeqCst)
}
