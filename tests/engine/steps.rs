use crate::common::{FakeFrame, TestHook};
use pystalker::engine::trace::breakpoint::BreakpointTable;
use pystalker::engine::trace::step::{StepKind, Stepper};
use pystalker::engine::trace::{
    notify, pystalker_clear_step, pystalker_step, TraceEvent, TraceHook, TraceState,
    PYSTALKER_TRACE,
};
use serial_test::serial;
use std::ffi::c_void;

const THREAD: u64 = 42;
const OTHER: u64 = 43;

fn frame() -> FakeFrame {
    FakeFrame::at("a.py", 10)
}

#[test]
fn test_step_into_completes_on_call() {
    let state = TraceState::new();
    let hook = TestHook::default();
    state.stepper.arm(StepKind::Into, THREAD);

    state.dispatch(THREAD, TraceEvent::Call, &frame(), &hook);
    assert_eq!(hook.completions.get(), 1);
    assert_eq!(state.stepper.kind(), StepKind::None);

    // nothing more after completion
    state.dispatch(THREAD, TraceEvent::Call, &frame(), &hook);
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.completions.get(), 1);
}

#[test]
fn test_step_over_completes_on_line_of_owning_thread() {
    let state = TraceState::new();
    let hook = TestHook::default();
    state.stepper.arm(StepKind::Over, THREAD);

    state.dispatch(OTHER, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.completions.get(), 0);
    assert_eq!(state.stepper.kind(), StepKind::Over);

    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.completions.get(), 1);
    assert_eq!(state.stepper.kind(), StepKind::None);
}

#[test]
fn test_step_over_skips_nested_lines() {
    let state = TraceState::new();
    let hook = TestHook::default();
    state.stepper.arm(StepKind::Over, THREAD);

    state.dispatch(THREAD, TraceEvent::Call, &frame(), &hook);
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.completions.get(), 0);

    state.dispatch(THREAD, TraceEvent::Return, &frame(), &hook);
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.completions.get(), 1);
}

#[test]
fn test_step_over_falls_through_once() {
    let stepper = Stepper::new();
    stepper.arm(StepKind::Over, THREAD);
    stepper.on_call(THREAD);
    assert_eq!(stepper.depth(), 1);

    let state = TraceState::new();
    let hook = TestHook::default();
    state.stepper.arm(StepKind::Over, THREAD);
    state.dispatch(THREAD, TraceEvent::Call, &frame(), &hook);
    assert_eq!(state.stepper.depth(), 1);

    state.dispatch(THREAD, TraceEvent::Return, &frame(), &hook);
    assert_eq!(state.stepper.depth(), 0);
    assert_eq!(hook.fallthroughs.get(), 0);

    state.dispatch(THREAD, TraceEvent::Return, &frame(), &hook);
    assert_eq!(state.stepper.depth(), -1);
    assert_eq!(hook.fallthroughs.get(), 1);

    // deeper unwinding does not fire again
    state.dispatch(THREAD, TraceEvent::Return, &frame(), &hook);
    assert_eq!(hook.fallthroughs.get(), 1);
}

#[test]
fn test_pending_step_suppresses_breakpoints() {
    let state = TraceState::new();
    state.set_breakpoints(BreakpointTable::builder().insert(10, "a.py").build());
    let hook = TestHook::default();

    state.stepper.arm(StepKind::Over, THREAD);
    state.dispatch(THREAD, TraceEvent::Call, &frame(), &hook);
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.hits.get(), 0);

    // other threads still hit
    state.dispatch(OTHER, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.hits.get(), 1);

    state.stepper.clear();
    state.dispatch(THREAD, TraceEvent::Line, &frame(), &hook);
    assert_eq!(hook.hits.get(), 2);
}

struct NotifyingHook;

impl TraceHook for NotifyingHook {
    fn release(&self, _: *mut c_void) {}
}

#[test]
#[serial]
fn test_exported_step_control() {
    assert_eq!(pystalker_step(99, THREAD), -1);
    assert_eq!(pystalker_step(StepKind::Into as i32, THREAD), 0);
    assert_eq!(PYSTALKER_TRACE.stepper.kind(), StepKind::Into);

    let (_, completions_before, _) = notify::counters();
    PYSTALKER_TRACE.dispatch(THREAD, TraceEvent::Line, &frame(), &NotifyingHook);
    let (_, completions_after, _) = notify::counters();
    assert_eq!(completions_after - completions_before, 1);

    assert_eq!(pystalker_step(StepKind::Out as i32, THREAD), 0);
    pystalker_clear_step();
    assert_eq!(PYSTALKER_TRACE.stepper.kind(), StepKind::None);
}
