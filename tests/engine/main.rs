mod abi;
mod breakpoints;
mod common;
mod release;
mod steps;

use crate::common::{FakeFrame, TestHook};
use pystalker::engine::trace::breakpoint::BreakpointTable;
use pystalker::engine::trace::{TraceEvent, TraceState};

#[test]
fn test_breakpoint_hits_in_simulated_thread() {
    let state = TraceState::new();
    state.set_breakpoints(
        BreakpointTable::builder()
            .insert(10, "a.py")
            .insert(20, "a.py")
            .build(),
    );

    let hook = TestHook::default();
    let mut hit_lines = vec![];
    for line in [5, 10, 15, 20, 25] {
        let before = hook.hits.get();
        state.dispatch(1, TraceEvent::Line, &FakeFrame::at("a.py", line), &hook);
        if hook.hits.get() > before {
            let location = state.last_location();
            assert_eq!(location.file, "a.py");
            hit_lines.push(location.line);
        }
    }

    assert_eq!(hook.hits.get(), 2);
    assert_eq!(hit_lines, vec![10, 20]);
}

#[test]
fn test_other_files_and_events_do_not_hit() {
    let state = TraceState::new();
    state.set_breakpoints(BreakpointTable::builder().insert(10, "a.py").build());
    let hook = TestHook::default();

    state.dispatch(1, TraceEvent::Line, &FakeFrame::at("b.py", 10), &hook);
    state.dispatch(1, TraceEvent::Call, &FakeFrame::at("a.py", 10), &hook);
    state.dispatch(1, TraceEvent::CCall, &FakeFrame::at("a.py", 10), &hook);
    state.dispatch(1, TraceEvent::Line, &FakeFrame::at("a.py", 11), &hook);
    state.dispatch(1, TraceEvent::Line, &FakeFrame::at("a.py", -1), &hook);
    assert_eq!(hook.hits.get(), 0);

    state.dispatch(1, TraceEvent::Line, &FakeFrame::at("a.py", 10), &hook);
    assert_eq!(hook.hits.get(), 1);
}

#[test]
fn test_no_table_no_hits() {
    let state = TraceState::new();
    let hook = TestHook::default();
    state.dispatch(1, TraceEvent::Line, &FakeFrame::at("a.py", 10), &hook);
    assert_eq!(hook.hits.get(), 0);
}
