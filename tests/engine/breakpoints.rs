use crate::common::{FakeFrame, TestHook};
use pystalker::engine::trace::breakpoint::{BreakpointBuffer, BreakpointTable};
use pystalker::engine::trace::{
    notify, pystalker_set_breakpoints, BreakpointEntry, TraceEvent, TraceHook, PYSTALKER_TRACE,
};
use serial_test::serial;
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn test_table_round_trip() {
    let pairs = [
        (1, "main.py"),
        (10, "a.py"),
        (10, "b.py"),
        (11, "a.py"),
        (300, "pkg/mod.py"),
        (300, "a.py"),
    ];
    let mut builder = BreakpointTable::builder();
    for (line, file) in pairs {
        builder.insert(line, file);
    }
    let table = builder.build();

    for (line, file) in pairs {
        assert!(table.contains(line, file), "{file}:{line}");
    }
    assert!(!table.contains(10, "c.py"));
    assert!(!table.contains(2, "main.py"));
    assert!(!table.contains(301, "a.py"));
    assert!(!table.contains(0, "a.py"));
    assert_eq!(table.max_line(), 300);

    let mut at_ten: Vec<_> = table.sources(10).collect();
    at_ten.sort();
    assert_eq!(at_ten, vec!["a.py", "b.py"]);
}

/// Table for generation `g`: `g` files at line `g`, each named after `g`.
fn generation_table(g: u32) -> BreakpointTable {
    let mut builder = BreakpointTable::builder();
    for i in 0..g {
        builder.insert(g, format!("gen{g}_{i}.py"));
    }
    builder.build()
}

#[test]
fn test_reader_never_sees_mixed_table() {
    let buffer = Arc::new(BreakpointBuffer::new());
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let buffer = buffer.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut polls = 0u64;
            while !stop.load(Ordering::SeqCst) {
                buffer.read(|table| {
                    let Some(table) = table else {
                        return;
                    };
                    let g = table.max_line();
                    let sources: Vec<_> = table.sources(g).collect();
                    assert_eq!(sources.len(), g as usize);
                    for (i, name) in sources.iter().enumerate() {
                        assert!(name.starts_with(&format!("gen{g}_")), "{name} in gen {g}");
                        assert!(table.contains(g, &format!("gen{g}_{i}.py")));
                    }
                });
                polls += 1;
            }
            polls
        })
    };

    for g in 1..=2000 {
        buffer.publish(generation_table(g % 16 + 1));
    }
    stop.store(true, Ordering::SeqCst);
    let polls = reader.join().unwrap();
    assert!(polls > 0);
    assert_eq!(buffer.polls(), polls);
}

#[test]
fn test_writer_alternates_slots() {
    let buffer = BreakpointBuffer::new();
    buffer.publish(generation_table(1));
    let first = buffer.current_slot();
    buffer.read(|t| assert_eq!(t.map(|t| t.max_line()), Some(1)));

    buffer.publish(generation_table(2));
    assert_ne!(buffer.current_slot(), first);
    buffer.read(|t| assert_eq!(t.map(|t| t.max_line()), Some(2)));

    buffer.publish(generation_table(3));
    buffer.read(|t| assert_eq!(t.map(|t| t.max_line()), Some(3)));
}

/// Counts notifications through the exported functions.
struct NotifyingHook;

impl TraceHook for NotifyingHook {
    fn release(&self, _: *mut c_void) {}
}

#[test]
#[serial]
fn test_exported_breakpoint_control() {
    let files = [CString::new("a.py").unwrap(), CString::new("b.py").unwrap()];
    let entries = [
        BreakpointEntry {
            line: 10,
            file: files[0].as_ptr(),
        },
        BreakpointEntry {
            line: 20,
            file: files[1].as_ptr(),
        },
        BreakpointEntry {
            line: 30,
            file: std::ptr::null(),
        },
    ];
    assert_eq!(
        unsafe { pystalker_set_breakpoints(entries.as_ptr(), entries.len()) },
        0
    );

    let (hits_before, _, _) = notify::counters();
    PYSTALKER_TRACE.dispatch(3, TraceEvent::Line, &FakeFrame::at("b.py", 20), &NotifyingHook);
    PYSTALKER_TRACE.dispatch(3, TraceEvent::Line, &FakeFrame::at("a.py", 30), &NotifyingHook);
    let (hits_after, _, _) = notify::counters();
    assert_eq!(hits_after - hits_before, 1);
    assert_eq!(PYSTALKER_TRACE.last_location().file, "b.py");
    assert_eq!(PYSTALKER_TRACE.last_location().line, 20);

    // empty table clears everything
    assert_eq!(unsafe { pystalker_set_breakpoints(std::ptr::null(), 0) }, 0);
    let hook = TestHook::default();
    PYSTALKER_TRACE.dispatch(3, TraceEvent::Line, &FakeFrame::at("b.py", 20), &hook);
    assert_eq!(hook.hits.get(), 0);
}
