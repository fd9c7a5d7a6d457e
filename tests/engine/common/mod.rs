use pystalker::engine::trace::{TraceFrame, TraceHook};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;

/// Frame of a simulated interpreter thread.
pub struct FakeFrame {
    pub line: i32,
    pub file: &'static str,
}

impl FakeFrame {
    pub fn at(file: &'static str, line: i32) -> Self {
        Self { line, file }
    }
}

impl TraceFrame for FakeFrame {
    fn line(&self) -> i32 {
        self.line
    }

    fn file_is(&self, name: &str) -> bool {
        self.file == name
    }
}

/// Records notifications instead of calling the exported notification functions.
#[derive(Default)]
pub struct TestHook {
    pub hits: Cell<u32>,
    pub completions: Cell<u32>,
    pub fallthroughs: Cell<u32>,
    pub released: RefCell<Vec<usize>>,
}

impl TraceHook for TestHook {
    fn release(&self, object: *mut c_void) {
        self.released.borrow_mut().push(object as usize);
    }

    fn breakpoint_hit(&self) {
        self.hits.set(self.hits.get() + 1);
    }

    fn step_complete(&self) {
        self.completions.set(self.completions.get() + 1);
    }

    fn step_fallthrough(&self) {
        self.fallthroughs.set(self.fallthroughs.get() + 1);
    }
}

/// Fake object address, never dereferenced.
pub fn obj(n: usize) -> *mut c_void {
    (n * 16) as *mut c_void
}
