//! Reference decrements deferred until the trace callback can run destructors safely.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct PendingRelease {
    object: AtomicPtr<c_void>,
    next: *mut PendingRelease,
}

/// Lock-free stack of owned object references.
///
/// Any thread may push, the trace callback drains. A drain takes the whole list
/// with one atomic swap, so every node is claimed by exactly one drain.
pub struct ReleaseQueue {
    head: AtomicPtr<PendingRelease>,
}

impl Default for ReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Take ownership of one reference. Null objects are ignored.
    pub fn push(&self, object: *mut c_void) {
        if object.is_null() {
            return;
        }

        let node = Box::into_raw(Box::new(PendingRelease {
            object: AtomicPtr::new(object),
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: node is not yet shared
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Release every queued reference, return the number released.
    ///
    /// `release` may push new entries or drain again, entries pushed meanwhile
    /// go to the next drain.
    pub fn drain(&self, mut release: impl FnMut(*mut c_void)) -> usize {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut released = 0;

        while !node.is_null() {
            // SAFETY: the swap above made this drain the single owner of the list
            let pending = unsafe { Box::from_raw(node) };
            node = pending.next;
            let object = pending.object.swap(ptr::null_mut(), Ordering::AcqRel);
            drop(pending);

            if !object.is_null() {
                release(object);
                released += 1;
            }
        }
        released
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        // references still queued are leaked, there is no runtime to release them into
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !node.is_null() {
            let pending = unsafe { Box::from_raw(node) };
            node = pending.next;
        }
    }
}
