//! Thin futex wrappers. Safe to call from a signal handler.

use nix::libc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Futex scope: `Private` for words shared by threads of this process,
/// `Shared` for words in shared memory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scope {
    Private,
    Shared,
}

impl Scope {
    fn op(self, op: libc::c_int) -> libc::c_int {
        match self {
            Scope::Private => op | libc::FUTEX_PRIVATE_FLAG,
            Scope::Shared => op,
        }
    }
}

/// Sleep while `word` equals `expected`, at most `timeout` if given.
/// Spurious wakeups are possible, callers re-check the word.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>, scope: Scope) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(std::ptr::null());

    // SAFETY: `word` is a valid aligned u32 for the duration of the call
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            scope.op(libc::FUTEX_WAIT),
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        );
    }
}

/// Wake every waiter of `word`.
pub fn wake_all(word: &AtomicU32, scope: Scope) {
    // SAFETY: see `wait`
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            scope.op(libc::FUTEX_WAKE),
            libc::c_int::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        );
    }
}
