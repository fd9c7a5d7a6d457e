//! Suspension of the other threads of this process.
//!
//! A suspended thread sits in a real-time signal handler, parked on a futex word
//! of its slot. The handler reports the interrupted instruction pointer so the
//! caller can tell whether the thread was stopped inside a given code range.
//! Nothing here allocates or logs between suspend and resume, thread listing included.

use crate::engine::error::Error;
use crate::engine::futex::{self, Scope};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{self, getpid, gettid};
use smallvec::SmallVec;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const MAX_SLOTS: usize = 512;
const SNAPSHOT_ATTEMPTS: usize = 8;
const RESUME_WAIT: Duration = Duration::from_millis(500);

/// Native thread ids. Sized so that listing never touches the heap.
pub type ThreadList = SmallVec<[i32; MAX_SLOTS]>;

/// Result of one suspend request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Suspension {
    /// Thread is parked, interrupted at `ip`.
    Parked { ip: usize },
    /// Thread did not acknowledge in time, its state is unknown.
    Unacknowledged,
    /// Thread exited before it could be signalled.
    Gone,
}

/// Operations the bootstrap needs on the other threads of the process.
pub trait ThreadControl {
    /// Native ids of every thread but the caller.
    fn threads(&mut self) -> Result<ThreadList, Error>;

    fn suspend(&mut self, tid: i32) -> Result<Suspension, Error>;

    /// Resume a thread for which [`ThreadControl::suspend`] returned [`Suspension::Parked`].
    fn resume(&mut self, tid: i32);
}

/// Low byte of a slot word, the rest is the generation of the request.
mod slot_state {
    pub const FREE: u32 = 0;
    pub const REQUESTED: u32 = 1;
    /// Handler owns the request and is about to publish the ip.
    pub const PARKING: u32 = 2;
    pub const PARKED: u32 = 3;
    pub const RESUMED: u32 = 4;
    pub const CANCELLED: u32 = 5;
}

static GENERATION: AtomicU32 = AtomicU32::new(1);

fn pack(generation: u32, state: u32) -> u32 {
    (generation << 8) | state
}

fn state_of(word: u32) -> u32 {
    word & 0xff
}

fn with_state(word: u32, state: u32) -> u32 {
    (word & !0xff) | state
}

struct Slot {
    tid: AtomicI32,
    word: AtomicU32,
    ip: AtomicUsize,
}

impl Slot {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Slot = Slot {
        tid: AtomicI32::new(0),
        word: AtomicU32::new(slot_state::FREE),
        ip: AtomicUsize::new(0),
    };

    /// Take a free slot for `tid`, returns the word of the new request.
    fn claim(&self, tid: i32) -> Option<u32> {
        if state_of(self.word.load(Ordering::Acquire)) != slot_state::FREE {
            return None;
        }
        self.tid
            .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let generation = GENERATION.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        let word = pack(generation, slot_state::REQUESTED);
        self.word.store(word, Ordering::Release);
        Some(word)
    }

    /// Request word addressed to `tid`, if there is one outstanding.
    fn observe(&self, tid: i32) -> Option<u32> {
        let word = self.word.load(Ordering::Acquire);
        (state_of(word) == slot_state::REQUESTED && self.tid.load(Ordering::Acquire) == tid)
            .then_some(word)
    }

    /// Park on the request seen by [`Slot::observe`]. Fails if that request was
    /// cancelled meanwhile, even when the slot already serves another thread.
    fn park(&self, observed: u32, ip: usize) -> bool {
        if self
            .word
            .compare_exchange(
                observed,
                with_state(observed, slot_state::PARKING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.ip.store(ip, Ordering::Release);
        self.word
            .store(with_state(observed, slot_state::PARKED), Ordering::Release);
        futex::wake_all(&self.word, Scope::Private);
        true
    }

    /// Withdraw an unanswered request and free the slot.
    fn cancel(&self, requested: u32) -> bool {
        let cancelled = self
            .word
            .compare_exchange(
                requested,
                with_state(requested, slot_state::CANCELLED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if cancelled {
            self.tid.store(0, Ordering::Release);
            self.word
                .store(with_state(requested, slot_state::FREE), Ordering::Release);
        }
        cancelled
    }

    fn release(&self) {
        self.tid.store(0, Ordering::Release);
    }
}

static SLOTS: [Slot; MAX_SLOTS] = [Slot::EMPTY; MAX_SLOTS];

// nix::sys::signal::Signal has no real-time members, so the handler is installed through libc.
fn suspend_signal() -> libc::c_int {
    libc::SIGRTMIN() + 3
}

extern "C" fn on_suspend_signal(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    let Some((slot, observed)) = SLOTS
        .iter()
        .find_map(|s| s.observe(tid).map(|word| (s, word)))
    else {
        return;
    };

    let ip = if ctx.is_null() {
        0
    } else {
        // SAFETY: kernel passes a valid `ucontext_t` to SA_SIGINFO handlers
        (unsafe { (*(ctx as *const libc::ucontext_t)).uc_mcontext.gregs[libc::REG_RIP as usize] })
            as usize
    };
    if !slot.park(observed, ip) {
        // request was cancelled
        return;
    }

    let parked = with_state(observed, slot_state::PARKED);
    while slot.word.load(Ordering::Acquire) == parked {
        futex::wait(&slot.word, parked, None, Scope::Private);
    }
    slot.word
        .store(with_state(observed, slot_state::FREE), Ordering::Release);
    futex::wake_all(&slot.word, Scope::Private);
}

/// Suspends threads with a real-time signal. The previous handler of the signal
/// is restored on drop.
pub struct SignalThreads {
    ack_timeout: Duration,
    previous: libc::sigaction,
}

impl SignalThreads {
    pub fn new(ack_timeout: Duration) -> Result<Self, Error> {
        // SAFETY: zeroed sigaction is a valid "default" action value
        let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
        action.sa_sigaction = on_suspend_signal as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        let mut previous: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };

        // SAFETY: both pointers are valid, handler only uses async-signal-safe calls
        let res = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(suspend_signal(), &action, &mut previous)
        };
        Errno::result(res).map_err(Error::Suspend)?;

        Ok(Self {
            ack_timeout,
            previous,
        })
    }

    fn slot_of(tid: i32) -> Option<&'static Slot> {
        SLOTS.iter().find(|s| s.tid.load(Ordering::Acquire) == tid)
    }
}

impl Drop for SignalThreads {
    fn drop(&mut self) {
        unsafe { libc::sigaction(suspend_signal(), &self.previous, std::ptr::null_mut()) };
    }
}

/// Native ids of the threads of this process except the caller. The listing is
/// retried until two consecutive reads agree.
pub fn list_threads() -> Result<ThreadList, Error> {
    let me = gettid().as_raw();
    let mut last = read_task_dir(me)?;
    for _ in 0..SNAPSHOT_ATTEMPTS {
        let current = read_task_dir(me)?;
        if current == last {
            return Ok(current);
        }
        last = current;
    }
    Ok(last)
}

/// One pass over `/proc/self/task` with `getdents64` into a stack buffer.
fn read_task_dir(exclude: i32) -> Result<ThreadList, Error> {
    let fd = fcntl::open(
        "/proc/self/task",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(Error::Suspend)?;
    let tids = read_dirents(fd, exclude);
    let _ = unistd::close(fd);
    let mut tids = tids?;
    tids.sort_unstable();
    Ok(tids)
}

fn read_dirents(fd: i32, exclude: i32) -> Result<ThreadList, Error> {
    // linux_dirent64: d_ino u64, d_off i64, d_reclen u16, d_type u8, d_name
    const RECLEN_AT: usize = 16;
    const NAME_AT: usize = 19;

    let mut tids = ThreadList::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
        let n = Errno::result(n).map_err(Error::Suspend)? as usize;
        if n == 0 {
            return Ok(tids);
        }

        let mut offset = 0;
        while offset + NAME_AT <= n {
            let reclen =
                u16::from_ne_bytes([buf[offset + RECLEN_AT], buf[offset + RECLEN_AT + 1]]) as usize;
            if reclen == 0 {
                break;
            }
            let name = &buf[offset + NAME_AT..(offset + reclen).min(n)];
            let name = name.split(|&b| b == 0).next().unwrap_or_default();
            if let Some(tid) = parse_tid(name) {
                if tid != exclude {
                    if tids.len() == tids.inline_size() {
                        return Err(Error::Suspend(Errno::EAGAIN));
                    }
                    tids.push(tid);
                }
            }
            offset += reclen;
        }
    }
}

fn parse_tid(name: &[u8]) -> Option<i32> {
    if name.is_empty() {
        return None;
    }
    name.iter().try_fold(0i32, |acc, &b| {
        let digit = (b as char).to_digit(10)?;
        acc.checked_mul(10)?.checked_add(digit as i32)
    })
}

impl ThreadControl for SignalThreads {
    fn threads(&mut self) -> Result<ThreadList, Error> {
        list_threads()
    }

    fn suspend(&mut self, tid: i32) -> Result<Suspension, Error> {
        let (slot, requested) = SLOTS
            .iter()
            .find_map(|s| s.claim(tid).map(|word| (s, word)))
            .ok_or(Error::Suspend(Errno::EAGAIN))?;

        let res = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                getpid().as_raw(),
                tid,
                suspend_signal(),
            )
        };
        if let Err(errno) = Errno::result(res) {
            slot.cancel(requested);
            return match errno {
                Errno::ESRCH => Ok(Suspension::Gone),
                e => Err(Error::Suspend(e)),
            };
        }

        let parked = with_state(requested, slot_state::PARKED);
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let word = slot.word.load(Ordering::Acquire);
            if word == parked {
                return Ok(Suspension::Parked {
                    ip: slot.ip.load(Ordering::Acquire),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            futex::wait(&slot.word, word, Some(deadline - now), Scope::Private);
        }

        if slot.cancel(requested) {
            // a late signal finds no request for it and returns at once
            return Ok(Suspension::Unacknowledged);
        }
        // handler took the request just now, the ip follows shortly
        loop {
            let word = slot.word.load(Ordering::Acquire);
            if word == parked {
                return Ok(Suspension::Parked {
                    ip: slot.ip.load(Ordering::Acquire),
                });
            }
            futex::wait(&slot.word, word, None, Scope::Private);
        }
    }

    fn resume(&mut self, tid: i32) {
        let Some(slot) = Self::slot_of(tid) else {
            return;
        };
        let word = slot.word.load(Ordering::Acquire);
        if state_of(word) != slot_state::PARKED {
            slot.release();
            return;
        }
        let resumed = with_state(word, slot_state::RESUMED);
        slot.word.store(resumed, Ordering::Release);
        futex::wake_all(&slot.word, Scope::Private);

        let deadline = Instant::now() + RESUME_WAIT;
        while slot.word.load(Ordering::Acquire) == resumed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            futex::wait(&slot.word, resumed, Some(deadline - now), Scope::Private);
        }
        slot.release();
    }
}
