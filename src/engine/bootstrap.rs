//! Make sure an interpreter has multi-threading initialized before the debugger
//! script is loaded into it.
//!
//! When no code is running, threading is initialized right here with every other
//! thread suspended. When some thread holds the interpreter, initialization is
//! deferred to that thread through a pending call. A thread interrupted inside
//! `Py_AddPendingCall` is resumed at once, the call is not reentrant on old versions.

use crate::engine::error::Error;
use crate::engine::runtime::RuntimeApi;
use crate::engine::suspend::{Suspension, ThreadControl, ThreadList};
use crate::{ps_debug, ps_warn};
use std::ffi::{c_int, c_void};
use std::ops::Range;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Longest wait for the deferred call between two suspension cycles.
const CYCLE_WAIT: Duration = Duration::from_millis(50);

/// Thread listings per cycle. A process that keeps starting threads faster than
/// they are suspended never gets initialized directly.
const MAX_SUSPEND_PASSES: usize = 16;

/// Interpreter operations used by the bootstrap.
pub trait ThreadingRuntime {
    fn threads_initialized(&self) -> bool;

    /// True if some thread currently holds the interpreter.
    fn has_current_thread(&self) -> bool;

    /// Code range of `Py_AddPendingCall`.
    fn pending_call_range(&self) -> Range<usize>;

    /// True if pending calls may be added while other threads run.
    fn thread_safe_pending_calls(&self) -> bool;

    /// Initialize threading from the calling thread. Other threads are suspended.
    fn init_directly(&self);

    /// Enqueue a call that initializes threading and notifies `signal`.
    fn schedule_init(&self, signal: &'static InitSignal) -> bool;

    fn lower_switch_interval(&self) -> Option<u64>;

    fn restore_switch_interval(&self, value: u64);
}

/// Completion flag of the deferred initialization.
pub struct InitSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl InitSignal {
    pub const fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    /// Wait until notified or `timeout` elapses. Return true if notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *done
    }
}

impl Default for InitSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal of the pending call. It may run long after a timed out bootstrap
/// returned, so it lives for the whole process.
pub static INIT_SIGNAL: InitSignal = InitSignal::new();

pub struct Bootstrap<'a, R: ThreadingRuntime, C: ThreadControl> {
    runtime: &'a R,
    control: &'a mut C,
    signal: &'static InitSignal,
    timeout: Duration,
    lower_interval: bool,
}

impl<'a, R: ThreadingRuntime, C: ThreadControl> Bootstrap<'a, R, C> {
    pub fn new(runtime: &'a R, control: &'a mut C, signal: &'static InitSignal) -> Self {
        Self {
            runtime,
            control,
            signal,
            timeout: Duration::from_secs(20),
            lower_interval: true,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_interval_lowering(self, lower_interval: bool) -> Self {
        Self {
            lower_interval,
            ..self
        }
    }

    /// Return when threading is initialized, or [`Error::Timeout`].
    pub fn run(self) -> Result<(), Error> {
        if self.runtime.threads_initialized() {
            return Ok(());
        }
        ps_debug!(target: "bootstrap", "interpreter threading is not initialized");

        let saved_interval = if self.lower_interval {
            self.runtime.lower_switch_interval()
        } else {
            None
        };
        let runtime = self.runtime;
        let result = self.cycles();
        if let Some(interval) = saved_interval {
            runtime.restore_switch_interval(interval);
        }
        result
    }

    fn cycles(self) -> Result<(), Error> {
        let Bootstrap {
            runtime,
            control,
            signal,
            timeout,
            ..
        } = self;
        let deadline = Instant::now() + timeout;
        let pending_range = runtime.pending_call_range();

        let mut scheduled = false;
        if runtime.thread_safe_pending_calls() {
            scheduled = runtime.schedule_init(signal);
        }

        loop {
            if runtime.threads_initialized() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                ps_warn!(target: "bootstrap", "threading initialization timed out");
                return Err(Error::Timeout);
            }

            let mut suspended = ThreadList::new();
            let mut handled = ThreadList::new();
            let mut all_parked = true;

            let mute = crate::log::mute();
            let mut failure = None;
            // threads may start while others are being suspended, list again until no new ones show up
            'passes: for pass in 0..=MAX_SUSPEND_PASSES {
                if pass == MAX_SUSPEND_PASSES {
                    all_parked = false;
                    break;
                }
                let fresh: ThreadList = match control.threads() {
                    Ok(threads) => threads
                        .into_iter()
                        .filter(|tid| !handled.contains(tid))
                        .collect(),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                if fresh.is_empty() {
                    break;
                }

                for tid in fresh {
                    handled.push(tid);
                    match control.suspend(tid) {
                        Ok(Suspension::Parked { ip }) if pending_range.contains(&ip) => {
                            control.resume(tid);
                            all_parked = false;
                        }
                        Ok(Suspension::Parked { .. }) => suspended.push(tid),
                        Ok(Suspension::Unacknowledged) => all_parked = false,
                        Ok(Suspension::Gone) => {}
                        Err(e) => {
                            failure = Some(e);
                            break 'passes;
                        }
                    }
                }
            }

            if failure.is_none() && !runtime.threads_initialized() {
                if all_parked && !runtime.has_current_thread() {
                    runtime.init_directly();
                } else if all_parked && !scheduled {
                    scheduled = runtime.schedule_init(signal);
                }
            }

            for &tid in &suspended {
                control.resume(tid);
            }
            drop(mute);

            if let Some(e) = failure {
                return Err(e);
            }
            ps_debug!(
                target: "bootstrap",
                "cycle done: {} of {} threads suspended, pending call scheduled: {scheduled}",
                suspended.len(),
                handled.len()
            );

            if !runtime.threads_initialized() {
                let left = deadline.saturating_duration_since(Instant::now());
                signal.wait(left.min(CYCLE_WAIT));
            }
        }
    }
}

/// [`ThreadingRuntime`] over a real interpreter.
pub struct NativeRuntime<'a> {
    api: &'a RuntimeApi,
}

impl<'a> NativeRuntime<'a> {
    pub fn new(api: &'a RuntimeApi) -> Self {
        Self { api }
    }
}

unsafe extern "C" fn init_threads_pending(arg: *mut c_void) -> c_int {
    let api = &*(arg as *const RuntimeApi);
    (api.init_threads)();
    INIT_SIGNAL.notify();
    0
}

impl ThreadingRuntime for NativeRuntime<'static> {
    fn threads_initialized(&self) -> bool {
        self.api.threads_initialized()
    }

    fn has_current_thread(&self) -> bool {
        !self.api.current_thread().is_null()
    }

    fn pending_call_range(&self) -> Range<usize> {
        self.api.pending_call_range()
    }

    fn thread_safe_pending_calls(&self) -> bool {
        self.api.version.thread_safe_pending_calls()
    }

    fn init_directly(&self) {
        let api = self.api;
        let version = api.version;
        // SAFETY: nobody else runs interpreter code, every other thread is suspended
        unsafe {
            if version.needs_thread_state_for_init() {
                if let Some(thread_state_new) = api.thread_state_new {
                    let interp = (api.interpreter_head)();
                    if !interp.is_null() {
                        (api.thread_swap)(thread_state_new(interp));
                    }
                }
            } else if version.gil_state_init() {
                (api.gil_ensure)();
            }

            (api.init_threads)();

            if version.gil_state_init() {
                (api.save_thread)();
            } else {
                (api.release_lock)();
            }
        }
    }

    fn schedule_init(&self, signal: &'static InitSignal) -> bool {
        debug_assert!(std::ptr::eq(signal, &INIT_SIGNAL));
        let arg = self.api as *const RuntimeApi as *mut c_void;
        // SAFETY: api is 'static, the callback runs on an interpreter thread
        unsafe { (self.api.add_pending_call)(init_threads_pending, arg) == 0 }
    }

    fn lower_switch_interval(&self) -> Option<u64> {
        self.api.lower_switch_interval()
    }

    fn restore_switch_interval(&self, value: u64) {
        self.api.restore_switch_interval(value)
    }
}
