//! Attached interpreters and their native trace trampolines.
//!
//! Function pointers handed to the interpreter can not carry context, so every
//! registry slot owns one instantiation of each trampoline and the trampoline
//! finds its [`InterpreterHandle`] by slot index.

use crate::engine::abi::{Field, Layout};
use crate::engine::discovery::{Module, Probe};
use crate::engine::error::Error;
use crate::engine::frame::{ObjectReader, RawFrame};
use crate::engine::object::{ObjectRef, SavedError};
use crate::engine::runtime::{EvalFrameFn, Obj, RuntimeApi, TraceFn, PY_EVAL_INPUT};
use crate::engine::trace::eval::EvalOutcome;
use crate::engine::trace::{TraceEvent, TraceHook, PYSTALKER_TRACE};
use crate::version::RuntimeVersion;
use crate::{ps_debug, weak_error};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Maximum number of interpreters attached in one process.
pub const MAX_INTERPRETERS: usize = 10;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: OnceLock<InterpreterHandle> = OnceLock::new();
static INTERPRETERS: [OnceLock<InterpreterHandle>; MAX_INTERPRETERS] = [EMPTY_SLOT; MAX_INTERPRETERS];
static REGISTRATION: Mutex<()> = Mutex::new(());

/// Upper bound of thread state list walks.
const MAX_WALK: usize = 100_000;

#[derive(Clone, Copy)]
struct ChainLookup {
    generation: u64,
    tstate: usize,
    func: Option<TraceFn>,
}

thread_local! {
    /// Thread state this OS thread was last seen with by the eval-frame hook.
    static SEEN_THREAD_STATE: Cell<usize> = const { Cell::new(0) };
    static IN_INSTALL: Cell<bool> = const { Cell::new(false) };
    /// Last chained trace function lookup of this thread.
    static LAST_CHAIN_LOOKUP: Cell<ChainLookup> = const {
        Cell::new(ChainLookup {
            generation: 0,
            tstate: 0,
            func: None,
        })
    };
}

/// Source of [`ChainedTraces`] generations, unique across interpreters.
static CHAIN_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Trace functions installed before ours, by thread state address.
struct ChainedTraces {
    funcs: Mutex<HashMap<usize, TraceFn>>,
    any: AtomicBool,
    /// Changes with every update, invalidates the lookups cached by threads.
    generation: AtomicU64,
}

impl ChainedTraces {
    fn new() -> Self {
        Self {
            funcs: Mutex::new(HashMap::new()),
            any: AtomicBool::new(false),
            generation: AtomicU64::new(CHAIN_GENERATION.fetch_add(1, Ordering::Relaxed)),
        }
    }

    fn bump(&self) {
        self.generation.store(
            CHAIN_GENERATION.fetch_add(1, Ordering::Relaxed),
            Ordering::Release,
        );
    }

    fn set(&self, tstate: usize, prev: Option<TraceFn>) {
        let mut funcs = lock(&self.funcs);
        match prev {
            Some(prev) => {
                funcs.insert(tstate, prev);
                self.any.store(true, Ordering::SeqCst);
            }
            None => {
                funcs.remove(&tstate);
            }
        }
        self.bump();
    }

    /// Drop entries of thread states not in `live`, return how many were dropped.
    fn retain(&self, live: &HashSet<usize>) -> usize {
        let mut funcs = lock(&self.funcs);
        let before = funcs.len();
        funcs.retain(|tstate, _| live.contains(tstate));
        let removed = before - funcs.len();
        if removed > 0 {
            self.bump();
        }
        removed
    }

    fn get(&self, tstate: usize) -> Option<TraceFn> {
        if !self.any.load(Ordering::Relaxed) {
            return None;
        }
        let generation = self.generation.load(Ordering::Acquire);
        LAST_CHAIN_LOOKUP.with(|last| {
            let cached = last.get();
            if cached.generation == generation && cached.tstate == tstate {
                return cached.func;
            }
            let func = lock(&self.funcs).get(&tstate).copied();
            last.set(ChainLookup {
                generation,
                tstate,
                func,
            });
            func
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.funcs).len()
    }
}

/// Address of an interpreter object kept alive for the whole process lifetime.
#[derive(Clone, Copy, Debug)]
pub struct Leaked(usize);

impl Leaked {
    pub fn new(object: ObjectRef) -> Self {
        Self(object.into_raw() as usize)
    }

    pub fn as_ptr(self) -> Obj {
        self.0 as Obj
    }
}

/// One attached interpreter runtime.
pub struct InterpreterHandle {
    slot: usize,
    identity: usize,
    module: Module,
    pub api: RuntimeApi,
    pub reader: ObjectReader,
    /// `new_external_thread` of the bootstrap script, set once attach succeeded.
    external_thread_hook: OnceLock<Leaked>,
    chained: ChainedTraces,
    default_eval: OnceLock<EvalFrameFn>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Return an attached interpreter or register a new one.
pub fn register(
    module: Module,
    probe: &Probe,
    api: RuntimeApi,
    layout: &'static Layout,
) -> Result<&'static InterpreterHandle, Error> {
    let _guard = lock(&REGISTRATION);

    if let Some(existing) = find(probe.identity) {
        return Ok(existing);
    }
    let slot = INTERPRETERS
        .iter()
        .position(|s| s.get().is_none())
        .ok_or(Error::TooManyInterpreters(MAX_INTERPRETERS))?;

    let reader = ObjectReader::new(layout, api.unicode_type, api.bytes_type, api.unicode_units);
    let handle = InterpreterHandle {
        slot,
        identity: probe.identity,
        module,
        api,
        reader,
        external_thread_hook: OnceLock::new(),
        chained: ChainedTraces::new(),
        default_eval: OnceLock::new(),
    };
    _ = INTERPRETERS[slot].set(handle);
    INTERPRETERS[slot]
        .get()
        .ok_or(Error::TooManyInterpreters(MAX_INTERPRETERS))
}

/// Find an attached interpreter by the address of its `Py_IsInitialized`.
pub fn find(identity: usize) -> Option<&'static InterpreterHandle> {
    INTERPRETERS
        .iter()
        .filter_map(|s| s.get())
        .find(|h| h.identity == identity)
}

pub fn attached() -> impl Iterator<Item = &'static InterpreterHandle> {
    INTERPRETERS.iter().filter_map(|s| s.get())
}

/// Native thread id of the calling thread.
pub fn native_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

struct NativeHook<'a> {
    api: &'a RuntimeApi,
    reader: &'a ObjectReader,
}

impl TraceHook for NativeHook<'_> {
    fn release(&self, object: *mut c_void) {
        unsafe { (self.api.decref)(object) }
    }

    fn evaluate(&self, frame: *mut c_void, source: &CStr) -> EvalOutcome {
        let api = self.api;
        let Some(run_string) = api.run_string else {
            return EvalOutcome::default();
        };
        if frame.is_null() {
            return EvalOutcome::default();
        }

        // SAFETY: runs on the traced thread inside its trace callback, `frame` is its current frame
        unsafe {
            if let Some(fast_to_locals) = api.frame_fast_to_locals {
                fast_to_locals(frame);
            }
            let globals: Obj = self
                .reader
                .read(frame, Field::FrameGlobals)
                .unwrap_or(ptr::null_mut());
            if globals.is_null() {
                return EvalOutcome::default();
            }
            let locals: Obj = self
                .reader
                .read(frame, Field::FrameLocals)
                .filter(|l: &Obj| !l.is_null())
                .unwrap_or(globals);

            let _saved = SavedError::fetch(api);
            let mut outcome = EvalOutcome {
                result: run_string(
                    source.as_ptr(),
                    PY_EVAL_INPUT,
                    globals,
                    locals,
                    ptr::null_mut(),
                ),
                ..Default::default()
            };
            let mut traceback = ptr::null_mut();
            (api.err_fetch)(
                &mut outcome.exc_type,
                &mut outcome.exc_value,
                &mut traceback,
            );
            if !traceback.is_null() {
                (api.decref)(traceback);
            }
            if !outcome.exc_value.is_null() {
                outcome.exc_str = (api.object_str)(outcome.exc_value);
                if outcome.exc_str.is_null() {
                    (api.err_clear)();
                }
            }
            outcome
        }
    }
}

impl InterpreterHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn version(&self) -> RuntimeVersion {
        self.api.version
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn trace_trampoline(&self) -> TraceFn {
        TRACE_TRAMPOLINES[self.slot]
    }

    pub fn set_external_thread_hook(&self, hook: Leaked) {
        _ = self.external_thread_hook.set(hook);
    }

    /// True if the trace function of `tstate` is our trampoline.
    ///
    /// # Safety
    ///
    /// `tstate` must be a live thread state.
    pub unsafe fn is_installed(&self, tstate: Obj) -> bool {
        self.reader
            .read::<usize>(tstate, Field::ThreadTraceFunc)
            .is_some_and(|func| func == self.trace_trampoline() as usize)
    }

    /// Wrap the trace function of the current thread state into the native trampoline.
    /// The previous function keeps being called after ours, with its own trace object.
    ///
    /// # Safety
    ///
    /// GIL must be held and `tstate` must be the current thread state.
    pub unsafe fn hook_current_thread(&self, tstate: Obj) {
        let ours = self.trace_trampoline();
        let func: usize = self
            .reader
            .read(tstate, Field::ThreadTraceFunc)
            .unwrap_or_default();
        let obj: Obj = self
            .reader
            .read(tstate, Field::ThreadTraceObj)
            .unwrap_or(ptr::null_mut());

        if func != ours as usize {
            // SAFETY: non-null `c_tracefunc` is a `Py_tracefunc`
            let prev = (func != 0).then(|| std::mem::transmute::<usize, TraceFn>(func));
            self.chained.set(tstate as usize, prev);
            (self.api.set_trace)(Some(ours), obj);
        }
        self.forget_ended_threads();
    }

    /// Remove chained functions of thread states that left every interpreter.
    unsafe fn forget_ended_threads(&self) {
        let api = &self.api;
        let Some(interpreter_next) = api.interpreter_next else {
            return;
        };
        let mut live = HashSet::new();
        let mut interp = (api.interpreter_head)();
        while !interp.is_null() && live.len() < MAX_WALK {
            let mut tstate = (api.thread_head)(interp);
            while !tstate.is_null() && live.len() < MAX_WALK {
                live.insert(tstate as usize);
                tstate = (api.thread_next)(tstate);
            }
            interp = interpreter_next(interp);
        }
        let removed = self.chained.retain(&live);
        if removed > 0 {
            ps_debug!(target: "install", "forgot {removed} ended thread(s)");
        }
    }

    unsafe fn on_trace(&self, obj: Obj, frame: Obj, what: c_int, arg: Obj) -> c_int {
        if let Some(event) = TraceEvent::from_repr(what) {
            let raw = RawFrame::new(&self.reader, frame);
            PYSTALKER_TRACE.dispatch(
                native_thread_id(),
                event,
                &raw,
                &NativeHook {
                    api: &self.api,
                    reader: &self.reader,
                },
            );
        }

        match self.chained.get(self.api.current_thread() as usize) {
            Some(prev) => prev(obj, frame, what, arg),
            None => 0,
        }
    }

    /// Replace the frame evaluator of `interp` with the trampoline of this slot.
    ///
    /// # Safety
    ///
    /// GIL must be held.
    pub unsafe fn install_eval_hook(&self, interp: Obj) -> bool {
        let Some(eval) = self.api.eval_frame else {
            return false;
        };
        let default = (eval.get)(interp);
        let ours = EVAL_TRAMPOLINES[self.slot];
        if default as usize == ours as usize {
            return true;
        }
        if self.default_eval.set(default).is_err() {
            return false;
        }
        (eval.set)(interp, ours);
        ps_debug!(target: "install", "eval frame hook installed into interpreter {}", self.slot);
        true
    }

    /// First frame evaluated by a thread unknown to the attach walk: let the script
    /// set up its tracer, then wrap it.
    unsafe fn on_eval_frame(&self, tstate: Obj, frame: Obj, throw_flag: c_int) -> Obj {
        let seen = SEEN_THREAD_STATE.with(|s| s.replace(tstate as usize)) == tstate as usize;
        if !seen && !IN_INSTALL.with(|f| f.get()) && !self.is_installed(tstate) {
            if let Some(hook) = self.external_thread_hook.get() {
                IN_INSTALL.with(|f| f.set(true));
                self.install_external(tstate, *hook);
                IN_INSTALL.with(|f| f.set(false));
            }
        }

        match self.default_eval.get() {
            Some(default) => default(tstate, frame, throw_flag),
            None => ptr::null_mut(),
        }
    }

    unsafe fn install_external(&self, tstate: Obj, hook: Leaked) {
        let _saved = SavedError::fetch(&self.api);
        (self.api.set_trace)(None, ptr::null_mut());
        let Some(callable) = ObjectRef::borrowed(&self.api, hook.as_ptr()) else {
            return;
        };
        if weak_error!(callable.call("new_external_thread", &[])).is_some() {
            self.hook_current_thread(tstate);
        }
    }
}

unsafe extern "C" fn trace_trampoline<const SLOT: usize>(
    obj: Obj,
    frame: Obj,
    what: c_int,
    arg: Obj,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| match INTERPRETERS[SLOT].get() {
        Some(handle) => handle.on_trace(obj, frame, what, arg),
        None => 0,
    }))
    .unwrap_or(0)
}

unsafe extern "C" fn eval_frame_trampoline<const SLOT: usize>(
    tstate: Obj,
    frame: Obj,
    throw_flag: c_int,
) -> Obj {
    catch_unwind(AssertUnwindSafe(|| match INTERPRETERS[SLOT].get() {
        Some(handle) => handle.on_eval_frame(tstate, frame, throw_flag),
        None => ptr::null_mut(),
    }))
    .unwrap_or(ptr::null_mut())
}

static TRACE_TRAMPOLINES: [TraceFn; MAX_INTERPRETERS] = [
    trace_trampoline::<0>,
    trace_trampoline::<1>,
    trace_trampoline::<2>,
    trace_trampoline::<3>,
    trace_trampoline::<4>,
    trace_trampoline::<5>,
    trace_trampoline::<6>,
    trace_trampoline::<7>,
    trace_trampoline::<8>,
    trace_trampoline::<9>,
];

static EVAL_TRAMPOLINES: [EvalFrameFn; MAX_INTERPRETERS] = [
    eval_frame_trampoline::<0>,
    eval_frame_trampoline::<1>,
    eval_frame_trampoline::<2>,
    eval_frame_trampoline::<3>,
    eval_frame_trampoline::<4>,
    eval_frame_trampoline::<5>,
    eval_frame_trampoline::<6>,
    eval_frame_trampoline::<7>,
    eval_frame_trampoline::<8>,
    eval_frame_trampoline::<9>,
];
