//! Interpreter entry points resolved by symbol name.

use crate::engine::abi::UnicodeUnits;
use crate::engine::discovery::Module;
use crate::engine::error::Error;
use crate::version::RuntimeVersion;
use std::ffi::{c_char, c_int, c_long, c_ulong, c_ulonglong, c_void};

/// Any interpreter object or state pointer.
pub type Obj = *mut c_void;

pub type TraceFn = unsafe extern "C" fn(Obj, Obj, c_int, Obj) -> c_int;
pub type PendingCallFn = unsafe extern "C" fn(*mut c_void) -> c_int;
/// PEP 523 evaluator with a thread state argument (3.9+).
pub type EvalFrameFn = unsafe extern "C" fn(Obj, Obj, c_int) -> Obj;

/// `Py_file_input` start token of `Py_CompileString`.
pub const PY_FILE_INPUT: c_int = 257;
/// `Py_eval_input`, a single expression.
pub const PY_EVAL_INPUT: c_int = 258;

/// Size of the code range of `Py_AddPendingCall` treated as "inside the call".
pub const PENDING_CALL_CODE_SIZE: usize = 0x100;

/// How to read the current thread state.
#[derive(Clone, Copy)]
pub enum CurrentThread {
    Getter(unsafe extern "C" fn() -> Obj),
    Variable(*mut Obj),
}

/// How to read and change the bytecode switch interval.
#[derive(Clone, Copy)]
pub enum SwitchInterval {
    /// `_Py_CheckInterval`, bytecodes between switches (< 3.2).
    Check(*mut c_int),
    /// Microseconds (3.2+).
    Interval {
        get: unsafe extern "C" fn() -> c_ulong,
        set: unsafe extern "C" fn(c_ulong),
    },
    Unavailable,
}

#[derive(Clone, Copy)]
pub struct EvalFrameApi {
    pub get: unsafe extern "C" fn(Obj) -> EvalFrameFn,
    pub set: unsafe extern "C" fn(Obj, EvalFrameFn),
}

/// Entry points of one interpreter.
pub struct RuntimeApi {
    pub version: RuntimeVersion,

    pub is_initialized: unsafe extern "C" fn() -> c_int,
    pub add_pending_call: unsafe extern "C" fn(PendingCallFn, *mut c_void) -> c_int,
    pub interpreter_head: unsafe extern "C" fn() -> Obj,
    pub interpreter_next: Option<unsafe extern "C" fn(Obj) -> Obj>,
    pub thread_head: unsafe extern "C" fn(Obj) -> Obj,
    pub thread_next: unsafe extern "C" fn(Obj) -> Obj,
    pub thread_swap: unsafe extern "C" fn(Obj) -> Obj,
    pub thread_state_new: Option<unsafe extern "C" fn(Obj) -> Obj>,
    pub current_thread: CurrentThread,

    pub gil_ensure: unsafe extern "C" fn() -> c_int,
    pub gil_release: unsafe extern "C" fn(c_int),
    pub init_threads: unsafe extern "C" fn(),
    pub threads_initialized: unsafe extern "C" fn() -> c_int,
    pub release_lock: unsafe extern "C" fn(),
    pub save_thread: unsafe extern "C" fn() -> Obj,
    pub interval: SwitchInterval,

    /// Thread-local key value API, holds the `PyGILState` thread state of each thread.
    pub tls_get: Option<unsafe extern "C" fn(c_int) -> Obj>,
    pub tls_set: Option<unsafe extern "C" fn(c_int, Obj) -> c_int>,
    pub tls_delete: Option<unsafe extern "C" fn(c_int)>,

    pub set_trace: unsafe extern "C" fn(Option<TraceFn>, Obj),
    pub eval_frame: Option<EvalFrameApi>,

    pub incref: unsafe extern "C" fn(Obj),
    pub decref: unsafe extern "C" fn(Obj),
    pub compile_string: unsafe extern "C" fn(*const c_char, *const c_char, c_int) -> Obj,
    pub eval_code: unsafe extern "C" fn(Obj, Obj, Obj) -> Obj,
    pub run_string: Option<unsafe extern "C" fn(*const c_char, c_int, Obj, Obj, *mut c_void) -> Obj>,
    pub frame_fast_to_locals: Option<unsafe extern "C" fn(Obj)>,
    pub dict_new: unsafe extern "C" fn() -> Obj,
    pub dict_get_item_string: unsafe extern "C" fn(Obj, *const c_char) -> Obj,
    pub dict_set_item_string: unsafe extern "C" fn(Obj, *const c_char, Obj) -> c_int,
    pub get_builtins: unsafe extern "C" fn() -> Obj,
    pub import_module: unsafe extern "C" fn(*const c_char) -> Obj,
    pub getattr_string: unsafe extern "C" fn(Obj, *const c_char) -> Obj,
    pub setattr_string: unsafe extern "C" fn(Obj, *const c_char, Obj) -> c_int,
    pub call_object: unsafe extern "C" fn(Obj, Obj) -> Obj,
    pub tuple_new: unsafe extern "C" fn(isize) -> Obj,
    pub tuple_set_item: unsafe extern "C" fn(Obj, isize, Obj) -> c_int,
    pub int_from_long: unsafe extern "C" fn(c_long) -> Obj,
    pub int_from_u64: unsafe extern "C" fn(c_ulonglong) -> Obj,
    pub bool_from_long: unsafe extern "C" fn(c_long) -> Obj,
    pub string_from: unsafe extern "C" fn(*const c_char) -> Obj,
    pub as_utf8: Option<unsafe extern "C" fn(Obj) -> *const c_char>,
    pub object_repr: unsafe extern "C" fn(Obj) -> Obj,
    pub object_str: unsafe extern "C" fn(Obj) -> Obj,
    pub err_occurred: unsafe extern "C" fn() -> Obj,
    pub err_fetch: unsafe extern "C" fn(*mut Obj, *mut Obj, *mut Obj),
    pub err_restore: unsafe extern "C" fn(Obj, Obj, Obj),
    pub err_clear: unsafe extern "C" fn(),

    pub none: Obj,
    pub unicode_type: usize,
    pub unicode_units: UnicodeUnits,
    pub bytes_type: usize,
    /// Stackless `PyCFrame_Type`, frames of this type are not real frames.
    pub cframe_type: Option<usize>,
    pub pending_call_addr: usize,
}

// SAFETY: entry points are plain code and static data addresses.
unsafe impl Send for RuntimeApi {}
unsafe impl Sync for RuntimeApi {}

macro_rules! require {
    ($module: expr, $name: literal) => {
        // SAFETY: field types match the interpreter's public API for every supported version
        unsafe { $module.require($name)? }
    };
}

macro_rules! optional {
    ($module: expr, $name: literal) => {
        // SAFETY: see `require!`
        unsafe { $module.symbol($name) }
    };
}

impl RuntimeApi {
    /// Resolve every entry point the engine calls. Missing required symbols are
    /// [`Error::MissingEntryPoint`].
    pub fn resolve(module: &Module, version: RuntimeVersion) -> Result<Self, Error> {
        let current_thread = match optional!(module, "_PyThreadState_UncheckedGet") {
            Some(getter) => CurrentThread::Getter(getter),
            None => CurrentThread::Variable(
                optional!(module, "_PyThreadState_Current")
                    .ok_or(Error::MissingEntryPoint("_PyThreadState_Current"))?,
            ),
        };

        let interval = if version.has_switch_interval() {
            match (
                optional!(module, "_PyEval_GetSwitchInterval"),
                optional!(module, "_PyEval_SetSwitchInterval"),
            ) {
                (Some(get), Some(set)) => SwitchInterval::Interval { get, set },
                _ => SwitchInterval::Unavailable,
            }
        } else {
            optional!(module, "_Py_CheckInterval")
                .map(SwitchInterval::Check)
                .unwrap_or(SwitchInterval::Unavailable)
        };

        let eval_frame = if version.has_eval_frame_hook() {
            match (
                optional!(module, "_PyInterpreterState_GetEvalFrameFunc"),
                optional!(module, "_PyInterpreterState_SetEvalFrameFunc"),
            ) {
                (Some(get), Some(set)) => Some(EvalFrameApi { get, set }),
                _ => None,
            }
        } else {
            None
        };

        // narrow and wide builds export differently named unicode functions
        let unicode_units = if module.address("PyUnicodeUCS2_FromUnicode").is_some() {
            UnicodeUnits::Ucs2
        } else {
            UnicodeUnits::Ucs4
        };

        let (int_from_long, string_from, bytes_type, as_utf8) = if !version.is_py3() {
            (
                require!(module, "PyInt_FromLong"),
                require!(module, "PyString_FromString"),
                require!(module, "PyString_Type"),
                optional!(module, "PyString_AsString"),
            )
        } else if version.has_compact_unicode() {
            (
                require!(module, "PyLong_FromLong"),
                require!(module, "PyUnicode_FromString"),
                require!(module, "PyBytes_Type"),
                optional!(module, "PyUnicode_AsUTF8"),
            )
        } else {
            let (string_from, as_utf8) = match unicode_units {
                UnicodeUnits::Ucs2 => (
                    require!(module, "PyUnicodeUCS2_FromString"),
                    optional!(module, "_PyUnicodeUCS2_AsString"),
                ),
                UnicodeUnits::Ucs4 => (
                    require!(module, "PyUnicodeUCS4_FromString"),
                    optional!(module, "_PyUnicodeUCS4_AsString"),
                ),
            };
            (
                require!(module, "PyLong_FromLong"),
                string_from,
                require!(module, "PyBytes_Type"),
                as_utf8,
            )
        };

        let add_pending_call: unsafe extern "C" fn(PendingCallFn, *mut c_void) -> c_int =
            require!(module, "Py_AddPendingCall");

        Ok(Self {
            version,
            is_initialized: require!(module, "Py_IsInitialized"),
            add_pending_call,
            interpreter_head: require!(module, "PyInterpreterState_Head"),
            interpreter_next: optional!(module, "PyInterpreterState_Next"),
            thread_head: require!(module, "PyInterpreterState_ThreadHead"),
            thread_next: require!(module, "PyThreadState_Next"),
            thread_swap: require!(module, "PyThreadState_Swap"),
            thread_state_new: optional!(module, "PyThreadState_New"),
            current_thread,
            gil_ensure: require!(module, "PyGILState_Ensure"),
            gil_release: require!(module, "PyGILState_Release"),
            init_threads: require!(module, "PyEval_InitThreads"),
            threads_initialized: require!(module, "PyEval_ThreadsInitialized"),
            release_lock: require!(module, "PyEval_ReleaseLock"),
            save_thread: require!(module, "PyEval_SaveThread"),
            interval,
            tls_get: optional!(module, "PyThread_get_key_value"),
            tls_set: optional!(module, "PyThread_set_key_value"),
            tls_delete: optional!(module, "PyThread_delete_key_value"),
            set_trace: require!(module, "PyEval_SetTrace"),
            eval_frame,
            incref: require!(module, "Py_IncRef"),
            decref: require!(module, "Py_DecRef"),
            compile_string: require!(module, "Py_CompileString"),
            eval_code: require!(module, "PyEval_EvalCode"),
            run_string: optional!(module, "PyRun_StringFlags"),
            frame_fast_to_locals: optional!(module, "PyFrame_FastToLocals"),
            dict_new: require!(module, "PyDict_New"),
            dict_get_item_string: require!(module, "PyDict_GetItemString"),
            dict_set_item_string: require!(module, "PyDict_SetItemString"),
            get_builtins: require!(module, "PyEval_GetBuiltins"),
            import_module: require!(module, "PyImport_ImportModule"),
            getattr_string: require!(module, "PyObject_GetAttrString"),
            setattr_string: require!(module, "PyObject_SetAttrString"),
            call_object: require!(module, "PyObject_CallObject"),
            tuple_new: require!(module, "PyTuple_New"),
            tuple_set_item: require!(module, "PyTuple_SetItem"),
            int_from_long,
            int_from_u64: require!(module, "PyLong_FromUnsignedLongLong"),
            bool_from_long: require!(module, "PyBool_FromLong"),
            string_from,
            as_utf8,
            object_repr: require!(module, "PyObject_Repr"),
            object_str: require!(module, "PyObject_Str"),
            err_occurred: require!(module, "PyErr_Occurred"),
            err_fetch: require!(module, "PyErr_Fetch"),
            err_restore: require!(module, "PyErr_Restore"),
            err_clear: require!(module, "PyErr_Clear"),
            none: require!(module, "_Py_NoneStruct"),
            unicode_type: require!(module, "PyUnicode_Type"),
            unicode_units,
            bytes_type,
            cframe_type: optional!(module, "PyCFrame_Type"),
            pending_call_addr: add_pending_call as usize,
        })
    }

    /// Thread state that currently holds the interpreter, null if none.
    pub fn current_thread(&self) -> Obj {
        // SAFETY: both variants were resolved from the interpreter module
        unsafe {
            match self.current_thread {
                CurrentThread::Getter(get) => get(),
                CurrentThread::Variable(var) => std::ptr::read_volatile(var),
            }
        }
    }

    pub fn threads_initialized(&self) -> bool {
        unsafe { (self.threads_initialized)() != 0 }
    }

    /// Address range in which a thread is considered to be inside `Py_AddPendingCall`.
    pub fn pending_call_range(&self) -> std::ops::Range<usize> {
        self.pending_call_addr..self.pending_call_addr + PENDING_CALL_CODE_SIZE
    }

    /// Read the current interval, then lower it so that threads switch (and
    /// pending calls run) as fast as possible. Return the previous value.
    pub fn lower_switch_interval(&self) -> Option<u64> {
        // SAFETY: pointers and functions come from the interpreter module
        unsafe {
            match self.interval {
                SwitchInterval::Check(var) => {
                    let old = std::ptr::read_volatile(var);
                    std::ptr::write_volatile(var, -1);
                    Some(old as u64)
                }
                SwitchInterval::Interval { get, set } => {
                    let old = get();
                    set(0);
                    Some(old as u64)
                }
                SwitchInterval::Unavailable => None,
            }
        }
    }

    pub fn restore_switch_interval(&self, value: u64) {
        unsafe {
            match self.interval {
                SwitchInterval::Check(var) => std::ptr::write_volatile(var, value as c_int),
                SwitchInterval::Interval { set, .. } => set(value as c_ulong),
                SwitchInterval::Unavailable => {}
            }
        }
    }
}
