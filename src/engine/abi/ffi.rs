//! Mirrors of interpreter structures, release build flavor.
//! Only the leading fields up to the last one the engine reads are declared.

use std::ffi::{c_char, c_int, c_long, c_uint, c_ulong, c_void};

pub type PyPtr = *mut c_void;

#[repr(C)]
pub struct PyObjectHead {
    pub ob_refcnt: isize,
    pub ob_type: PyPtr,
}

/// Extra header of objects in `Py_TRACE_REFS` (debug) builds, placed before `PyObjectHead`.
#[repr(C)]
pub struct PyTraceRefsHead {
    pub _ob_next: PyPtr,
    pub _ob_prev: PyPtr,
}

#[repr(C)]
pub struct PyVarObjectHead {
    pub ob_base: PyObjectHead,
    pub ob_size: isize,
}

// ----------------------------------------- code objects ------------------------------------------

#[repr(C)]
pub struct PyCode25_27 {
    pub ob_base: PyObjectHead,
    pub co_argcount: c_int,
    pub co_nlocals: c_int,
    pub co_stacksize: c_int,
    pub co_flags: c_int,
    pub co_code: PyPtr,
    pub co_consts: PyPtr,
    pub co_names: PyPtr,
    pub co_varnames: PyPtr,
    pub co_freevars: PyPtr,
    pub co_cellvars: PyPtr,
    pub co_filename: PyPtr,
    pub co_name: PyPtr,
    pub co_firstlineno: c_int,
    pub co_lnotab: PyPtr,
}

#[repr(C)]
pub struct PyCode30_32 {
    pub ob_base: PyObjectHead,
    pub co_argcount: c_int,
    pub co_kwonlyargcount: c_int,
    pub co_nlocals: c_int,
    pub co_stacksize: c_int,
    pub co_flags: c_int,
    pub co_code: PyPtr,
    pub co_consts: PyPtr,
    pub co_names: PyPtr,
    pub co_varnames: PyPtr,
    pub co_freevars: PyPtr,
    pub co_cellvars: PyPtr,
    pub co_filename: PyPtr,
    pub co_name: PyPtr,
    pub co_firstlineno: c_int,
    pub co_lnotab: PyPtr,
}

#[repr(C)]
pub struct PyCode33_35 {
    pub ob_base: PyObjectHead,
    pub co_argcount: c_int,
    pub co_kwonlyargcount: c_int,
    pub co_nlocals: c_int,
    pub co_stacksize: c_int,
    pub co_flags: c_int,
    pub co_code: PyPtr,
    pub co_consts: PyPtr,
    pub co_names: PyPtr,
    pub co_varnames: PyPtr,
    pub co_freevars: PyPtr,
    pub co_cellvars: PyPtr,
    pub co_cell2arg: *mut u8,
    pub co_filename: PyPtr,
    pub co_name: PyPtr,
    pub co_firstlineno: c_int,
    pub co_lnotab: PyPtr,
}

/// 3.6 and 3.7 (`co_cell2arg` changed its pointee type only).
#[repr(C)]
pub struct PyCode36_37 {
    pub ob_base: PyObjectHead,
    pub co_argcount: c_int,
    pub co_kwonlyargcount: c_int,
    pub co_nlocals: c_int,
    pub co_stacksize: c_int,
    pub co_flags: c_int,
    pub co_firstlineno: c_int,
    pub co_code: PyPtr,
    pub co_consts: PyPtr,
    pub co_names: PyPtr,
    pub co_varnames: PyPtr,
    pub co_freevars: PyPtr,
    pub co_cellvars: PyPtr,
    pub co_cell2arg: PyPtr,
    pub co_filename: PyPtr,
    pub co_name: PyPtr,
    pub co_lnotab: PyPtr,
}

#[repr(C)]
pub struct PyCode38_310 {
    pub ob_base: PyObjectHead,
    pub co_argcount: c_int,
    pub co_posonlyargcount: c_int,
    pub co_kwonlyargcount: c_int,
    pub co_nlocals: c_int,
    pub co_stacksize: c_int,
    pub co_flags: c_int,
    pub co_firstlineno: c_int,
    pub co_code: PyPtr,
    pub co_consts: PyPtr,
    pub co_names: PyPtr,
    pub co_varnames: PyPtr,
    pub co_freevars: PyPtr,
    pub co_cellvars: PyPtr,
    pub co_cell2arg: PyPtr,
    pub co_filename: PyPtr,
    pub co_name: PyPtr,
    pub co_linetable: PyPtr,
}

// ----------------------------------------- frames ------------------------------------------------

#[repr(C)]
pub struct PyFrameHead {
    pub ob_base: PyVarObjectHead,
    pub f_back: PyPtr,
    pub f_code: PyPtr,
    pub f_builtins: PyPtr,
    pub f_globals: PyPtr,
    pub f_locals: PyPtr,
    pub f_valuestack: PyPtr,
}

#[repr(C)]
pub struct PyFrame25_33 {
    pub head: PyFrameHead,
    pub f_stacktop: PyPtr,
    pub f_trace: PyPtr,
    pub f_exc_type: PyPtr,
    pub f_exc_value: PyPtr,
    pub f_exc_traceback: PyPtr,
    pub f_tstate: PyPtr,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
}

#[repr(C)]
pub struct PyFrame34_36 {
    pub head: PyFrameHead,
    pub f_stacktop: PyPtr,
    pub f_trace: PyPtr,
    pub f_exc_type: PyPtr,
    pub f_exc_value: PyPtr,
    pub f_exc_traceback: PyPtr,
    pub f_gen: PyPtr,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
}

#[repr(C)]
pub struct PyFrame37_39 {
    pub head: PyFrameHead,
    pub f_stacktop: PyPtr,
    pub f_trace: PyPtr,
    pub f_trace_lines: c_char,
    pub f_trace_opcodes: c_char,
    pub f_gen: PyPtr,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
}

#[repr(C)]
pub struct PyFrame310 {
    pub head: PyFrameHead,
    pub f_trace: PyPtr,
    pub f_stackdepth: c_int,
    pub f_trace_lines: c_char,
    pub f_trace_opcodes: c_char,
    pub f_gen: PyPtr,
    pub f_lasti: c_int,
    pub f_lineno: c_int,
}

// ----------------------------------------- thread states -----------------------------------------

#[repr(C)]
pub struct PyThreadState25_27 {
    pub next: PyPtr,
    pub interp: PyPtr,
    pub frame: PyPtr,
    pub recursion_depth: c_int,
    pub tracing: c_int,
    pub use_tracing: c_int,
    pub c_profilefunc: PyPtr,
    pub c_tracefunc: PyPtr,
    pub c_profileobj: PyPtr,
    pub c_traceobj: PyPtr,
    pub curexc_type: PyPtr,
    pub curexc_value: PyPtr,
    pub curexc_traceback: PyPtr,
    pub exc_type: PyPtr,
    pub exc_value: PyPtr,
    pub exc_traceback: PyPtr,
    pub dict: PyPtr,
    pub tick_counter: c_int,
    pub gilstate_counter: c_int,
    pub async_exc: PyPtr,
    pub thread_id: c_long,
}

#[repr(C)]
pub struct PyThreadState30_33 {
    pub next: PyPtr,
    pub interp: PyPtr,
    pub frame: PyPtr,
    pub recursion_depth: c_int,
    pub overflowed: c_char,
    pub recursion_critical: c_char,
    pub tracing: c_int,
    pub use_tracing: c_int,
    pub c_profilefunc: PyPtr,
    pub c_tracefunc: PyPtr,
    pub c_profileobj: PyPtr,
    pub c_traceobj: PyPtr,
    pub curexc_type: PyPtr,
    pub curexc_value: PyPtr,
    pub curexc_traceback: PyPtr,
    pub exc_type: PyPtr,
    pub exc_value: PyPtr,
    pub exc_traceback: PyPtr,
    pub dict: PyPtr,
    pub tick_counter: c_int,
    pub gilstate_counter: c_int,
    pub async_exc: PyPtr,
    pub thread_id: c_long,
}

#[repr(C)]
pub struct PyThreadState34_36 {
    pub prev: PyPtr,
    pub next: PyPtr,
    pub interp: PyPtr,
    pub frame: PyPtr,
    pub recursion_depth: c_int,
    pub overflowed: c_char,
    pub recursion_critical: c_char,
    pub tracing: c_int,
    pub use_tracing: c_int,
    pub c_profilefunc: PyPtr,
    pub c_tracefunc: PyPtr,
    pub c_profileobj: PyPtr,
    pub c_traceobj: PyPtr,
    pub curexc_type: PyPtr,
    pub curexc_value: PyPtr,
    pub curexc_traceback: PyPtr,
    pub exc_type: PyPtr,
    pub exc_value: PyPtr,
    pub exc_traceback: PyPtr,
    pub dict: PyPtr,
    pub gilstate_counter: c_int,
    pub async_exc: PyPtr,
    pub thread_id: c_long,
}

#[repr(C)]
pub struct PyErrStackItem {
    pub exc_type: PyPtr,
    pub exc_value: PyPtr,
    pub exc_traceback: PyPtr,
    pub previous_item: PyPtr,
}

#[repr(C)]
pub struct PyThreadState37_39 {
    pub prev: PyPtr,
    pub next: PyPtr,
    pub interp: PyPtr,
    pub frame: PyPtr,
    pub recursion_depth: c_int,
    pub overflowed: c_char,
    pub recursion_critical: c_char,
    pub stackcheck_counter: c_int,
    pub tracing: c_int,
    pub use_tracing: c_int,
    pub c_profilefunc: PyPtr,
    pub c_tracefunc: PyPtr,
    pub c_profileobj: PyPtr,
    pub c_traceobj: PyPtr,
    pub curexc_type: PyPtr,
    pub curexc_value: PyPtr,
    pub curexc_traceback: PyPtr,
    pub exc_state: PyErrStackItem,
    pub exc_info: PyPtr,
    pub dict: PyPtr,
    pub gilstate_counter: c_int,
    pub async_exc: PyPtr,
    pub thread_id: c_ulong,
}

#[repr(C)]
pub struct PyThreadState310 {
    pub prev: PyPtr,
    pub next: PyPtr,
    pub interp: PyPtr,
    pub frame: PyPtr,
    pub recursion_depth: c_int,
    pub recursion_headroom: c_int,
    pub stackcheck_counter: c_int,
    pub tracing: c_int,
    pub cframe: PyPtr,
    pub c_profilefunc: PyPtr,
    pub c_tracefunc: PyPtr,
    pub c_profileobj: PyPtr,
    pub c_traceobj: PyPtr,
    pub curexc_type: PyPtr,
    pub curexc_value: PyPtr,
    pub curexc_traceback: PyPtr,
    pub exc_state: PyErrStackItem,
    pub exc_info: PyPtr,
    pub dict: PyPtr,
    pub gilstate_counter: c_int,
    pub async_exc: PyPtr,
    pub thread_id: c_ulong,
}

// ----------------------------------------- strings -----------------------------------------------

/// `str` of 2.x, `bytes` of 3.x.
#[repr(C)]
pub struct PyBytesObject {
    pub ob_base: PyVarObjectHead,
    pub ob_shash: c_long,
    pub ob_sstate: c_int,
    pub ob_sval: [c_char; 1],
}

/// Unicode object before PEP 393 (2.x, 3.0 - 3.2).
#[repr(C)]
pub struct PyUnicodeLegacy {
    pub ob_base: PyObjectHead,
    pub length: isize,
    pub str: PyPtr,
    pub hash: c_long,
}

/// Base of every unicode object since 3.3.
#[repr(C)]
pub struct PyAsciiObject {
    pub ob_base: PyObjectHead,
    pub length: isize,
    pub hash: isize,
    pub state: c_uint,
    pub wstr: PyPtr,
}

#[repr(C)]
pub struct PyCompactUnicodeObject {
    pub base: PyAsciiObject,
    pub utf8_length: isize,
    pub utf8: *mut c_char,
    pub wstr_length: isize,
}

#[repr(C)]
pub struct PyUnicodeObject {
    pub base: PyCompactUnicodeObject,
    pub data: *mut c_void,
}

/// Bit layout of `PyAsciiObject::state`.
pub mod unicode_state {
    pub const KIND_SHIFT: u32 = 2;
    pub const KIND_MASK: u32 = 0b111;
    pub const COMPACT: u32 = 1 << 5;
    pub const ASCII: u32 = 1 << 6;
    pub const READY: u32 = 1 << 7;
}
