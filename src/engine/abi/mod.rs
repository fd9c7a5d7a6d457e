//! Field offsets of interpreter internals for every supported version and build flavor.
//!
//! Callers never see the mirror structures from [`ffi`], they ask a [`Layout`] for
//! the offset of a named [`Field`] and read raw memory through it.

pub mod ffi;

use crate::version::{RuntimeVersion, VersionTag};
use ffi::*;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::mem::{offset_of, size_of};
use std::str::FromStr;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter, EnumString, IntoStaticStr};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AbiError {
    #[error("interpreter version {0} is not supported, supported versions: {1}")]
    NotSupported(VersionTag, String),
    #[error("field `{0}` does not exist in interpreter {1}")]
    NoSuchField(Field, RuntimeVersion),
    #[error("unknown field name `{0}`")]
    UnknownFieldName(String),
}

/// Build flavor of an interpreter module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BuildFlavor {
    Release,
    /// `Py_TRACE_REFS` build, every object starts with two extra list pointers.
    Debug,
}

impl BuildFlavor {
    fn object_shift(self) -> usize {
        match self {
            BuildFlavor::Release => 0,
            BuildFlavor::Debug => size_of::<PyTraceRefsHead>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ObjectKind {
    Object,
    Code,
    Frame,
    Thread,
}

impl ObjectKind {
    /// Object kinds carry the debug header, thread states do not.
    fn is_heap_object(self) -> bool {
        !matches!(self, ObjectKind::Thread)
    }
}

/// Logical fields the engine reads or writes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    EnumIter,
    EnumCountMacro,
)]
pub enum Field {
    #[strum(serialize = "object.refcnt")]
    ObjectRefcnt,
    #[strum(serialize = "object.type")]
    ObjectType,
    #[strum(serialize = "object.size")]
    ObjectSize,
    #[strum(serialize = "code.filename")]
    CodeFilename,
    #[strum(serialize = "code.name")]
    CodeName,
    #[strum(serialize = "code.firstLineno")]
    CodeFirstLineno,
    #[strum(serialize = "frame.back")]
    FrameBack,
    #[strum(serialize = "frame.code")]
    FrameCode,
    #[strum(serialize = "frame.globals")]
    FrameGlobals,
    #[strum(serialize = "frame.locals")]
    FrameLocals,
    #[strum(serialize = "frame.trace")]
    FrameTrace,
    #[strum(serialize = "frame.lineno")]
    FrameLineno,
    #[strum(serialize = "frame.tstate")]
    FrameThreadState,
    #[strum(serialize = "thread.prev")]
    ThreadPrev,
    #[strum(serialize = "thread.next")]
    ThreadNext,
    #[strum(serialize = "thread.interp")]
    ThreadInterp,
    #[strum(serialize = "thread.frame")]
    ThreadFrame,
    #[strum(serialize = "thread.traceFunc")]
    ThreadTraceFunc,
    #[strum(serialize = "thread.traceObj")]
    ThreadTraceObj,
    #[strum(serialize = "thread.gilstateCounter")]
    ThreadGilstateCounter,
    #[strum(serialize = "thread.threadId")]
    ThreadId,
}

impl Field {
    pub fn kind(self) -> ObjectKind {
        match self {
            Field::ObjectRefcnt | Field::ObjectType | Field::ObjectSize => ObjectKind::Object,
            Field::CodeFilename | Field::CodeName | Field::CodeFirstLineno => ObjectKind::Code,
            Field::FrameBack
            | Field::FrameCode
            | Field::FrameGlobals
            | Field::FrameLocals
            | Field::FrameTrace
            | Field::FrameLineno
            | Field::FrameThreadState => ObjectKind::Frame,
            Field::ThreadPrev
            | Field::ThreadNext
            | Field::ThreadInterp
            | Field::ThreadFrame
            | Field::ThreadTraceFunc
            | Field::ThreadTraceObj
            | Field::ThreadGilstateCounter
            | Field::ThreadId => ObjectKind::Thread,
        }
    }
}

/// How string objects hold their characters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StringLayout {
    /// PEP 393 representation (3.3+).
    Compact {
        length: usize,
        state: usize,
        wstr: usize,
        wstr_length: usize,
        ascii_data: usize,
        compact_data: usize,
        data_ptr: usize,
    },
    /// Byte strings and fixed width unicode objects, see [`UnicodeUnits`].
    Legacy {
        bytes_size: usize,
        bytes_data: usize,
        unicode_length: usize,
        unicode_data: usize,
    },
}

/// Code unit of pre-3.3 unicode objects, chosen when the interpreter was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UnicodeUnits {
    Ucs2,
    Ucs4,
}

/// Offsets of one interpreter version and flavor.
#[derive(Debug, Clone)]
pub struct Layout {
    version: RuntimeVersion,
    flavor: BuildFlavor,
    offsets: [Option<usize>; Field::COUNT],
    strings: StringLayout,
}

impl Layout {
    pub fn version(&self) -> RuntimeVersion {
        self.version
    }

    pub fn flavor(&self) -> BuildFlavor {
        self.flavor
    }

    pub fn strings(&self) -> StringLayout {
        self.strings
    }

    /// Return a byte offset of a field relative to the start of its owning structure.
    pub fn field_offset(&self, field: Field) -> Result<usize, AbiError> {
        self.offsets[field as usize].ok_or(AbiError::NoSuchField(field, self.version))
    }

    /// Like [`Layout::field_offset`] but takes an owner kind and a field name: ("frame", "code").
    pub fn offset_of(&self, kind: ObjectKind, name: &str) -> Result<usize, AbiError> {
        let full = format!("{}.{name}", kind.to_string().to_lowercase());
        self.offset_by_name(&full)
    }

    /// Find offset by logical name like "frame.code" or "thread.threadId".
    pub fn offset_by_name(&self, name: &str) -> Result<usize, AbiError> {
        let field =
            Field::from_str(name).map_err(|_| AbiError::UnknownFieldName(name.to_string()))?;
        self.field_offset(field)
    }

    /// Fields present in this layout.
    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        Field::iter().filter(|f| self.offsets[*f as usize].is_some())
    }
}

/// Return the layout for a version tag, never a best guess.
pub fn resolve(tag: VersionTag, flavor: BuildFlavor) -> Result<&'static Layout, AbiError> {
    static LAYOUTS: Lazy<HashMap<(RuntimeVersion, BuildFlavor), Layout>> = Lazy::new(|| {
        RuntimeVersion::iter()
            .flat_map(|v| {
                [BuildFlavor::Release, BuildFlavor::Debug]
                    .into_iter()
                    .map(move |f| ((v, f), build_layout(v, f)))
            })
            .collect()
    });

    let version = RuntimeVersion::from_tag(tag).ok_or_else(|| {
        AbiError::NotSupported(tag, crate::version::supported_versions_to_string())
    })?;
    LAYOUTS
        .get(&(version, flavor))
        .ok_or_else(|| AbiError::NotSupported(tag, crate::version::supported_versions_to_string()))
}

macro_rules! set {
    ($offsets: expr, $field: expr, $ty: ty, $member: ident) => {
        $offsets[$field as usize] = Some(offset_of!($ty, $member))
    };
}

fn build_layout(version: RuntimeVersion, flavor: BuildFlavor) -> Layout {
    use RuntimeVersion::*;

    let mut o: [Option<usize>; Field::COUNT] = [None; Field::COUNT];

    set!(o, Field::ObjectRefcnt, PyObjectHead, ob_refcnt);
    set!(o, Field::ObjectType, PyObjectHead, ob_type);
    set!(o, Field::ObjectSize, PyVarObjectHead, ob_size);

    match version {
        V2_5 | V2_6 | V2_7 => {
            set!(o, Field::CodeFilename, PyCode25_27, co_filename);
            set!(o, Field::CodeName, PyCode25_27, co_name);
            set!(o, Field::CodeFirstLineno, PyCode25_27, co_firstlineno);
        }
        V3_0 | V3_1 | V3_2 => {
            set!(o, Field::CodeFilename, PyCode30_32, co_filename);
            set!(o, Field::CodeName, PyCode30_32, co_name);
            set!(o, Field::CodeFirstLineno, PyCode30_32, co_firstlineno);
        }
        V3_3 | V3_4 | V3_5 => {
            set!(o, Field::CodeFilename, PyCode33_35, co_filename);
            set!(o, Field::CodeName, PyCode33_35, co_name);
            set!(o, Field::CodeFirstLineno, PyCode33_35, co_firstlineno);
        }
        V3_6 | V3_7 => {
            set!(o, Field::CodeFilename, PyCode36_37, co_filename);
            set!(o, Field::CodeName, PyCode36_37, co_name);
            set!(o, Field::CodeFirstLineno, PyCode36_37, co_firstlineno);
        }
        V3_8 | V3_9 | V3_10 => {
            set!(o, Field::CodeFilename, PyCode38_310, co_filename);
            set!(o, Field::CodeName, PyCode38_310, co_name);
            set!(o, Field::CodeFirstLineno, PyCode38_310, co_firstlineno);
        }
    }

    set!(o, Field::FrameBack, PyFrameHead, f_back);
    set!(o, Field::FrameCode, PyFrameHead, f_code);
    set!(o, Field::FrameGlobals, PyFrameHead, f_globals);
    set!(o, Field::FrameLocals, PyFrameHead, f_locals);
    match version {
        V2_5 | V2_6 | V2_7 | V3_0 | V3_1 | V3_2 | V3_3 => {
            set!(o, Field::FrameTrace, PyFrame25_33, f_trace);
            set!(o, Field::FrameLineno, PyFrame25_33, f_lineno);
            set!(o, Field::FrameThreadState, PyFrame25_33, f_tstate);
        }
        V3_4 | V3_5 | V3_6 => {
            set!(o, Field::FrameTrace, PyFrame34_36, f_trace);
            set!(o, Field::FrameLineno, PyFrame34_36, f_lineno);
        }
        V3_7 | V3_8 | V3_9 => {
            set!(o, Field::FrameTrace, PyFrame37_39, f_trace);
            set!(o, Field::FrameLineno, PyFrame37_39, f_lineno);
        }
        V3_10 => {
            set!(o, Field::FrameTrace, PyFrame310, f_trace);
            set!(o, Field::FrameLineno, PyFrame310, f_lineno);
        }
    }

    macro_rules! thread_fields {
        ($ty: ty) => {
            set!(o, Field::ThreadNext, $ty, next);
            set!(o, Field::ThreadInterp, $ty, interp);
            set!(o, Field::ThreadFrame, $ty, frame);
            set!(o, Field::ThreadTraceFunc, $ty, c_tracefunc);
            set!(o, Field::ThreadTraceObj, $ty, c_traceobj);
            set!(o, Field::ThreadGilstateCounter, $ty, gilstate_counter);
            set!(o, Field::ThreadId, $ty, thread_id);
        };
    }
    match version {
        V2_5 | V2_6 | V2_7 => {
            thread_fields!(PyThreadState25_27);
        }
        V3_0 | V3_1 | V3_2 | V3_3 => {
            thread_fields!(PyThreadState30_33);
        }
        V3_4 | V3_5 | V3_6 => {
            thread_fields!(PyThreadState34_36);
            set!(o, Field::ThreadPrev, PyThreadState34_36, prev);
        }
        V3_7 | V3_8 | V3_9 => {
            thread_fields!(PyThreadState37_39);
            set!(o, Field::ThreadPrev, PyThreadState37_39, prev);
        }
        V3_10 => {
            thread_fields!(PyThreadState310);
            set!(o, Field::ThreadPrev, PyThreadState310, prev);
        }
    }

    let shift = flavor.object_shift();
    for field in Field::iter() {
        if field.kind().is_heap_object() {
            if let Some(offset) = o[field as usize].as_mut() {
                *offset += shift;
            }
        }
    }

    let strings = if version.has_compact_unicode() {
        StringLayout::Compact {
            length: shift + offset_of!(PyAsciiObject, length),
            state: shift + offset_of!(PyAsciiObject, state),
            wstr: shift + offset_of!(PyAsciiObject, wstr),
            wstr_length: shift + offset_of!(PyCompactUnicodeObject, wstr_length),
            ascii_data: shift + size_of::<PyAsciiObject>(),
            compact_data: shift + size_of::<PyCompactUnicodeObject>(),
            data_ptr: shift + offset_of!(PyUnicodeObject, data),
        }
    } else {
        StringLayout::Legacy {
            bytes_size: shift + offset_of!(PyVarObjectHead, ob_size),
            bytes_data: shift + offset_of!(PyBytesObject, ob_sval),
            unicode_length: shift + offset_of!(PyUnicodeLegacy, length),
            unicode_data: shift + offset_of!(PyUnicodeLegacy, str),
        }
    };

    Layout {
        version,
        flavor,
        offsets: o,
        strings,
    }
}
