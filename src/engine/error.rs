use crate::engine::abi::AbiError;
use crate::version::VersionTag;
use std::ffi::CString;
use strum_macros::{Display, EnumIter, FromRepr};

/// Error codes understood by the controller, written to the status channel or
/// sent over the loopback report. Order is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr, EnumIter)]
#[repr(i32)]
pub enum ConnError {
    None = 0,
    InterpreterNotInitialized,
    UnknownVersion,
    LoadDebuggerFailed,
    LoadDebuggerBadDebugger,
    PythonNotFound,
    TimeOut,
    CannotOpenProcess,
    OutOfMemory,
    CannotInjectThread,
    SysNotFound,
    SysSetTraceNotFound,
    SysGetTraceNotFound,
    PyDebugAttachNotFound,
    RemoteNetworkError,
    RemoteSslError,
    RemoteUnsupportedServer,
    RemoteSecretMismatch,
    RemoteAttachRejected,
    RemoteInvalidUri,
    RemoteUnsupportedTransport,
    UnsupportedVersion,
}

impl ConnError {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("{0}")]
    Config(String),

    // --------------------------------- discovery errors ------------------------------------------
    #[error("no interpreter module found in process")]
    RuntimeNotFound,
    #[error("module {0} is not an interpreter")]
    NotARuntime(String),
    #[error("entry point `{0}` not found")]
    MissingEntryPoint(&'static str),
    #[error("interpreter is not initialized")]
    InterpreterNotInitialized,
    #[error("unrecognized interpreter version string {0:?}")]
    UnknownVersion(String),
    #[error("interpreter version {0} can not be attached to")]
    UnsupportedVersion(VersionTag),
    #[error("interpreter registry is full ({0} interpreters)")]
    TooManyInterpreters(usize),

    // --------------------------------- bootstrap errors ------------------------------------------
    #[error("timeout while initializing interpreter threading")]
    Timeout,
    #[error("thread suspension failed: {0}")]
    Suspend(nix::Error),

    // --------------------------------- injection errors ------------------------------------------
    #[error("bootstrap script failed: {0}")]
    LoadFailed(String),
    #[error("bootstrap script does not define `{0}`")]
    BadDebugger(&'static str),
    #[error("`sys` module not available")]
    SysNotFound,
    #[error("`sys.settrace` not available")]
    SysSetTraceNotFound,
    #[error("`sys.gettrace` not available")]
    SysGetTraceNotFound,
    #[error("interpreter call `{0}` failed")]
    CallFailed(&'static str),
    #[error("thread-local slot of the current thread state not found")]
    GilStateKeyNotFound,

    // --------------------------------- channel errors --------------------------------------------
    #[error("status channel for process {0} not found")]
    ChannelNotFound(i32),
    #[error("status channel is too small: {0} bytes")]
    ChannelTooSmall(usize),
    #[error("timeout while waiting for the {0} event")]
    EventTimeout(&'static str),

    // --------------------------------- unsafe conditions -----------------------------------------
    #[error("thread state list is corrupted: {0}")]
    CorruptedThreadList(&'static str),
}

impl Error {
    /// Code reported to the controller.
    pub fn conn_error(&self) -> ConnError {
        match self {
            Error::IO(_) => ConnError::CannotOpenProcess,
            Error::Abi(AbiError::NotSupported(..)) => ConnError::UnsupportedVersion,
            Error::Abi(_) => ConnError::UnknownVersion,
            Error::Config(_) => ConnError::LoadDebuggerFailed,
            Error::RuntimeNotFound => ConnError::PythonNotFound,
            Error::NotARuntime(_) => ConnError::PythonNotFound,
            Error::MissingEntryPoint(_) => ConnError::PythonNotFound,
            Error::InterpreterNotInitialized => ConnError::InterpreterNotInitialized,
            Error::UnknownVersion(_) => ConnError::UnknownVersion,
            Error::UnsupportedVersion(_) => ConnError::UnsupportedVersion,
            Error::TooManyInterpreters(_) => ConnError::OutOfMemory,
            Error::Timeout => ConnError::TimeOut,
            Error::Suspend(_) => ConnError::CannotInjectThread,
            Error::LoadFailed(_) => ConnError::LoadDebuggerFailed,
            Error::BadDebugger(_) => ConnError::LoadDebuggerBadDebugger,
            Error::SysNotFound => ConnError::SysNotFound,
            Error::SysSetTraceNotFound => ConnError::SysSetTraceNotFound,
            Error::SysGetTraceNotFound => ConnError::SysGetTraceNotFound,
            Error::CallFailed(_) => ConnError::LoadDebuggerFailed,
            Error::GilStateKeyNotFound => ConnError::CannotInjectThread,
            Error::ChannelNotFound(_) => ConnError::CannotOpenProcess,
            Error::ChannelTooSmall(_) => ConnError::CannotOpenProcess,
            Error::EventTimeout(_) => ConnError::TimeOut,
            Error::CorruptedThreadList(_) => ConnError::LoadDebuggerFailed,
        }
    }

    /// Return true if attach must be abandoned without touching the interpreter any further.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Abi(_) => true,
            Error::Config(_) => false,
            Error::RuntimeNotFound => false,
            Error::NotARuntime(_) => false,
            Error::MissingEntryPoint(_) => false,
            Error::InterpreterNotInitialized => false,
            Error::UnknownVersion(_) => false,
            Error::UnsupportedVersion(_) => true,
            Error::TooManyInterpreters(_) => false,
            Error::Timeout => true,
            Error::Suspend(_) => true,
            Error::LoadFailed(_) => false,
            Error::BadDebugger(_) => false,
            Error::SysNotFound => false,
            Error::SysSetTraceNotFound => false,
            Error::SysGetTraceNotFound => false,
            Error::CallFailed(_) => false,
            Error::GilStateKeyNotFound => false,
            Error::ChannelNotFound(_) => false,
            Error::ChannelTooSmall(_) => false,
            Error::EventTimeout(_) => false,
            Error::CorruptedThreadList(_) => true,
        }
    }
}

/// Build a C string for interpreter API calls, names never contain NUL.
pub(crate) fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                if $crate::log::is_enabled() {
                    $log_fn!(target: "attach", "{:#}", e);
                }
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                if $crate::log::is_enabled() {
                    $log_fn!(target: "attach", concat!($msg, " {:#}"), e);
                }
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
