//! In-process attach and trace engine for CPython interpreters.
//!
//! [`attach::pystalker_attach`] finds interpreters loaded into the process,
//! initializes their threading if needed, loads the debugger script and installs
//! a native trace function into every thread. The trace function serves
//! breakpoints and stepping from process wide state in [`trace`].

pub mod abi;
pub mod attach;
pub mod bootstrap;
pub mod channel;
pub mod discovery;
pub mod error;
mod futex;
pub mod frame;
pub mod install;
pub mod interpreter;
pub mod object;
pub mod runtime;
pub mod suspend;
pub mod trace;

pub use error::{ConnError, Error};
