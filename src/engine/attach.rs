//! Attach orchestration: find interpreters, bootstrap threading, load the debugger
//! script and install tracing into every thread.

use crate::config::{self, AttachConfig};
use crate::engine::abi;
use crate::engine::bootstrap::{Bootstrap, NativeRuntime, INIT_SIGNAL};
use crate::engine::channel::{self, StatusChannel};
use crate::engine::discovery::{self, Module, ModuleCandidate};
use crate::engine::error::{c_string, ConnError, Error};
use crate::engine::install::{install_all, Installer, ScriptCallables};
use crate::engine::interpreter::{self, InterpreterHandle, Leaked};
use crate::engine::object::{GilGuard, ObjectRef, Values};
use crate::engine::runtime::{RuntimeApi, PY_FILE_INPUT};
use crate::engine::suspend::SignalThreads;
use crate::version::RuntimeVersion;
use crate::{muted_error, ps_error, ps_info, ps_warn, weak_error};
use nix::libc;
use std::ffi::{c_void, CStr};
use std::mem::MaybeUninit;
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};
use std::sync::Once;

/// Connection parameters and progress of one attach request.
pub struct Session<'a> {
    channel: &'a StatusChannel,
    port: i32,
    session_id: String,
    options: String,
    started: bool,
}

impl<'a> Session<'a> {
    pub fn new(channel: &'a StatusChannel) -> Self {
        Self {
            channel,
            port: channel.port(),
            session_id: channel.session_id(),
            options: channel.options(),
            started: false,
        }
    }

    /// Report the interpreter version and let the controller know attach is under way.
    fn start(&mut self, version: RuntimeVersion) {
        if self.started {
            return;
        }
        self.channel.set_version(version.wire());
        self.channel.report(ConnError::None);
        self.channel.signal_starting();
        self.started = true;
    }

    /// Errors before "starting" go to the channel, later ones over loopback.
    pub fn report(&self, error: &Error) {
        let code = error.conn_error();
        if self.started {
            weak_error!(
                channel::send_report(self.port, &self.session_id, code),
                "loopback report failed:"
            );
        } else {
            self.channel.report(code);
        }
    }
}

/// Attach to every interpreter loaded into this process.
pub fn run(config: &AttachConfig) -> Result<usize, Error> {
    let channel = StatusChannel::open(std::process::id())?;
    let mut session = Session::new(&channel);

    let result = attach_all(config, &mut session);
    match &result {
        Ok(count) => ps_info!(target: "attach", "attached to {count} interpreter(s)"),
        Err(e) => {
            ps_error!(target: "attach", "attach failed: {e:#}");
            session.report(e);
        }
    }
    result
}

fn attach_all(config: &AttachConfig, session: &mut Session) -> Result<usize, Error> {
    let candidates = discovery::scan_modules()?;
    let mut attached = 0;
    let mut last_error = None;

    for candidate in &candidates {
        match attach_candidate(candidate, config, session) {
            Ok(true) => attached += 1,
            Ok(false) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                ps_warn!(target: "attach", "skip {}: {e:#}", candidate.path.display());
                last_error = Some(e);
            }
        }
    }

    if attached == 0 {
        return Err(last_error.unwrap_or(Error::RuntimeNotFound));
    }
    Ok(attached)
}

/// Return false if the runtime behind `candidate` is already attached.
fn attach_candidate(
    candidate: &ModuleCandidate,
    config: &AttachConfig,
    session: &mut Session,
) -> Result<bool, Error> {
    let module = Module::open(candidate)?;
    let probe = discovery::probe(&module)?;
    if interpreter::find(probe.identity).is_some() {
        return Ok(false);
    }
    if !probe.initialized {
        return Err(Error::InterpreterNotInitialized);
    }
    let version = RuntimeVersion::from_tag(probe.tag)
        .ok_or_else(|| Error::UnknownVersion(probe.version_string.clone()))?;
    if !version.attachable() {
        return Err(Error::UnsupportedVersion(probe.tag));
    }
    let layout = abi::resolve(probe.tag, candidate.flavor)?;
    let api = RuntimeApi::resolve(&module, version)?;
    if unsafe { (api.interpreter_head)() }.is_null() {
        return Err(Error::InterpreterNotInitialized);
    }

    ps_info!(
        target: "attach",
        "attaching to {version} ({}) at {}",
        candidate.flavor,
        candidate.path.display()
    );
    let handle = interpreter::register(module, &probe, api, layout)?;
    session.start(version);

    let runtime = NativeRuntime::new(&handle.api);
    let mut control = SignalThreads::new(config.suspend_ack_timeout())?;
    Bootstrap::new(&runtime, &mut control, &INIT_SIGNAL)
        .with_timeout(config.bootstrap_timeout())
        .with_interval_lowering(config.lower_switch_interval)
        .run()?;
    drop(control);
    session.channel.signal_done();

    inject(handle, config, session)?;
    Ok(true)
}

/// Path and `dlopen` handle of the library this code lives in.
fn own_library() -> Option<(PathBuf, usize)> {
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: any address inside this module is accepted
    let found = unsafe { libc::dladdr(pystalker_attach as *const c_void, info.as_mut_ptr()) };
    if found == 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return None;
    }
    let fname = unsafe { CStr::from_ptr(info.dli_fname) };
    let handle = unsafe { libc::dlopen(fname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
    let path = PathBuf::from(fname.to_string_lossy().into_owned());
    Some((path, handle as usize))
}

/// Text of the pending exception, the exception is cleared.
fn take_exception(api: &RuntimeApi) -> String {
    let (mut ty, mut value, mut tb) = (
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    );
    unsafe { (api.err_fetch)(&mut ty, &mut value, &mut tb) };
    let _ty = ObjectRef::new(api, ty, "exception type").ok();
    let _tb = ObjectRef::new(api, tb, "traceback").ok();
    match ObjectRef::new(api, value, "exception") {
        Ok(value) => value.repr(),
        Err(_) => "unknown error".to_string(),
    }
}

/// Compile and run the bootstrap script in a fresh namespace, return the namespace.
fn load_script<'a>(api: &'a RuntimeApi, path: &Path) -> Result<ObjectRef<'a>, Error> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Error::LoadFailed(format!("{}: {e}", path.display())))?;
    let file_name = path.to_string_lossy();
    let values = Values(api);

    let c_source = c_string(&source);
    let c_file = c_string(&file_name);
    let code = ObjectRef::new(
        api,
        unsafe { (api.compile_string)(c_source.as_ptr(), c_file.as_ptr(), PY_FILE_INPUT) },
        "Py_CompileString",
    )
    .map_err(|_| Error::LoadFailed(take_exception(api)))?;

    let globals = ObjectRef::new(api, unsafe { (api.dict_new)() }, "PyDict_New")?;
    if let Some(builtins) = ObjectRef::borrowed(api, unsafe { (api.get_builtins)() }) {
        globals.dict_set("__builtins__", &builtins)?;
    }
    globals.dict_set("__file__", &values.str(&file_name)?)?;

    ObjectRef::new(
        api,
        unsafe { (api.eval_code)(code.as_ptr(), globals.as_ptr(), globals.as_ptr()) },
        "PyEval_EvalCode",
    )
    .map_err(|_| Error::LoadFailed(take_exception(api)))?;

    Ok(globals)
}

fn inject(
    handle: &'static InterpreterHandle,
    config: &AttachConfig,
    session: &Session,
) -> Result<(), Error> {
    let api = &handle.api;
    let _gil = GilGuard::acquire(api);
    let values = Values(api);

    let library = own_library();
    let script = config.script_path(library.as_ref().and_then(|(path, _)| path.parent()));
    let globals = load_script(api, &script)?;

    let fetch = |name: &'static str| globals.dict_get(name).ok_or(Error::BadDebugger(name));
    let attach_process = fetch("attach_process")?;
    let new_thread = fetch("new_thread")?;
    let new_external_thread = fetch("new_external_thread")?;
    let set_debugger_dll_handle = fetch("set_debugger_dll_handle")?;

    attach_process
        .call(
            "attach_process",
            &[
                &values.int(session.port as i64)?,
                &values.str(&session.session_id)?,
                &values.str(&session.options)?,
                &values.bool(true)?,
                &values.bool(false)?,
            ],
        )
        .map_err(|_| Error::LoadFailed(take_exception(api)))?;

    let c_sys = c_string("sys");
    let sys = ObjectRef::new(api, unsafe { (api.import_module)(c_sys.as_ptr()) }, "sys")
        .map_err(|_| {
            take_exception(api);
            Error::SysNotFound
        })?;
    let settrace = sys.getattr("settrace").map_err(|_| {
        take_exception(api);
        Error::SysSetTraceNotFound
    })?;
    let gettrace = sys.getattr("gettrace").map_err(|_| {
        take_exception(api);
        Error::SysGetTraceNotFound
    })?;

    let callables = ScriptCallables {
        new_thread,
        settrace,
        gettrace,
    };
    let interp = unsafe { (api.interpreter_head)() };
    let self_thread = nix::sys::pthread::pthread_self() as u64;
    unsafe {
        let installer = Installer::new(handle, &callables, interp)?;
        install_all(&installer, self_thread)?;
    }

    if handle.version().has_eval_frame_hook() {
        handle.set_external_thread_hook(Leaked::new(new_external_thread));
        unsafe { handle.install_eval_hook(interp) };
    }

    let library_handle = library.map(|(_, h)| h).unwrap_or_default();
    if set_debugger_dll_handle
        .call(
            "set_debugger_dll_handle",
            &[&values.u64(library_handle as u64)?],
        )
        .is_err()
    {
        ps_warn!(target: "attach", "set_debugger_dll_handle: {}", take_exception(api));
    }
    Ok(())
}

static ATTACH: Once = Once::new();

fn attach_worker() {
    let config = config::current();
    crate::log::init(config.log_level.as_deref());
    muted_error!(run(config));
}

/// Start attaching to the interpreters of this process on a dedicated thread.
/// Subsequent calls do nothing.
#[no_mangle]
pub extern "C" fn pystalker_attach() {
    _ = catch_unwind(|| {
        ATTACH.call_once(|| {
            weak_error!(
                std::thread::Builder::new()
                    .name("pystalker-attach".to_string())
                    .spawn(|| {
                        _ = catch_unwind(attach_worker);
                    }),
                "attach thread:"
            );
        })
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_report_routing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let path = std::env::temp_dir().join(format!("pystalker-{}-routing", std::process::id()));
        let controller = StatusChannel::create_at(&path, port, "session-2", "").unwrap();
        let engine = StatusChannel::open_at(&path).unwrap();

        let mut session = Session::new(&engine);
        session.report(&Error::Timeout);
        assert_eq!(controller.error(), Some(ConnError::TimeOut));

        session.start(RuntimeVersion::V3_8);
        assert_eq!(controller.version(), RuntimeVersion::V3_8.wire());
        assert_eq!(controller.error(), Some(ConnError::None));

        session.report(&Error::SysNotFound);
        let (mut stream, _) = listener.accept().unwrap();
        let mut frame = vec![];
        stream.read_to_end(&mut frame).unwrap();
        assert_eq!(
            &frame[..],
            &channel::encode_report("session-2", ConnError::SysNotFound)[..]
        );
        // channel keeps the code from start
        assert_eq!(controller.error(), Some(ConnError::None));
    }
}
