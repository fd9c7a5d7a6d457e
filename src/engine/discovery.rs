//! Find interpreter modules loaded into the current process.

use crate::engine::abi::BuildFlavor;
use crate::engine::error::{c_string, Error};
use crate::version::VersionTag;
use crate::{muted_error, ps_debug};
use itertools::Itertools;
use nix::libc;
use nix::unistd::getpid;
use once_cell::sync::Lazy;
use proc_maps::MapRange;
use regex::Regex;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::{Path, PathBuf};
use std::ptr;

/// Loaded module that looks like an interpreter by its name.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCandidate {
    pub path: PathBuf,
    pub flavor: BuildFlavor,
    /// Module is the main executable (statically linked interpreter).
    pub is_executable: bool,
}

/// Return build flavor of a module if its file name looks like an interpreter:
/// `libpython3.8.so.1.0`, `libpython2.7d.so`, `python3.10`, ...
pub fn classify(path: &Path) -> Option<BuildFlavor> {
    static NAME_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?:lib)?python(?:\d(?:\.\d+)?)?(?P<flags>[dmu]*)(?:\.so(?:\.[\d.]+)?)?$")
            .expect("must compile")
    });

    let name = path.file_name()?.to_str()?;
    let caps = NAME_RE.captures(name)?;
    let flags = caps.name("flags").map(|m| m.as_str()).unwrap_or_default();
    Some(if flags.contains('d') {
        BuildFlavor::Debug
    } else {
        BuildFlavor::Release
    })
}

/// Snapshot of loaded modules filtered down to interpreter candidates, in load order.
pub fn scan_modules() -> Result<Vec<ModuleCandidate>, Error> {
    let maps: Vec<MapRange> = proc_maps::get_process_maps(getpid().as_raw())?;
    let executable = muted_error!(std::env::current_exe());

    let candidates = maps
        .iter()
        .filter_map(|map| map.filename())
        .unique()
        .filter_map(|path| {
            let flavor = classify(path)?;
            Some(ModuleCandidate {
                path: path.to_path_buf(),
                flavor,
                is_executable: executable.as_deref() == Some(path),
            })
        })
        .collect::<Vec<_>>();

    ps_debug!(target: "attach", "interpreter candidates: {:?}", candidates);
    Ok(candidates)
}

/// Handle of an already loaded module. Opening never loads anything new.
#[derive(Debug)]
pub struct Module {
    handle: *mut c_void,
    path: PathBuf,
    flavor: BuildFlavor,
}

// SAFETY: a `dlopen` handle may be used from any thread.
unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl Module {
    pub fn open(candidate: &ModuleCandidate) -> Result<Self, Error> {
        let handle = if candidate.is_executable {
            // SAFETY: null path returns the main program handle
            unsafe { libc::dlopen(ptr::null(), libc::RTLD_LAZY) }
        } else {
            let path = c_string(&candidate.path.to_string_lossy());
            // SAFETY: RTLD_NOLOAD only returns modules already mapped
            unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) }
        };

        if handle.is_null() {
            return Err(Error::NotARuntime(
                candidate.path.to_string_lossy().into_owned(),
            ));
        }
        Ok(Self {
            handle,
            path: candidate.path.clone(),
            flavor: candidate.flavor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flavor(&self) -> BuildFlavor {
        self.flavor
    }

    /// Raw handle, handed to the bootstrap script.
    pub fn raw_handle(&self) -> usize {
        self.handle as usize
    }

    /// Address of an exported symbol.
    pub fn address(&self, name: &str) -> Option<usize> {
        let name = c_string(name);
        // SAFETY: handle is valid until drop
        let addr = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }

    /// Resolve an exported function or data symbol as `T`.
    ///
    /// # Safety
    ///
    /// `T` must be a pointer-sized type matching the symbol's actual signature.
    pub unsafe fn symbol<T: Copy>(&self, name: &str) -> Option<T> {
        debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<usize>());
        let addr = self.address(name)?;
        Some(std::mem::transmute_copy::<usize, T>(&addr))
    }

    /// Required variant of [`Module::symbol`].
    ///
    /// # Safety
    ///
    /// See [`Module::symbol`].
    pub unsafe fn require<T: Copy>(&self, name: &'static str) -> Result<T, Error> {
        self.symbol(name).ok_or(Error::MissingEntryPoint(name))
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // SAFETY: balances the reference taken by `dlopen`
        unsafe { libc::dlclose(self.handle) };
    }
}

/// What probing a module tells about the interpreter inside.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub initialized: bool,
    pub tag: VersionTag,
    pub version_string: String,
    /// Address of `Py_IsInitialized`, identifies one interpreter runtime.
    pub identity: usize,
}

type GetVersionFn = unsafe extern "C" fn() -> *const c_char;
type IsInitializedFn = unsafe extern "C" fn() -> c_int;

/// Check that a module exports a working interpreter and read its version.
pub fn probe(module: &Module) -> Result<Probe, Error> {
    let not_a_runtime = || Error::NotARuntime(module.path().to_string_lossy().into_owned());

    // SAFETY: signatures match the interpreter's public API
    let get_version: GetVersionFn =
        unsafe { module.symbol("Py_GetVersion") }.ok_or_else(not_a_runtime)?;
    let is_initialized: IsInitializedFn =
        unsafe { module.symbol("Py_IsInitialized") }.ok_or_else(not_a_runtime)?;

    // SAFETY: returns a static string, valid before initialization too
    let raw = unsafe { get_version() };
    if raw.is_null() {
        return Err(not_a_runtime());
    }
    let version_string = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    let tag = VersionTag::parse(&version_string)
        .ok_or_else(|| Error::UnknownVersion(version_string.clone()))?;

    Ok(Probe {
        initialized: unsafe { is_initialized() } != 0,
        tag,
        version_string,
        identity: is_initialized as usize,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_module_name_heuristic() {
        struct TestCase {
            path: &'static str,
            expected: Option<BuildFlavor>,
        }
        let test_cases = [
            TestCase {
                path: "/usr/lib/x86_64-linux-gnu/libpython3.8.so.1.0",
                expected: Some(BuildFlavor::Release),
            },
            TestCase {
                path: "/usr/lib/libpython2.7d.so",
                expected: Some(BuildFlavor::Debug),
            },
            TestCase {
                path: "/usr/local/lib/libpython3.7dm.so.1.0",
                expected: Some(BuildFlavor::Debug),
            },
            TestCase {
                path: "/usr/bin/python3.10",
                expected: Some(BuildFlavor::Release),
            },
            TestCase {
                path: "/opt/py/bin/python3.9d",
                expected: Some(BuildFlavor::Debug),
            },
            TestCase {
                path: "/usr/bin/python",
                expected: Some(BuildFlavor::Release),
            },
            TestCase {
                path: "/usr/lib/python3.10/lib-dynload/_ssl.cpython-310-x86_64-linux-gnu.so",
                expected: None,
            },
            TestCase {
                path: "/usr/bin/python3.10-config",
                expected: None,
            },
            TestCase {
                path: "/usr/lib/x86_64-linux-gnu/libc.so.6",
                expected: None,
            },
        ];

        for tc in test_cases {
            assert_eq!(classify(Path::new(tc.path)), tc.expected, "{}", tc.path);
        }
    }

    #[test]
    fn test_scan_own_process() {
        // test binary is not an interpreter
        let candidates = scan_modules().unwrap();
        assert!(candidates.iter().all(|c| classify(&c.path).is_some()));
    }
}
