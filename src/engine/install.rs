//! Install the debugger's trace function on threads that already run interpreter code.

use crate::engine::abi::{BuildFlavor, Field};
use crate::engine::error::Error;
use crate::engine::frame::ObjectReader;
use crate::engine::interpreter::InterpreterHandle;
use crate::engine::object::{ObjectRef, SavedError, Values};
use crate::engine::runtime::{Obj, RuntimeApi};
use crate::engine::trace::release::ReleaseQueue;
use crate::engine::trace::PYSTALKER_TRACE;
use crate::{ps_debug, weak_error};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::ffi::c_int;

/// Upper bound of list walks, a longer list is considered corrupted.
const MAX_WALK: usize = 100_000;

/// Thread-local keys searched for the one holding the current thread state.
const TLS_KEY_SCAN: c_int = 100_000;

/// Thread state found in the interpreter's list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadRecord {
    pub tstate: usize,
    /// `thread_id` of the thread state, the owner's pthread id.
    pub thread_id: u64,
    pub top_frame: usize,
}

pub type ThreadRecords = SmallVec<[ThreadRecord; 8]>;

/// A thread list and a way to install into one of its threads.
pub trait ThreadWalk {
    /// Thread states in list order.
    ///
    /// # Safety
    ///
    /// GIL must be held.
    unsafe fn threads(&self) -> Result<ThreadRecords, Error>;

    /// # Safety
    ///
    /// GIL must be held, `record` must come from [`ThreadWalk::threads`] of the same walk.
    unsafe fn install(&self, record: &ThreadRecord) -> Result<(), Error>;
}

/// Install on every thread except the one with `self_thread_id`.
/// Return the number of threads processed.
///
/// Script code run during installation may start or end threads, so the walk
/// restarts from the head after each thread and only threads present in the
/// initial snapshot are processed, each at most once.
///
/// # Safety
///
/// GIL must be held.
pub unsafe fn install_all(walk: &impl ThreadWalk, self_thread_id: u64) -> Result<usize, Error> {
    let initial: HashSet<usize> = walk.threads()?.iter().map(|r| r.tstate).collect();
    let mut processed = HashSet::with_capacity(initial.len());

    loop {
        let next = walk
            .threads()?
            .into_iter()
            .find(|r| initial.contains(&r.tstate) && !processed.contains(&r.tstate));
        let Some(record) = next else {
            break;
        };
        processed.insert(record.tstate);
        if record.thread_id == self_thread_id {
            continue;
        }
        weak_error!(walk.install(&record), "install into thread failed:");
    }

    ps_debug!(target: "install", "trace installed into {} threads", processed.len());
    Ok(processed.len())
}

/// Point `f_trace` of every frame from `top` down to `trace_func`, one new
/// reference per frame. Replaced values go to `releases`. Return the number of
/// frames changed.
///
/// # Safety
///
/// GIL must be held, the frames must be alive.
pub unsafe fn rewrite_frames(
    reader: &ObjectReader,
    top: Obj,
    trace_func: Obj,
    cframe_type: Option<usize>,
    incref: impl Fn(Obj),
    releases: &ReleaseQueue,
) -> usize {
    let mut frame = top;
    let mut depth = 0;
    let mut changed = 0;
    while !frame.is_null() && depth < MAX_WALK {
        depth += 1;
        let ty = reader.read::<usize>(frame, Field::ObjectType);
        // stackless C frames have no trace slot
        if cframe_type.is_none() || ty != cframe_type {
            let old: Obj = reader
                .read(frame, Field::FrameTrace)
                .unwrap_or(std::ptr::null_mut());
            incref(trace_func);
            reader.write(frame, Field::FrameTrace, trace_func);
            releases.push(old);
            changed += 1;
        }
        frame = reader
            .read(frame, Field::FrameBack)
            .unwrap_or(std::ptr::null_mut());
    }
    changed
}

/// Script functions and `sys` entry points used by the installer.
pub struct ScriptCallables<'a> {
    pub new_thread: ObjectRef<'a>,
    pub settrace: ObjectRef<'a>,
    pub gettrace: ObjectRef<'a>,
}

/// [`ThreadWalk`] over the thread list of a live interpreter.
pub struct Installer<'a> {
    handle: &'static InterpreterHandle,
    callables: &'a ScriptCallables<'a>,
    interp: Obj,
    gil_state: Option<GilStateSlot>,
}

type TlsGet = unsafe extern "C" fn(c_int) -> Obj;
type TlsSet = unsafe extern "C" fn(c_int, Obj) -> c_int;
type TlsDelete = unsafe extern "C" fn(c_int);
type SwapFn = unsafe extern "C" fn(Obj) -> Obj;

/// Thread-local slot that holds the current thread state of the calling thread.
#[derive(Debug, Clone, Copy)]
struct GilStateSlot {
    key: c_int,
    set: TlsSet,
    delete: TlsDelete,
}

impl GilStateSlot {
    unsafe fn find(api: &RuntimeApi, current: Obj) -> Option<Self> {
        Self::scan(api.tls_get?, api.tls_set?, api.tls_delete?, current)
    }

    unsafe fn scan(get: TlsGet, set: TlsSet, delete: TlsDelete, current: Obj) -> Option<Self> {
        if current.is_null() {
            return None;
        }
        let key = (0..TLS_KEY_SCAN).find(|&key| get(key) == current)?;
        Some(Self { key, set, delete })
    }

    /// Setting an occupied key is a no-op on older runtimes, so delete first.
    unsafe fn store(&self, tstate: Obj) {
        (self.delete)(self.key);
        (self.set)(self.key, tstate);
    }
}

/// Makes another thread state current on this thread, the thread-local copy
/// included. Swapped back on drop.
struct SwapGuard {
    swap: SwapFn,
    slot: Option<GilStateSlot>,
    previous: Obj,
}

impl SwapGuard {
    unsafe fn enter(swap: SwapFn, slot: Option<GilStateSlot>, tstate: Obj) -> Self {
        if let Some(slot) = &slot {
            slot.store(tstate);
        }
        let previous = swap(tstate);
        Self {
            swap,
            slot,
            previous,
        }
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(slot) = &self.slot {
                slot.store(self.previous);
            }
            (self.swap)(self.previous);
        }
    }
}

impl<'a> Installer<'a> {
    /// # Safety
    ///
    /// GIL must be held by the calling thread.
    pub unsafe fn new(
        handle: &'static InterpreterHandle,
        callables: &'a ScriptCallables<'a>,
        interp: Obj,
    ) -> Result<Self, Error> {
        let api = &handle.api;
        let gil_state = GilStateSlot::find(api, api.current_thread());
        if gil_state.is_none() && handle.reader.layout().flavor() == BuildFlavor::Debug {
            // debug builds check the thread-local state on every swap
            return Err(Error::GilStateKeyNotFound);
        }
        ps_debug!(
            target: "install",
            "thread state key: {:?}",
            gil_state.map(|slot| slot.key)
        );

        Ok(Self {
            handle,
            callables,
            interp,
            gil_state,
        })
    }
}

impl ThreadWalk for Installer<'_> {
    unsafe fn threads(&self) -> Result<ThreadRecords, Error> {
        let api = &self.handle.api;
        let reader = &self.handle.reader;
        let mut records = SmallVec::new();

        let mut tstate = (api.thread_head)(self.interp);
        while !tstate.is_null() {
            if records.len() >= MAX_WALK {
                return Err(Error::CorruptedThreadList("thread state list does not end"));
            }
            records.push(ThreadRecord {
                tstate: tstate as usize,
                thread_id: reader.read::<u64>(tstate, Field::ThreadId).unwrap_or(0),
                top_frame: reader
                    .read::<usize>(tstate, Field::ThreadFrame)
                    .unwrap_or(0),
            });
            tstate = (api.thread_next)(tstate);
        }
        Ok(records)
    }

    unsafe fn install(&self, record: &ThreadRecord) -> Result<(), Error> {
        let handle = self.handle;
        let api = &handle.api;
        let tstate = record.tstate as Obj;

        // script code runs on the injecting thread
        let values = Values(api);
        let py_thread = self.callables.new_thread.call(
            "new_thread",
            &[
                &values.u64(record.thread_id)?,
                &values.bool(true)?,
                &values.object(record.top_frame as Obj),
            ],
        )?;
        if py_thread.is_none() {
            ps_debug!(target: "install", "thread {} skipped by the debugger", record.thread_id);
            return Ok(());
        }
        let trace_func = py_thread.getattr("trace_func")?;

        let _swap = SwapGuard::enter(api.thread_swap, self.gil_state, tstate);
        let _saved = SavedError::fetch(api);
        let existing = self.callables.gettrace.call("sys.gettrace", &[]).ok();
        self.callables.settrace.call("sys.settrace", &[&trace_func])?;
        if let Some(existing) = existing.filter(|e| !e.is_none()) {
            py_thread.setattr("prev_trace_func", &existing)?;
        }

        handle.hook_current_thread(tstate);
        rewrite_frames(
            &handle.reader,
            record.top_frame as Obj,
            trace_func.as_ptr(),
            api.cframe_type,
            |obj| (api.incref)(obj),
            &PYSTALKER_TRACE.releases,
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::abi::ffi::{PyFrame37_39, PyObjectHead};
    use crate::engine::abi::{resolve, UnicodeUnits};
    use crate::version::VersionTag;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::ptr;

    fn thread_record(tstate: usize) -> ThreadRecord {
        ThreadRecord {
            tstate,
            thread_id: tstate as u64 * 100,
            top_frame: 0,
        }
    }

    /// Thread list that script code changes while installing.
    #[derive(Default)]
    struct FakeWalk {
        list: RefCell<Vec<ThreadRecord>>,
        /// (installed thread, thread that ends, thread that starts)
        churn: Vec<(usize, usize, usize)>,
        failing: Vec<usize>,
        installed: RefCell<Vec<usize>>,
        listings: Cell<u32>,
    }

    impl ThreadWalk for FakeWalk {
        unsafe fn threads(&self) -> Result<ThreadRecords, Error> {
            self.listings.set(self.listings.get() + 1);
            Ok(self.list.borrow().iter().copied().collect())
        }

        unsafe fn install(&self, record: &ThreadRecord) -> Result<(), Error> {
            self.installed.borrow_mut().push(record.tstate);
            for &(on, ends, starts) in &self.churn {
                if on == record.tstate {
                    let mut list = self.list.borrow_mut();
                    list.retain(|r| r.tstate != ends);
                    list.insert(0, thread_record(starts));
                }
            }
            if self.failing.contains(&record.tstate) {
                return Err(Error::CallFailed("new_thread"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_install_follows_changing_list() {
        let walk = FakeWalk {
            list: RefCell::new([1, 2, 3, 4].into_iter().map(thread_record).collect()),
            churn: vec![(2, 3, 5)],
            ..Default::default()
        };
        let processed = unsafe { install_all(&walk, thread_record(1).thread_id) }.unwrap();

        // 1 is the calling thread, 3 ended, 5 started after the walk began
        assert_eq!(*walk.installed.borrow(), vec![2, 4]);
        assert_eq!(processed, 3);
        // initial snapshot, one per processed thread, the last finds nothing
        assert_eq!(walk.listings.get(), 5);
    }

    #[test]
    fn test_failed_thread_does_not_stop_install() {
        let walk = FakeWalk {
            list: RefCell::new([1, 2, 3].into_iter().map(thread_record).collect()),
            failing: vec![1],
            ..Default::default()
        };
        let processed = unsafe { install_all(&walk, 0) }.unwrap();
        assert_eq!(*walk.installed.borrow(), vec![1, 2, 3]);
        assert_eq!(processed, 3);
    }

    thread_local! {
        static FAKE_TLS: RefCell<HashMap<c_int, usize>> = RefCell::default();
        static FAKE_CURRENT: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn fake_get(key: c_int) -> Obj {
        FAKE_TLS.with(|tls| tls.borrow().get(&key).copied().unwrap_or(0)) as Obj
    }

    /// Like the runtime's own, refuses to overwrite.
    unsafe extern "C" fn fake_set(key: c_int, value: Obj) -> c_int {
        FAKE_TLS.with(|tls| {
            tls.borrow_mut().entry(key).or_insert(value as usize);
        });
        0
    }

    unsafe extern "C" fn fake_delete(key: c_int) {
        FAKE_TLS.with(|tls| tls.borrow_mut().remove(&key));
    }

    unsafe extern "C" fn fake_swap(tstate: Obj) -> Obj {
        FAKE_CURRENT.with(|current| current.replace(tstate as usize)) as Obj
    }

    fn fake_tls(key: c_int) -> Option<usize> {
        FAKE_TLS.with(|tls| tls.borrow().get(&key).copied())
    }

    #[test]
    fn test_swap_moves_thread_local_state() {
        FAKE_TLS.with(|tls| *tls.borrow_mut() = HashMap::from([(3, 0x10), (42, 0x100)]));
        FAKE_CURRENT.with(|current| current.set(0x100));

        let slot = unsafe { GilStateSlot::scan(fake_get, fake_set, fake_delete, 0x100 as Obj) };
        let slot = slot.unwrap();
        assert_eq!(slot.key, 42);

        {
            let _swap = unsafe { SwapGuard::enter(fake_swap, Some(slot), 0x200 as Obj) };
            assert_eq!(FAKE_CURRENT.with(Cell::get), 0x200);
            assert_eq!(fake_tls(42), Some(0x200));
        }
        assert_eq!(FAKE_CURRENT.with(Cell::get), 0x100);
        assert_eq!(fake_tls(42), Some(0x100));
        assert_eq!(fake_tls(3), Some(0x10));
    }

    #[test]
    fn test_swap_without_thread_local_slot() {
        FAKE_TLS.with(|tls| *tls.borrow_mut() = HashMap::from([(3, 0x10)]));
        FAKE_CURRENT.with(|current| current.set(0x100));

        unsafe {
            assert!(GilStateSlot::scan(fake_get, fake_set, fake_delete, 0x100 as Obj).is_none());
            assert!(GilStateSlot::scan(fake_get, fake_set, fake_delete, ptr::null_mut()).is_none());
        }
        {
            let _swap = unsafe { SwapGuard::enter(fake_swap, None, 0x200 as Obj) };
            assert_eq!(FAKE_CURRENT.with(Cell::get), 0x200);
        }
        assert_eq!(FAKE_CURRENT.with(Cell::get), 0x100);
        assert_eq!(fake_tls(3), Some(0x10));
    }

    static CFRAME_TYPE: u8 = 0;
    static FRAME_TYPE: u8 = 0;
    static TRACE_FUNC: u8 = 0;
    static OLD_TRACE: u8 = 0;

    fn addr(s: &'static u8) -> usize {
        s as *const u8 as usize
    }

    fn frame(ty: usize, back: Option<&mut PyFrame37_39>) -> Box<PyFrame37_39> {
        let mut frame: Box<PyFrame37_39> = Box::new(unsafe { std::mem::zeroed() });
        frame.head.ob_base.ob_base = PyObjectHead {
            ob_refcnt: 1,
            ob_type: ty as *mut c_void,
        };
        frame.head.f_back = back.map_or(std::ptr::null_mut(), |b| b as *mut PyFrame37_39 as Obj);
        frame
    }

    #[test]
    fn test_rewrite_frames() {
        let reader = ObjectReader::new(
            resolve(VersionTag::new(3, 8), BuildFlavor::Release).unwrap(),
            0,
            0,
            UnicodeUnits::Ucs4,
        );
        let trace_func = addr(&TRACE_FUNC) as Obj;
        let old = addr(&OLD_TRACE) as Obj;

        let mut bottom = frame(addr(&FRAME_TYPE), None);
        bottom.f_trace = old;
        let mut cframe = frame(addr(&CFRAME_TYPE), Some(&mut *bottom));
        let mut top = frame(addr(&FRAME_TYPE), Some(&mut *cframe));

        let increfs = RefCell::new(vec![]);
        let releases = ReleaseQueue::new();
        let changed = unsafe {
            rewrite_frames(
                &reader,
                &mut *top as *mut PyFrame37_39 as Obj,
                trace_func,
                Some(addr(&CFRAME_TYPE)),
                |obj| increfs.borrow_mut().push(obj),
                &releases,
            )
        };

        assert_eq!(changed, 2);
        assert_eq!(top.f_trace, trace_func);
        assert_eq!(bottom.f_trace, trace_func);
        assert!(cframe.f_trace.is_null());
        assert_eq!(*increfs.borrow(), vec![trace_func, trace_func]);

        let mut released = vec![];
        releases.drain(|obj| released.push(obj));
        assert_eq!(released, vec![old]);
    }

    #[test]
    fn test_rewrite_frames_without_cframe_type() {
        let reader = ObjectReader::new(
            resolve(VersionTag::new(3, 8), BuildFlavor::Release).unwrap(),
            0,
            0,
            UnicodeUnits::Ucs4,
        );
        let mut bottom = frame(addr(&CFRAME_TYPE), None);
        let mut top = frame(addr(&FRAME_TYPE), Some(&mut *bottom));
        let releases = ReleaseQueue::new();

        let changed = unsafe {
            rewrite_frames(
                &reader,
                &mut *top as *mut PyFrame37_39 as Obj,
                addr(&TRACE_FUNC) as Obj,
                None,
                |_| {},
                &releases,
            )
        };
        assert_eq!(changed, 2);
        assert!(releases.is_empty());
    }
}
