//! Owned interpreter references and scope guards. Everything here requires the GIL.

use crate::engine::error::{c_string, Error};
use crate::engine::runtime::{Obj, RuntimeApi};
use std::ffi::{c_int, CStr};
use std::ptr;

/// Holds the GIL of one interpreter until dropped.
pub struct GilGuard<'a> {
    api: &'a RuntimeApi,
    state: c_int,
}

impl<'a> GilGuard<'a> {
    pub fn acquire(api: &'a RuntimeApi) -> Self {
        // SAFETY: threading is initialized before any guard is taken
        let state = unsafe { (api.gil_ensure)() };
        Self { api, state }
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.gil_release)(self.state) }
    }
}

/// Strong reference, released on drop.
pub struct ObjectRef<'a> {
    api: &'a RuntimeApi,
    ptr: Obj,
}

impl<'a> ObjectRef<'a> {
    /// Take ownership of a new reference returned by the interpreter. Null means the call
    /// failed and the interpreter error indicator is set.
    pub fn new(api: &'a RuntimeApi, ptr: Obj, call: &'static str) -> Result<Self, Error> {
        if ptr.is_null() {
            return Err(Error::CallFailed(call));
        }
        Ok(Self { api, ptr })
    }

    /// Take a new reference to a borrowed object.
    pub fn borrowed(api: &'a RuntimeApi, ptr: Obj) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        unsafe { (api.incref)(ptr) };
        Some(Self { api, ptr })
    }

    pub fn as_ptr(&self) -> Obj {
        self.ptr
    }

    /// Give up ownership without releasing.
    pub fn into_raw(self) -> Obj {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    pub fn is_none(&self) -> bool {
        self.ptr == self.api.none
    }

    pub fn getattr(&self, name: &'static str) -> Result<ObjectRef<'a>, Error> {
        let c_name = c_string(name);
        let ptr = unsafe { (self.api.getattr_string)(self.ptr, c_name.as_ptr()) };
        ObjectRef::new(self.api, ptr, name)
    }

    pub fn setattr(&self, name: &'static str, value: &ObjectRef) -> Result<(), Error> {
        let c_name = c_string(name);
        match unsafe { (self.api.setattr_string)(self.ptr, c_name.as_ptr(), value.ptr) } {
            0 => Ok(()),
            _ => Err(Error::CallFailed(name)),
        }
    }

    /// Call with positional arguments.
    pub fn call(&self, name: &'static str, args: &[&ObjectRef]) -> Result<ObjectRef<'a>, Error> {
        let tuple = ObjectRef::new(
            self.api,
            unsafe { (self.api.tuple_new)(args.len() as isize) },
            "PyTuple_New",
        )?;
        for (i, arg) in args.iter().enumerate() {
            // tuple steals a reference
            unsafe {
                (self.api.incref)(arg.ptr);
                (self.api.tuple_set_item)(tuple.ptr, i as isize, arg.ptr);
            }
        }
        let result = unsafe { (self.api.call_object)(self.ptr, tuple.ptr) };
        ObjectRef::new(self.api, result, name)
    }

    /// Borrowed item of a dict, wrapped into a new reference.
    pub fn dict_get(&self, key: &str) -> Option<ObjectRef<'a>> {
        let c_key = c_string(key);
        let item = unsafe { (self.api.dict_get_item_string)(self.ptr, c_key.as_ptr()) };
        ObjectRef::borrowed(self.api, item)
    }

    pub fn dict_set(&self, key: &'static str, value: &ObjectRef) -> Result<(), Error> {
        let c_key = c_string(key);
        match unsafe { (self.api.dict_set_item_string)(self.ptr, c_key.as_ptr(), value.ptr) } {
            0 => Ok(()),
            _ => Err(Error::CallFailed(key)),
        }
    }

    /// `repr()` of the object, for diagnostics.
    pub fn repr(&self) -> String {
        let Some(as_utf8) = self.api.as_utf8 else {
            return format!("<object at {:p}>", self.ptr);
        };
        let Ok(repr) = ObjectRef::new(
            self.api,
            unsafe { (self.api.object_repr)(self.ptr) },
            "PyObject_Repr",
        ) else {
            clear_error(self.api);
            return format!("<object at {:p}>", self.ptr);
        };
        let raw = unsafe { as_utf8(repr.ptr) };
        if raw.is_null() {
            clear_error(self.api);
            return String::new();
        }
        unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
    }
}

impl Drop for ObjectRef<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.decref)(self.ptr) }
    }
}

/// Constructors of script arguments.
pub struct Values<'a>(pub &'a RuntimeApi);

impl<'a> Values<'a> {
    pub fn int(&self, value: i64) -> Result<ObjectRef<'a>, Error> {
        ObjectRef::new(
            self.0,
            unsafe { (self.0.int_from_long)(value as _) },
            "PyInt_FromLong",
        )
    }

    pub fn u64(&self, value: u64) -> Result<ObjectRef<'a>, Error> {
        ObjectRef::new(
            self.0,
            unsafe { (self.0.int_from_u64)(value as _) },
            "PyLong_FromUnsignedLongLong",
        )
    }

    pub fn bool(&self, value: bool) -> Result<ObjectRef<'a>, Error> {
        ObjectRef::new(
            self.0,
            unsafe { (self.0.bool_from_long)(value as _) },
            "PyBool_FromLong",
        )
    }

    pub fn str(&self, value: &str) -> Result<ObjectRef<'a>, Error> {
        let c_value = c_string(value);
        ObjectRef::new(
            self.0,
            unsafe { (self.0.string_from)(c_value.as_ptr()) },
            "PyUnicode_FromString",
        )
    }

    /// Borrowed object (frame, `None`, ...) as a new reference, `None` for null.
    pub fn object(&self, ptr: Obj) -> ObjectRef<'a> {
        let ptr = if ptr.is_null() { self.0.none } else { ptr };
        unsafe { (self.0.incref)(ptr) };
        ObjectRef { api: self.0, ptr }
    }

    pub fn none(&self) -> ObjectRef<'a> {
        self.object(ptr::null_mut())
    }
}

pub fn clear_error(api: &RuntimeApi) {
    unsafe {
        if !(api.err_occurred)().is_null() {
            (api.err_clear)()
        }
    }
}

/// Pending exception of the current thread, put back on drop.
pub struct SavedError<'a> {
    api: &'a RuntimeApi,
    triple: (Obj, Obj, Obj),
}

impl<'a> SavedError<'a> {
    pub fn fetch(api: &'a RuntimeApi) -> Self {
        let mut triple = (ptr::null_mut(), ptr::null_mut(), ptr::null_mut());
        unsafe { (api.err_fetch)(&mut triple.0, &mut triple.1, &mut triple.2) };
        Self { api, triple }
    }
}

impl Drop for SavedError<'_> {
    fn drop(&mut self) {
        // restore steals the references, any error raised meanwhile is replaced
        let (t, v, tb) = self.triple;
        unsafe { (self.api.err_restore)(t, v, tb) }
    }
}
