//! Raw reads of frames, code objects, thread states and strings through an ABI layout.

use crate::engine::abi::ffi::unicode_state;
use crate::engine::abi::{Field, Layout, StringLayout, UnicodeUnits};
use crate::engine::runtime::Obj;
use crate::engine::trace::TraceFrame;
use std::ffi::c_int;

/// Reads interpreter memory using one interpreter's layout.
pub struct ObjectReader {
    layout: &'static Layout,
    unicode_type: usize,
    bytes_type: usize,
    unicode_units: UnicodeUnits,
}

impl ObjectReader {
    pub fn new(
        layout: &'static Layout,
        unicode_type: usize,
        bytes_type: usize,
        unicode_units: UnicodeUnits,
    ) -> Self {
        Self {
            layout,
            unicode_type,
            bytes_type,
            unicode_units,
        }
    }

    pub fn layout(&self) -> &'static Layout {
        self.layout
    }

    /// Read a field of a structure at `base`. `None` if the field does not exist in this version.
    ///
    /// # Safety
    ///
    /// `base` must point to a live structure owning `field`, `T` must match the field type.
    pub unsafe fn read<T: Copy>(&self, base: Obj, field: Field) -> Option<T> {
        let offset = self.layout.field_offset(field).ok()?;
        Some(std::ptr::read_unaligned(
            (base as *const u8).add(offset) as *const T
        ))
    }

    /// # Safety
    ///
    /// See [`ObjectReader::read`].
    pub unsafe fn write<T: Copy>(&self, base: Obj, field: Field, value: T) -> bool {
        let Ok(offset) = self.layout.field_offset(field) else {
            return false;
        };
        std::ptr::write_unaligned((base as *mut u8).add(offset) as *mut T, value);
        true
    }

    /// Compare a string object (`str`, `unicode` or `bytes` depending on version) with `name`.
    ///
    /// # Safety
    ///
    /// `obj` must be null or point to a live object.
    pub unsafe fn str_eq(&self, obj: Obj, name: &str) -> bool {
        if obj.is_null() {
            return false;
        }
        let Some(ty) = self.read::<usize>(obj, Field::ObjectType) else {
            return false;
        };
        let base = obj as *const u8;

        match self.layout.strings() {
            StringLayout::Compact {
                length,
                state,
                wstr,
                wstr_length,
                ascii_data,
                compact_data,
                data_ptr,
            } => {
                if ty != self.unicode_type {
                    return false;
                }
                let state: u32 = read_at(base, state);
                if state & unicode_state::READY == 0 {
                    let units: *const u32 = read_at(base, wstr);
                    let len: isize = read_at(base, wstr_length);
                    return units_eq(units, len, name);
                }

                let data = if state & unicode_state::COMPACT != 0 {
                    if state & unicode_state::ASCII != 0 {
                        base.add(ascii_data)
                    } else {
                        base.add(compact_data)
                    }
                } else {
                    read_at::<*const u8>(base, data_ptr)
                };
                let len: isize = read_at(base, length);
                match (state >> unicode_state::KIND_SHIFT) & unicode_state::KIND_MASK {
                    1 if state & unicode_state::ASCII != 0 => bytes_eq(data, len, name),
                    1 => units_eq(data, len, name),
                    2 => units_eq(data as *const u16, len, name),
                    4 => units_eq(data as *const u32, len, name),
                    _ => false,
                }
            }
            StringLayout::Legacy {
                bytes_size,
                bytes_data,
                unicode_length,
                unicode_data,
            } => {
                if ty == self.bytes_type {
                    let len: isize = read_at(base, bytes_size);
                    bytes_eq(base.add(bytes_data), len, name)
                } else if ty == self.unicode_type {
                    let len: isize = read_at(base, unicode_length);
                    match self.unicode_units {
                        UnicodeUnits::Ucs2 => {
                            utf16_eq(read_at::<*const u16>(base, unicode_data), len, name)
                        }
                        UnicodeUnits::Ucs4 => {
                            units_eq(read_at::<*const u32>(base, unicode_data), len, name)
                        }
                    }
                } else {
                    false
                }
            }
        }
    }
}

unsafe fn read_at<T: Copy>(base: *const u8, offset: usize) -> T {
    std::ptr::read_unaligned(base.add(offset) as *const T)
}

unsafe fn bytes_eq(data: *const u8, len: isize, name: &str) -> bool {
    if data.is_null() || len < 0 || len as usize != name.len() {
        return false;
    }
    std::slice::from_raw_parts(data, len as usize) == name.as_bytes()
}

/// Compare code units of a fixed width representation with the characters of `name`.
unsafe fn units_eq<U: Copy + Into<u32>>(data: *const U, len: isize, name: &str) -> bool {
    if data.is_null() || len < 0 {
        return false;
    }
    let units = std::slice::from_raw_parts(data, len as usize);
    units.len() == name.chars().count()
        && units
            .iter()
            .zip(name.chars())
            .all(|(u, c)| (*u).into() == c as u32)
}

/// Narrow build strings are UTF-16, characters outside the BMP take two units.
unsafe fn utf16_eq(data: *const u16, len: isize, name: &str) -> bool {
    if data.is_null() || len < 0 {
        return false;
    }
    std::slice::from_raw_parts(data, len as usize)
        .iter()
        .copied()
        .eq(name.encode_utf16())
}

/// Frame object passed to a trace function.
pub struct RawFrame<'a> {
    reader: &'a ObjectReader,
    frame: Obj,
}

impl<'a> RawFrame<'a> {
    pub fn new(reader: &'a ObjectReader, frame: Obj) -> Self {
        Self { reader, frame }
    }

    pub fn as_ptr(&self) -> Obj {
        self.frame
    }

    pub fn code(&self) -> Obj {
        if self.frame.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: frames handed to the trace function are alive for the call
        unsafe { self.reader.read(self.frame, Field::FrameCode) }.unwrap_or(std::ptr::null_mut())
    }
}

impl TraceFrame for RawFrame<'_> {
    fn address(&self) -> Obj {
        self.frame
    }

    fn line(&self) -> i32 {
        if self.frame.is_null() {
            return 0;
        }
        unsafe { self.reader.read::<c_int>(self.frame, Field::FrameLineno) }.unwrap_or(0)
    }

    fn file_is(&self, name: &str) -> bool {
        let code = self.code();
        if code.is_null() {
            return false;
        }
        unsafe {
            let filename: Obj = self
                .reader
                .read(code, Field::CodeFilename)
                .unwrap_or(std::ptr::null_mut());
            self.reader.str_eq(filename, name)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::abi::ffi::*;
    use crate::engine::abi::{resolve, BuildFlavor};
    use crate::version::VersionTag;
    use std::ffi::c_void;
    use std::ptr;

    static UNICODE_TYPE: u8 = 1;
    static BYTES_TYPE: u8 = 2;

    fn unicode_type() -> usize {
        &UNICODE_TYPE as *const u8 as usize
    }

    fn bytes_type() -> usize {
        &BYTES_TYPE as *const u8 as usize
    }

    fn head(ty: usize) -> PyObjectHead {
        PyObjectHead {
            ob_refcnt: 1,
            ob_type: ty as *mut c_void,
        }
    }

    #[repr(C)]
    struct AsciiString {
        obj: PyAsciiObject,
        data: [u8; 16],
    }

    impl AsciiString {
        fn new(s: &str) -> Box<Self> {
            let mut data = [0; 16];
            data[..s.len()].copy_from_slice(s.as_bytes());
            Box::new(Self {
                obj: PyAsciiObject {
                    ob_base: head(unicode_type()),
                    length: s.len() as isize,
                    hash: -1,
                    state: unicode_state::READY
                        | unicode_state::ASCII
                        | unicode_state::COMPACT
                        | (1 << unicode_state::KIND_SHIFT),
                    wstr: ptr::null_mut(),
                },
                data,
            })
        }
    }

    #[repr(C)]
    struct Ucs2String {
        obj: PyCompactUnicodeObject,
        data: [u16; 8],
    }

    fn zeroed<T>() -> T {
        unsafe { std::mem::zeroed() }
    }

    fn reader(tag: VersionTag) -> ObjectReader {
        reader_with_units(tag, UnicodeUnits::Ucs4)
    }

    fn reader_with_units(tag: VersionTag, units: UnicodeUnits) -> ObjectReader {
        ObjectReader::new(
            resolve(tag, BuildFlavor::Release).unwrap(),
            unicode_type(),
            bytes_type(),
            units,
        )
    }

    #[test]
    fn test_compact_ascii_compare() {
        let reader = reader(VersionTag::new(3, 8));
        let s = AsciiString::new("a.py");
        let ptr = &*s as *const AsciiString as Obj;

        unsafe {
            assert!(reader.str_eq(ptr, "a.py"));
            assert!(!reader.str_eq(ptr, "b.py"));
            assert!(!reader.str_eq(ptr, "a.pyc"));
            assert!(!reader.str_eq(ptr::null_mut(), "a.py"));
        }
    }

    #[test]
    fn test_compact_ucs2_compare() {
        let reader = reader(VersionTag::new(3, 10));
        let name = "данные.py";
        let mut s: Box<Ucs2String> = Box::new(zeroed());
        s.obj.base.ob_base = head(unicode_type());
        s.obj.base.length = name.chars().count() as isize;
        s.obj.base.state =
            unicode_state::READY | unicode_state::COMPACT | (2 << unicode_state::KIND_SHIFT);
        for (i, c) in name.chars().enumerate() {
            s.data[i] = c as u16;
        }
        let ptr = &*s as *const Ucs2String as Obj;

        unsafe {
            assert!(reader.str_eq(ptr, name));
            assert!(!reader.str_eq(ptr, "данные.pyc"));
        }
    }

    #[test]
    fn test_legacy_bytes_compare() {
        #[repr(C)]
        struct Bytes {
            obj: PyBytesObject,
            rest: [u8; 15],
        }

        let reader = reader(VersionTag::new(2, 7));
        let mut b: Box<Bytes> = Box::new(zeroed());
        b.obj.ob_base.ob_base = head(bytes_type());
        b.obj.ob_base.ob_size = 4;
        let raw = &mut *b as *mut Bytes as *mut u8;
        unsafe {
            let data = raw.add(std::mem::offset_of!(PyBytesObject, ob_sval));
            ptr::copy_nonoverlapping(b"a.py".as_ptr(), data, 4);
            assert!(reader.str_eq(raw as Obj, "a.py"));
            assert!(!reader.str_eq(raw as Obj, "a.p"));
        }
    }

    /// Pre-3.3 unicode object pointing at `data`.
    fn legacy_unicode<U>(data: &[U]) -> Box<PyUnicodeLegacy> {
        let mut u: Box<PyUnicodeLegacy> = Box::new(zeroed());
        u.ob_base = head(unicode_type());
        u.length = data.len() as isize;
        u.str = data.as_ptr() as *mut c_void;
        u
    }

    #[test]
    fn test_legacy_unicode_compare() {
        struct TestCase {
            tag: VersionTag,
            units: UnicodeUnits,
            data: Vec<u32>,
            name: &'static str,
            expected: bool,
        }
        let utf16 = |s: &str| s.encode_utf16().map(u32::from).collect::<Vec<_>>();
        let utf32 = |s: &str| s.chars().map(u32::from).collect::<Vec<_>>();

        let cases = [
            TestCase {
                tag: VersionTag::new(3, 2),
                units: UnicodeUnits::Ucs2,
                data: utf16("a.py"),
                name: "a.py",
                expected: true,
            },
            TestCase {
                tag: VersionTag::new(3, 2),
                units: UnicodeUnits::Ucs2,
                data: utf16("a.py"),
                name: "b.py",
                expected: false,
            },
            TestCase {
                tag: VersionTag::new(3, 1),
                units: UnicodeUnits::Ucs2,
                data: utf16("\u{1F600}.py"),
                name: "\u{1F600}.py",
                expected: true,
            },
            TestCase {
                tag: VersionTag::new(2, 7),
                units: UnicodeUnits::Ucs4,
                data: utf32("данные.py"),
                name: "данные.py",
                expected: true,
            },
            TestCase {
                tag: VersionTag::new(2, 7),
                units: UnicodeUnits::Ucs4,
                data: utf32("\u{1F600}.py"),
                name: "\u{1F600}.py",
                expected: true,
            },
        ];

        for tc in cases {
            let reader = reader_with_units(tc.tag, tc.units);
            let matches = match tc.units {
                UnicodeUnits::Ucs2 => {
                    let data = tc.data.iter().map(|&u| u as u16).collect::<Vec<_>>();
                    let obj = legacy_unicode(&data);
                    unsafe { reader.str_eq(&*obj as *const _ as Obj, tc.name) }
                }
                UnicodeUnits::Ucs4 => {
                    let obj = legacy_unicode(&tc.data);
                    unsafe { reader.str_eq(&*obj as *const _ as Obj, tc.name) }
                }
            };
            assert_eq!(matches, tc.expected, "{} {}", tc.tag, tc.name);
        }
    }

    #[test]
    fn test_raw_frame_reads() {
        let reader = reader(VersionTag::new(3, 8));
        let filename = AsciiString::new("a.py");

        let mut code: Box<PyCode38_310> = Box::new(zeroed());
        code.co_filename = &*filename as *const AsciiString as *mut c_void;

        let mut frame: Box<PyFrame37_39> = Box::new(zeroed());
        frame.head.f_code = &mut *code as *mut PyCode38_310 as *mut c_void;
        frame.f_lineno = 42;

        let raw = RawFrame::new(&reader, &mut *frame as *mut PyFrame37_39 as Obj);
        assert_eq!(raw.line(), 42);
        assert!(raw.file_is("a.py"));
        assert!(!raw.file_is("b.py"));
    }
}
