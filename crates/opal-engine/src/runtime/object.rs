//! Object model and runtime helpers
//!
//! Every heap value starts with a class-descriptor pointer; the
//! remaining machine words are fields:
//!
//! - boxed int: one `i64` field
//! - boxed real: one `f64` field
//! - array: field 0 is the length, fields 1..=len hold references
//! - string: field 0 is the length, the bytes follow NUL-terminated,
//!   padded to an 8-byte boundary
//! - user object: fields in declaration order
//!
//! The `extern "C"` functions here are the entry points generated code
//! calls: allocation (`new_int`, `new_array`, ...), member access (the
//! selector probe of the class table plus boxing/unboxing where the
//! slot kind and access type disagree), `print`/`assert`, equality, and
//! the fail helper behind runtime guards.

use crate::runtime::class::{ClassDesc, MemberKind};
use crate::runtime::image;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io::Write;

/// Header of every heap value: the class pointer. Fields follow as raw
/// machine words.
#[repr(C)]
pub struct Object {
    pub class: *const ClassDesc,
}

/// Raw field access.
///
/// # Safety
///
/// `obj` must be a live heap object with more than `index` fields.
pub unsafe fn field(obj: *const Object, index: usize) -> u64 {
    *(obj as *const u64).add(1 + index)
}

/// Raw field update.
///
/// # Safety
///
/// As [`field`].
pub unsafe fn set_field(obj: *mut Object, index: usize, value: u64) {
    *(obj as *mut u64).add(1 + index) = value;
}

/// The byte contents of a string object (no type check).
///
/// # Safety
///
/// `obj` must be a live string object.
pub unsafe fn string_bytes<'a>(obj: *const Object) -> &'a [u8] {
    let len = field(obj, 0) as usize;
    let bytes = (obj as *const u8).add(16);
    std::slice::from_raw_parts(bytes, len)
}

// ----------------------------------------------------------------------
// Allocation helpers
// ----------------------------------------------------------------------

/// Allocate a boxed int.
pub extern "C" fn new_int(value: i64) -> *mut Object {
    let image = image::current();
    let obj = image.heap.allocate_object(image.classes.boxed_int.address() as *const ClassDesc, 1);
    unsafe { set_field(obj, 0, value as u64) };
    obj
}

/// Allocate a boxed real.
pub extern "C" fn new_real(value: f64) -> *mut Object {
    let image = image::current();
    let obj = image.heap.allocate_object(
        image.classes.boxed_real.address() as *const ClassDesc,
        1,
    );
    unsafe { set_field(obj, 0, value.to_bits()) };
    obj
}

/// Allocate a string, copying `len` bytes and NUL-terminating them.
pub extern "C" fn new_string(bytes: *const u8, len: u64) -> *mut Object {
    let slice = unsafe { std::slice::from_raw_parts(bytes, len as usize) };
    image::current().allocate_string(slice)
}

/// Allocate an array of `len` null references.
pub extern "C" fn new_array(len: i64) -> *mut Object {
    let image = image::current();
    let obj = image.heap.allocate_object(
        image.classes.array.address() as *const ClassDesc,
        1 + len as usize,
    );
    unsafe { set_field(obj, 0, len as u64) };
    obj
}

/// Allocate a user object with `fields_nr` fields.
pub extern "C" fn new_object(class: *const ClassDesc, fields_nr: u64) -> *mut Object {
    let image = image::current();
    image.heap.allocate_object(class, fields_nr as usize)
}

// ----------------------------------------------------------------------
// Printing
// ----------------------------------------------------------------------

/// Redirection sink for `print` (tests capture output here).
static PRINT_SINK: Lazy<Mutex<Option<Vec<u8>>>> = Lazy::new(|| Mutex::new(None));

/// Start capturing `print` output instead of writing to stdout.
pub fn capture_print() {
    *PRINT_SINK.lock() = Some(Vec::new());
}

/// Stop capturing and return everything printed since [`capture_print`].
pub fn take_captured_print() -> String {
    let captured = PRINT_SINK.lock().take().unwrap_or_default();
    String::from_utf8_lossy(&captured).into_owned()
}

fn print_line(text: &str) {
    let mut sink = PRINT_SINK.lock();
    match sink.as_mut() {
        Some(buf) => {
            buf.extend_from_slice(text.as_bytes());
            buf.push(b'\n');
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.write_all(b"\n");
        }
    }
}

/// Render one object the way `print` does.
pub fn render(obj: *const Object) -> String {
    if obj.is_null() {
        return "null".to_string();
    }
    let image = image::current();
    let class = unsafe { (*obj).class };
    unsafe {
        if class == image.classes.boxed_int.address() as *const ClassDesc {
            format!("{}", field(obj, 0) as i64)
        } else if class == image.classes.boxed_real.address() as *const ClassDesc {
            format!("{:.6}", f64::from_bits(field(obj, 0)))
        } else if class == image.classes.string.address() as *const ClassDesc {
            String::from_utf8_lossy(string_bytes(obj)).into_owned()
        } else {
            // arrays and user objects print their class name
            let sym = (*class).sym;
            image
                .symtab
                .lookup(sym)
                .map(|s| image.symtab.interner.resolve(s.name).to_string())
                .unwrap_or_else(|| "<object>".to_string())
        }
    }
}

/// The `print` builtin.
pub extern "C" fn builtin_print(obj: *mut Object) -> *mut Object {
    print_line(&render(obj));
    std::ptr::null_mut()
}

/// The `assert` builtin: a zero argument terminates the program.
pub extern "C" fn builtin_assert(condition: i64) -> *mut Object {
    if condition == 0 {
        eprintln!("Fatal: assertion failed");
        std::process::exit(1);
    }
    std::ptr::null_mut()
}

/// Runtime-failure helper behind emitted guards.
pub extern "C" fn fail_at(line: u64, msg: *const u8, msg_len: u64) -> ! {
    let message = unsafe {
        std::str::from_utf8(std::slice::from_raw_parts(msg, msg_len as usize))
            .unwrap_or("(invalid message)")
    };
    if line != 0 {
        eprintln!("Fatal: {} in line {}", message, line);
    } else {
        eprintln!("Fatal: {}", message);
    }
    std::process::exit(1);
}

// ----------------------------------------------------------------------
// Equality
// ----------------------------------------------------------------------

/// Object equality: boxed scalars and strings compare by value,
/// everything else by identity.
pub extern "C" fn obj_test_eq(a: *const Object, b: *const Object) -> i64 {
    if a == b {
        return 1;
    }
    if a.is_null() || b.is_null() {
        return 0;
    }
    let image = image::current();
    unsafe {
        if (*a).class != (*b).class {
            return 0;
        }
        let class = (*a).class;
        if class == image.classes.boxed_int.address() as *const ClassDesc
            || class == image.classes.boxed_real.address() as *const ClassDesc
        {
            (field(a, 0) == field(b, 0)) as i64
        } else if class == image.classes.string.address() as *const ClassDesc {
            (string_bytes(a) == string_bytes(b)) as i64
        } else {
            0
        }
    }
}

// ----------------------------------------------------------------------
// Member access (the runtime half of the selector scheme)
// ----------------------------------------------------------------------

fn lookup_or_fail(obj: *const Object, selector: u64, line: u64) -> crate::runtime::class::MemberSlot {
    if obj.is_null() {
        let msg = "member access on null";
        fail_at(line, msg.as_ptr(), msg.len() as u64);
    }
    let class = unsafe { &*(*obj).class };
    match class.lookup(selector as u16) {
        Some(slot) => slot,
        None => {
            let msg = "object does not understand this member";
            fail_at(line, msg.as_ptr(), msg.len() as u64)
        }
    }
}

/// Resolve a method for a call with `args_nr` arguments; returns the
/// entry point from the vtable.
pub extern "C" fn object_method_lookup(
    obj: *mut Object,
    selector: u64,
    args_nr: u64,
    line: u64,
) -> *const u8 {
    let slot = lookup_or_fail(obj, selector, line);
    match slot.kind {
        MemberKind::Method { params } if params as u64 == args_nr => {
            let class = unsafe { &*(*obj).class };
            class.vtable[slot.offset as usize]
        }
        MemberKind::Method { .. } => {
            let msg = "method called with the wrong number of arguments";
            fail_at(line, msg.as_ptr(), msg.len() as u64)
        }
        _ => {
            let msg = "attempted to call a field";
            fail_at(line, msg.as_ptr(), msg.len() as u64)
        }
    }
}

/// Read a field as an int (unboxing an object slot as needed).
pub extern "C" fn object_read_field_int(obj: *mut Object, selector: u64, line: u64) -> i64 {
    let slot = lookup_or_fail(obj, selector, line);
    unsafe {
        match slot.kind {
            MemberKind::IntField => field(obj, slot.offset as usize) as i64,
            MemberKind::ObjField => {
                let value = field(obj, slot.offset as usize) as *const Object;
                unbox_int(value, line)
            }
            MemberKind::Method { .. } => {
                let msg = "attempted to read a method as a field";
                fail_at(line, msg.as_ptr(), msg.len() as u64)
            }
        }
    }
}

/// Read a field as an object (boxing an int slot as needed).
pub extern "C" fn object_read_field_obj(obj: *mut Object, selector: u64, line: u64) -> *mut Object {
    let slot = lookup_or_fail(obj, selector, line);
    unsafe {
        match slot.kind {
            MemberKind::ObjField => field(obj, slot.offset as usize) as *mut Object,
            MemberKind::IntField => new_int(field(obj, slot.offset as usize) as i64),
            MemberKind::Method { .. } => {
                let msg = "attempted to read a method as a field";
                fail_at(line, msg.as_ptr(), msg.len() as u64)
            }
        }
    }
}

/// Write a field from an int value (boxing into an object slot as needed).
pub extern "C" fn object_write_field_int(obj: *mut Object, selector: u64, line: u64, value: i64) {
    let slot = lookup_or_fail(obj, selector, line);
    unsafe {
        match slot.kind {
            MemberKind::IntField => set_field(obj, slot.offset as usize, value as u64),
            MemberKind::ObjField => {
                let boxed = new_int(value);
                set_field(obj, slot.offset as usize, boxed as u64)
            }
            MemberKind::Method { .. } => {
                let msg = "attempted to assign to a method";
                fail_at(line, msg.as_ptr(), msg.len() as u64)
            }
        }
    }
}

/// Write a field from an object value (unboxing into an int slot as needed).
pub extern "C" fn object_write_field_obj(
    obj: *mut Object,
    selector: u64,
    line: u64,
    value: *mut Object,
) {
    let slot = lookup_or_fail(obj, selector, line);
    unsafe {
        match slot.kind {
            MemberKind::ObjField => set_field(obj, slot.offset as usize, value as u64),
            MemberKind::IntField => {
                let raw = unbox_int(value, line);
                set_field(obj, slot.offset as usize, raw as u64)
            }
            MemberKind::Method { .. } => {
                let msg = "attempted to assign to a method";
                fail_at(line, msg.as_ptr(), msg.len() as u64)
            }
        }
    }
}

/// Unbox a boxed int, failing for anything else.
unsafe fn unbox_int(obj: *const Object, line: u64) -> i64 {
    let image = image::current();
    if obj.is_null() || (*obj).class != image.classes.boxed_int.address() as *const ClassDesc {
        let msg = "attempted to convert non-Int object to int";
        fail_at(line, msg.as_ptr(), msg.len() as u64);
    }
    field(obj, 0) as i64
}

// ----------------------------------------------------------------------
// Builtin methods (`size` on strings and arrays)
// ----------------------------------------------------------------------

/// `String.size()`: length in bytes, boxed to the canonical method
/// return type.
pub extern "C" fn builtin_string_size(obj: *mut Object) -> *mut Object {
    unsafe { new_int(field(obj, 0) as i64) }
}

/// `Array.size()`: element count, boxed.
pub extern "C" fn builtin_array_size(obj: *mut Object) -> *mut Object {
    unsafe { new_int(field(obj, 0) as i64) }
}
