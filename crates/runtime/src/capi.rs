//! CPython-compatible shims: the `PyObject_*` / `PyType_*` names
//! extension code expects, as thin wrappers over the internal dispatch.
//!
//! All of these follow the CAPI convention: errors come back as null (or
//! -1) with the exception parked in the thread-local pending slot.

#![allow(non_snake_case)]

use crate::dispatch::args::ArgPassSpec;
use crate::dispatch::{attr, call, compare, item, len};
use crate::objects::{self, PyClass, PyObject, PyStr, PyTuple};

pub extern "C" fn PyObject_GetAttr(obj: *mut PyObject, name: *mut PyStr) -> *mut PyObject {
    attr::getattr_capi(obj, name)
}

pub extern "C" fn PyObject_SetAttr(obj: *mut PyObject, name: *mut PyStr, val: *mut PyObject) -> i32 {
    // The internal entry steals; the CPython contract borrows.
    unsafe { objects::incref(val) };
    attr::setattr_capi(obj, name, val)
}

pub extern "C" fn PyObject_DelAttr(obj: *mut PyObject, name: *mut PyStr) -> i32 {
    attr::delattr_capi(obj, name)
}

/// `callable(*args)` with a tuple of positional arguments.
pub extern "C" fn PyObject_Call(callable: *mut PyObject, args_tuple: *mut PyObject) -> *mut PyObject {
    let elts = unsafe { &(*(args_tuple as *mut PyTuple)).elts };
    let n = elts.len();
    let get = |i: usize| elts.get(i).copied().unwrap_or(std::ptr::null_mut());
    let mut rest: Vec<*mut PyObject> = if n > 3 { elts[3..].to_vec() } else { Vec::new() };
    call::runtime_call_capi(
        callable,
        ArgPassSpec::positional(n),
        get(0),
        get(1),
        get(2),
        if rest.is_empty() {
            std::ptr::null_mut()
        } else {
            rest.as_mut_ptr()
        },
        std::ptr::null(),
    )
}

pub extern "C" fn PyObject_GetItem(obj: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    item::getitem_capi(obj, key)
}

pub extern "C" fn PyObject_SetItem(obj: *mut PyObject, key: *mut PyObject, val: *mut PyObject) -> i32 {
    item::setitem_capi(obj, key, val)
}

pub extern "C" fn PyObject_DelItem(obj: *mut PyObject, key: *mut PyObject) -> i32 {
    item::delitem_capi(obj, key)
}

pub extern "C" fn PyObject_Size(obj: *mut PyObject) -> i64 {
    len::unboxed_len_capi(obj)
}

pub extern "C" fn PyObject_IsTrue(obj: *mut PyObject) -> i64 {
    len::nonzero_capi(obj)
}

pub extern "C" fn PyObject_RichCompare(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op: i32,
) -> *mut PyObject {
    let op_type = match op {
        objects::PY_LT => compare::CMP_LT,
        objects::PY_LE => compare::CMP_LT_E,
        objects::PY_EQ => compare::CMP_EQ,
        objects::PY_NE => compare::CMP_NOT_EQ,
        objects::PY_GT => compare::CMP_GT,
        objects::PY_GE => compare::CMP_GT_E,
        _ => compare::CMP_EQ,
    };
    compare::compare_capi(lhs, rhs, op_type)
}

/// The class's shape changed out from under its caches.
pub extern "C" fn PyType_Modified(cls: *mut PyClass) {
    objects::typecache::type_modified(cls);
}

/// Flush the whole method cache; returns how many entries were dropped.
pub extern "C" fn PyType_ClearCache() -> u64 {
    objects::typecache::clear_cache() as u64
}

/// MRO attribute lookup without the descriptor protocol (borrowed).
pub extern "C" fn _PyType_Lookup(cls: *mut PyClass, name: *mut PyStr) -> *mut PyObject {
    attr::type_lookup(cls, name, None).unwrap_or(std::ptr::null_mut())
}
