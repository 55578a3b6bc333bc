//! `len()` and truth-testing.

use crate::dispatch::call::{callattr_internal0, CallRw};
use crate::dispatch::{CallRA, UnaryRA};
use crate::error::{exc_occurred, set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::{
    box_int, builtins, decref, intern_string, is_subclass, type_name, unbox_int, PyFloat,
    PyObject, CLS_OFFSET, INT_N_OFFSET, SQ_LENGTH_OFFSET, TP_AS_SEQUENCE_OFFSET,
};
use crate::rewriter::{Location, RefType, Rewriter, VarId};
use crate::stats::StatCounter;

static SLOWPATH_LEN: StatCounter = StatCounter::new("slowpath_len");
static SLOWPATH_UNBOXED_LEN: StatCounter = StatCounter::new("slowpath_unboxed_len");
static SLOWPATH_NONZERO: StatCounter = StatCounter::new("slowpath_nonzero");

extern "C" fn box_int_i64(n: i64) -> *mut PyObject {
    box_int(n)
}

/// Validate a `__len__` result: must be a non-negative integer. Steals
/// the reference.
extern "C" fn fixup_len_return(rtn: *mut PyObject) -> *mut PyObject {
    let b = builtins();
    unsafe {
        if !is_subclass((*rtn).cls, b.int_cls) {
            decref(rtn);
            set_pending_exc(ExcInfo::new(b.type_error, "an integer is required".to_string()));
            return std::ptr::null_mut();
        }
        if unbox_int(rtn) < 0 {
            decref(rtn);
            set_pending_exc(ExcInfo::new(
                b.value_error,
                "__len__() should return >= 0".to_string(),
            ));
            return std::ptr::null_mut();
        }
    }
    rtn
}

/// Boxed length of `obj`. Owned result, or null with a pending error.
pub fn len_internal(
    obj: *mut PyObject,
    mut rw: Option<(&mut Rewriter, &mut UnaryRA)>,
) -> *mut PyObject {
    let cls = unsafe { (*obj).cls };

    // First part of PyObject_Size: a native sq_length hook.
    let sqm = unsafe { (*cls).tp_as_sequence };
    let sq_length = if sqm.is_null() {
        None
    } else {
        unsafe { (*sqm).sq_length }
    };
    if let Some(length) = sq_length {
        if let Some((r, ra)) = rw.as_mut() {
            let r_cls = r.get_attr(ra.obj, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
            let r_m = r.get_attr(
                r_cls,
                TP_AS_SEQUENCE_OFFSET,
                Location::any(),
                crate::asm::MovType::Q,
            );
            r.add_guard_not_eq(r_m, 0);
            // Guard that the hook hasn't changed, then call the known
            // target directly (the rewriter can only call fixed
            // addresses).
            r.add_attr_guard(r_m, SQ_LENGTH_OFFSET, length as u64, false);
            let r_n = r.call(true, length as usize, &[ra.obj]);
            r.check_and_throw_capi_exception(r_n, -1);
            let r_r = r.call(false, box_int_i64 as usize, &[r_n]);
            let r_r = r.set_type(r_r, RefType::Owned);
            ra.out_success = true;
            ra.out_rtn = Some(r_r);
        }

        let n = length(obj);
        if n == -1 {
            return std::ptr::null_mut();
        }
        if n < 0 {
            set_pending_exc(ExcInfo::new(
                builtins().value_error,
                "__len__() should return >= 0".to_string(),
            ));
            return std::ptr::null_mut();
        }
        return box_int(n);
    }

    // __len__ through the generic machinery.
    let len_str = intern_string("__len__");
    let mut r_rtn: Option<VarId> = None;
    let mut kill_rw = false;
    let rtn = match rw.as_mut() {
        Some((r, ra)) => {
            let mut cra = CallRA::new(ra.obj, ra.destination);
            let inner: CallRw = Some((&mut **r, &mut cra));
            let rtn = callattr_internal0(obj, len_str, inner);
            if cra.out_success && !rtn.is_null() {
                r_rtn = cra.out_rtn;
            } else if !rtn.is_null() {
                kill_rw = true;
            }
            rtn
        }
        None => callattr_internal0(obj, len_str, None),
    };
    if kill_rw {
        rw = None;
    }

    if rtn.is_null() {
        if !exc_occurred() {
            set_pending_exc(ExcInfo::new(
                builtins().type_error,
                format!("object of type '{}' has no len()", type_name(obj)),
            ));
        }
        return std::ptr::null_mut();
    }

    if let (Some((r, ra)), Some(rv)) = (rw.as_mut(), r_rtn) {
        let fixed = r.call(true, fixup_len_return as usize, &[rv]);
        r.ref_consumed(rv);
        let fixed = r.set_type(fixed, RefType::Owned);
        let fixed = r.set_nullable(fixed, true);
        ra.out_success = true;
        ra.out_rtn = Some(fixed);
    }

    fixup_len_return(rtn)
}

fn len_entry(obj: *mut PyObject, rtn_addr: *const u8) -> *mut PyObject {
    SLOWPATH_LEN.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 1, "len");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let mut ra = UnaryRA::new(r_obj, r.get_return_destination());
            rtn = len_internal(obj, Some((&mut *r, &mut ra)));
            if ra.out_success && !r.is_failed() {
                commit = ra.out_rtn;
            }
        }
        None => {
            rtn = len_internal(obj, None);
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }
    rtn
}

/// `len(obj)` boxed, CAPI flavor.
pub extern "C" fn len_capi(obj: *mut PyObject) -> *mut PyObject {
    len_entry(obj, take_ic_return_addr())
}

/// `len(obj)` boxed, Result flavor.
pub fn len(obj: *mut PyObject) -> PyResult<*mut PyObject> {
    crate::error::to_result(len_entry(obj, take_ic_return_addr()))
}

fn unboxed_len_entry(obj: *mut PyObject, rtn_addr: *const u8) -> i64 {
    SLOWPATH_UNBOXED_LEN.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 1, "unboxed_len");
    let boxed;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let mut ra = UnaryRA::new(r_obj, Location::any());
            boxed = len_internal(obj, Some((&mut *r, &mut ra)));
            if ra.out_success && !r.is_failed() {
                if let Some(rv) = ra.out_rtn {
                    let n = r.get_attr(rv, INT_N_OFFSET, Location::any(), crate::asm::MovType::Q);
                    commit = Some(n);
                }
            }
        }
        None => {
            boxed = len_internal(obj, None);
        }
    }

    if boxed.is_null() {
        // Drop the rewriter; error runs take the slow path.
        return -1;
    }
    let n = unbox_int(boxed);
    unsafe { decref(boxed) };

    if let Some(v) = commit {
        let mut rw = rewriter.take().unwrap();
        rw.commit_returning_non_python(v);
    }
    n
}

/// `len(obj)` as a raw integer; -1 with a pending error on failure.
pub extern "C" fn unboxed_len_capi(obj: *mut PyObject) -> i64 {
    unboxed_len_entry(obj, take_ic_return_addr())
}

pub fn unboxed_len(obj: *mut PyObject) -> PyResult<i64> {
    let n = unboxed_len_entry(obj, take_ic_return_addr());
    if n < 0 {
        Err(crate::error::take_pending_exc().expect("unboxed_len failed silently"))
    } else {
        Ok(n)
    }
}

// ---- nonzero ----

extern "C" fn float_nonzero(obj: *mut PyObject) -> i64 {
    unsafe { ((*(obj as *mut PyFloat)).f != 0.0) as i64 }
}

extern "C" fn seq_len_nonzero(obj: *mut PyObject) -> i64 {
    let cls = unsafe { (*obj).cls };
    let length = unsafe { (*(*cls).tp_as_sequence).sq_length.unwrap() };
    (length(obj) != 0) as i64
}

/// Validate a `__nonzero__` result. Steals the reference; -1 on error.
extern "C" fn nonzero_result_helper(rtn: *mut PyObject) -> i64 {
    let b = builtins();
    let cls = unsafe { (*rtn).cls };
    let result = if cls == b.bool_cls || cls == b.int_cls {
        (unbox_int(rtn) != 0) as i64
    } else {
        set_pending_exc(ExcInfo::new(
            b.type_error,
            format!(
                "__nonzero__ should return bool or int, returned {}",
                type_name(rtn)
            ),
        ));
        -1
    };
    unsafe { decref(rtn) };
    result
}

/// Truth value of `obj`: 1, 0, or -1 with a pending error.
pub fn nonzero_internal(
    obj: *mut PyObject,
    mut rw: Option<(&mut Rewriter, &mut UnaryRA)>,
) -> i64 {
    let b = builtins();
    let cls = unsafe { (*obj).cls };

    if let Some((r, ra)) = rw.as_mut() {
        r.add_attr_guard(ra.obj, CLS_OFFSET, cls as u64, false);
    }

    // Type-specialized fast paths; these cover nearly every truth test.
    if cls == b.bool_cls {
        if let Some((r, ra)) = rw.as_mut() {
            let r_n = r.get_attr(ra.obj, INT_N_OFFSET, ra.destination, crate::asm::MovType::Q);
            ra.out_success = true;
            ra.out_rtn = Some(r_n);
        }
        return unbox_int(obj);
    }
    if cls == b.int_cls || cls == b.long_cls {
        if let Some((r, ra)) = rw.as_mut() {
            let r_n = r.get_attr(ra.obj, INT_N_OFFSET, Location::any(), crate::asm::MovType::Q);
            let r_b = r.to_bool(r_n, ra.destination);
            ra.out_success = true;
            ra.out_rtn = Some(r_b);
        }
        return (unbox_int(obj) != 0) as i64;
    }
    if cls == b.float_cls {
        if let Some((r, ra)) = rw.as_mut() {
            let r_b = r.call(false, float_nonzero as usize, &[ra.obj]);
            ra.out_success = true;
            ra.out_rtn = Some(r_b);
        }
        return float_nonzero(obj);
    }
    if cls == b.none_cls {
        if let Some((r, ra)) = rw.as_mut() {
            let r_b = r.load_const(0, ra.destination);
            ra.out_success = true;
            ra.out_rtn = Some(r_b);
        }
        return 0;
    }
    if cls == b.tuple_cls || cls == b.list_cls || cls == b.str_cls || cls == b.dict_cls {
        if let Some((r, ra)) = rw.as_mut() {
            let r_b = r.call(false, seq_len_nonzero as usize, &[ra.obj]);
            ra.out_success = true;
            ra.out_rtn = Some(r_b);
        }
        return seq_len_nonzero(obj);
    }

    // __nonzero__, then __len__, else true.
    let nonzero_str = intern_string("__nonzero__");
    let mut r_rtn: Option<VarId> = None;
    let mut kill_rw = false;
    let rtn = match rw.as_mut() {
        Some((r, ra)) => {
            let mut cra = CallRA::new(ra.obj, Location::any());
            let inner: CallRw = Some((&mut **r, &mut cra));
            let rtn = callattr_internal0(obj, nonzero_str, inner);
            if cra.out_success && !rtn.is_null() {
                r_rtn = cra.out_rtn;
            } else if !rtn.is_null() {
                kill_rw = true;
            }
            rtn
        }
        None => callattr_internal0(obj, nonzero_str, None),
    };
    if kill_rw {
        rw = None;
    }

    if !rtn.is_null() {
        if let (Some((r, ra)), Some(rv)) = (rw.as_mut(), r_rtn) {
            let r_b = r.call(true, nonzero_result_helper as usize, &[rv]);
            r.ref_consumed(rv);
            ra.out_success = true;
            ra.out_rtn = Some(r_b);
        }
        return nonzero_result_helper(rtn);
    }
    if exc_occurred() {
        return -1;
    }

    let len_str = intern_string("__len__");
    let has_len = crate::dispatch::attr::type_lookup(cls, len_str, None).is_some();
    if has_len {
        let boxed = len_internal(obj, None);
        if boxed.is_null() {
            return -1;
        }
        let n = unbox_int(boxed);
        unsafe { decref(boxed) };
        return (n != 0) as i64;
    }

    // Objects with no truth protocol are true.
    if let Some((r, ra)) = rw.as_mut() {
        let r_b = r.load_const(1, ra.destination);
        ra.out_success = true;
        ra.out_rtn = Some(r_b);
    }
    1
}

fn nonzero_entry(obj: *mut PyObject, rtn_addr: *const u8) -> i64 {
    SLOWPATH_NONZERO.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 1, "nonzero");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let mut ra = UnaryRA::new(r_obj, r.get_return_destination());
            rtn = nonzero_internal(obj, Some((&mut *r, &mut ra)));
            if ra.out_success && !r.is_failed() {
                commit = ra.out_rtn;
            }
        }
        None => {
            rtn = nonzero_internal(obj, None);
        }
    }

    if let Some(v) = commit {
        if rtn >= 0 {
            rewriter.take().unwrap().commit_returning_non_python(v);
        }
    }
    rtn
}

/// Truth value, CAPI flavor: 1, 0, or -1 with a pending error.
pub extern "C" fn nonzero_capi(obj: *mut PyObject) -> i64 {
    nonzero_entry(obj, take_ic_return_addr())
}

/// Truth value, Result flavor.
pub fn nonzero(obj: *mut PyObject) -> PyResult<bool> {
    let n = nonzero_entry(obj, take_ic_return_addr());
    if n < 0 {
        Err(crate::error::take_pending_exc().expect("nonzero failed silently"))
    } else {
        Ok(n != 0)
    }
}

