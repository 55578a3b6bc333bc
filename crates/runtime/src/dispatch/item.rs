//! Subscript dispatch: `target[key]` get/set/del.
//!
//! A class with a native mapping hook (`mp_subscript` /
//! `mp_ass_subscript`) takes the fast path; otherwise the operation goes
//! through `__getitem__`-family attributes, with step-less slices
//! re-routed to the `__getslice__` family with resolved integer bounds.

use crate::dispatch::args::ArgPassSpec;
use crate::dispatch::call::{callattr_internal, CallRw};
use crate::dispatch::CallRA;
use crate::error::{exc_occurred, set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::{
    self, box_int, builtins, decref, intern_string, type_name, unbox_int, PySlice, PyObject,
    PyStr, CLS_OFFSET, MP_ASS_SUBSCRIPT_OFFSET, MP_SUBSCRIPT_OFFSET, TP_AS_MAPPING_OFFSET,
};
use crate::rewriter::{Location, RefType, Rewriter, VarId};
use crate::stats::StatCounter;

static SLOWPATH_GETITEM: StatCounter = StatCounter::new("slowpath_getitem");
static SLOWPATH_SETITEM: StatCounter = StatCounter::new("slowpath_setitem");
static SLOWPATH_DELITEM: StatCounter = StatCounter::new("slowpath_delitem");

fn is_stepless_slice(key: *mut PyObject) -> bool {
    unsafe {
        (*key).cls == builtins().slice_cls
            && (*(key as *mut PySlice)).step == objects::none_object()
    }
}

/// Resolve a slice bound to an integer: None maps to the given default.
fn slice_bound(bound: *mut PyObject, default: i64) -> Option<i64> {
    unsafe {
        if bound == objects::none_object() {
            Some(default)
        } else if objects::is_subclass((*bound).cls, builtins().int_cls) {
            Some(unbox_int(bound))
        } else {
            None
        }
    }
}

/// Call `target.__getitem__(key)` or, for a step-less slice on a class
/// defining the slice protocol, `target.__getslice__(start, stop)` (and
/// the set/del equivalents via `extra`).
fn call_item_or_slice_attr(
    target: *mut PyObject,
    item_str: *mut PyStr,
    slice_str: *mut PyStr,
    key: *mut PyObject,
    extra: Option<*mut PyObject>,
    rw: CallRw,
) -> *mut PyObject {
    let cls = unsafe { (*target).cls };

    if is_stepless_slice(key)
        && crate::dispatch::attr::type_lookup(cls, slice_str, None).is_some()
    {
        let slice = key as *mut PySlice;
        let (start, stop) = unsafe {
            match (
                slice_bound((*slice).start, 0),
                slice_bound((*slice).stop, i64::MAX),
            ) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    set_pending_exc(ExcInfo::new(
                        builtins().type_error,
                        "slice indices must be integers or None".to_string(),
                    ));
                    return std::ptr::null_mut();
                }
            }
        };
        // The bound boxes are fresh objects, so this shape never rewrites.
        let start_obj = box_int(start);
        let stop_obj = box_int(stop);
        let argspec = ArgPassSpec::positional(2 + extra.is_some() as usize);
        let rtn = callattr_internal(
            target,
            slice_str,
            true,
            None,
            argspec,
            start_obj,
            stop_obj,
            extra.unwrap_or(std::ptr::null_mut()),
            std::ptr::null_mut(),
            None,
        );
        unsafe {
            decref(start_obj);
            decref(stop_obj);
        }
        return rtn;
    }

    let argspec = ArgPassSpec::positional(1 + extra.is_some() as usize);
    callattr_internal(
        target,
        item_str,
        true,
        rw,
        argspec,
        key,
        extra.unwrap_or(std::ptr::null_mut()),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
}

struct ItemVars {
    target: VarId,
    key: VarId,
    value: Option<VarId>,
    destination: Location,
}

fn getitem_internal(
    target: *mut PyObject,
    key: *mut PyObject,
    mut rw: Option<(&mut Rewriter, ItemVars)>,
    out_rtn: &mut Option<VarId>,
) -> *mut PyObject {
    let cls = unsafe { (*target).cls };

    let mpm = unsafe { (*cls).tp_as_mapping };
    let mp_subscript = if mpm.is_null() {
        None
    } else {
        unsafe { (*mpm).mp_subscript }
    };
    if let Some(subscript) = mp_subscript {
        if let Some((r, vars)) = rw.as_mut() {
            let r_cls = r.get_attr(vars.target, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
            let r_m = r.get_attr(
                r_cls,
                TP_AS_MAPPING_OFFSET,
                Location::any(),
                crate::asm::MovType::Q,
            );
            r.add_guard_not_eq(r_m, 0);
            r.add_attr_guard(r_m, MP_SUBSCRIPT_OFFSET, subscript as u64, false);
            let r_rtn = r.call(true, subscript as usize, &[vars.target, vars.key]);
            let r_rtn = r.set_type(r_rtn, RefType::Owned);
            let r_rtn = r.set_nullable(r_rtn, true);
            *out_rtn = Some(r_rtn);
        }
        return subscript(target, key);
    }

    let getitem_str = intern_string("__getitem__");
    let getslice_str = intern_string("__getslice__");

    let rtn = match rw.as_mut() {
        Some((r, vars)) => {
            let mut cra = CallRA::new(vars.target, vars.destination);
            cra.arg1 = Some(vars.key);
            let inner: CallRw = Some((&mut **r, &mut cra));
            let rtn = call_item_or_slice_attr(target, getitem_str, getslice_str, key, None, inner);
            if cra.out_success && !rtn.is_null() {
                *out_rtn = cra.out_rtn;
            }
            rtn
        }
        None => call_item_or_slice_attr(target, getitem_str, getslice_str, key, None, None),
    };

    if rtn.is_null() && !exc_occurred() {
        set_pending_exc(ExcInfo::new(
            builtins().type_error,
            format!("'{}' object has no attribute '__getitem__'", type_name(target)),
        ));
    }
    rtn
}

fn getitem_entry(target: *mut PyObject, key: *mut PyObject, rtn_addr: *const u8) -> *mut PyObject {
    SLOWPATH_GETITEM.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 2, "getitem");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_target = r.get_arg(0);
            r.set_type(r_target, RefType::Borrowed);
            let r_key = r.get_arg(1);
            r.set_type(r_key, RefType::Borrowed);
            let vars = ItemVars {
                target: r_target,
                key: r_key,
                value: None,
                destination: r.get_return_destination(),
            };
            let mut out_rtn = None;
            rtn = getitem_internal(target, key, Some((&mut *r, vars)), &mut out_rtn);
            if !r.is_failed() {
                commit = out_rtn;
            }
        }
        None => {
            let mut out_rtn = None;
            rtn = getitem_internal(target, key, None, &mut out_rtn);
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }
    rtn
}

/// `target[key]`, CAPI flavor.
pub extern "C" fn getitem_capi(target: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    getitem_entry(target, key, take_ic_return_addr())
}

/// `target[key]`, Result flavor.
pub fn getitem(target: *mut PyObject, key: *mut PyObject) -> PyResult<*mut PyObject> {
    crate::error::to_result(getitem_entry(target, key, take_ic_return_addr()))
}

fn setitem_internal(
    target: *mut PyObject,
    key: *mut PyObject,
    value: *mut PyObject,
    mut rw: Option<(&mut Rewriter, ItemVars)>,
    out_done: &mut bool,
) -> i32 {
    let cls = unsafe { (*target).cls };

    let mpm = unsafe { (*cls).tp_as_mapping };
    let mp_ass = if mpm.is_null() {
        None
    } else {
        unsafe { (*mpm).mp_ass_subscript }
    };
    if let Some(ass_subscript) = mp_ass {
        if let Some((r, vars)) = rw.as_mut() {
            let r_cls = r.get_attr(vars.target, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
            let r_m = r.get_attr(
                r_cls,
                TP_AS_MAPPING_OFFSET,
                Location::any(),
                crate::asm::MovType::Q,
            );
            r.add_guard_not_eq(r_m, 0);
            r.add_attr_guard(r_m, MP_ASS_SUBSCRIPT_OFFSET, ass_subscript as u64, false);
            let r_status = r.call(
                true,
                ass_subscript as usize,
                &[vars.target, vars.key, vars.value.expect("setitem carries a value")],
            );
            r.check_and_throw_capi_exception(r_status, -1);
            *out_done = true;
        }
        return ass_subscript(target, key, value);
    }

    let setitem_str = intern_string("__setitem__");
    let setslice_str = intern_string("__setslice__");
    let rtn =
        call_item_or_slice_attr(target, setitem_str, setslice_str, key, Some(value), None);
    if rtn.is_null() {
        if !exc_occurred() {
            set_pending_exc(ExcInfo::new(
                builtins().type_error,
                format!("'{}' object does not support item assignment", type_name(target)),
            ));
        }
        return -1;
    }
    unsafe { decref(rtn) };
    0
}

fn setitem_entry(
    target: *mut PyObject,
    key: *mut PyObject,
    value: *mut PyObject,
    rtn_addr: *const u8,
) -> i32 {
    SLOWPATH_SETITEM.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 3, "setitem");
    let status;
    let mut commit = false;
    match rewriter.as_mut() {
        Some(r) => {
            let r_target = r.get_arg(0);
            r.set_type(r_target, RefType::Borrowed);
            let r_key = r.get_arg(1);
            r.set_type(r_key, RefType::Borrowed);
            let r_value = r.get_arg(2);
            r.set_type(r_value, RefType::Borrowed);
            let vars = ItemVars {
                target: r_target,
                key: r_key,
                value: Some(r_value),
                destination: r.get_return_destination(),
            };
            let mut out_done = false;
            status = setitem_internal(target, key, value, Some((&mut *r, vars)), &mut out_done);
            commit = out_done && !r.is_failed();
        }
        None => {
            let mut out_done = false;
            status = setitem_internal(target, key, value, None, &mut out_done);
        }
    }

    if commit && status == 0 {
        let mut rw = rewriter.take().unwrap();
        let zero = rw.load_const(0, Location::any());
        rw.commit_returning_non_python(zero);
    }
    status
}

/// `target[key] = value`, CAPI flavor.
pub extern "C" fn setitem_capi(
    target: *mut PyObject,
    key: *mut PyObject,
    value: *mut PyObject,
) -> i32 {
    setitem_entry(target, key, value, take_ic_return_addr())
}

/// `target[key] = value`, Result flavor.
pub fn setitem(target: *mut PyObject, key: *mut PyObject, value: *mut PyObject) -> PyResult<()> {
    if setitem_entry(target, key, value, take_ic_return_addr()) != 0 {
        Err(crate::error::take_pending_exc().expect("setitem failed silently"))
    } else {
        Ok(())
    }
}

fn delitem_internal(target: *mut PyObject, key: *mut PyObject) -> i32 {
    let cls = unsafe { (*target).cls };

    let mpm = unsafe { (*cls).tp_as_mapping };
    let mp_ass = if mpm.is_null() {
        None
    } else {
        unsafe { (*mpm).mp_ass_subscript }
    };
    if let Some(ass_subscript) = mp_ass {
        return ass_subscript(target, key, std::ptr::null_mut());
    }

    let delitem_str = intern_string("__delitem__");
    let delslice_str = intern_string("__delslice__");
    let rtn = call_item_or_slice_attr(target, delitem_str, delslice_str, key, None, None);
    if rtn.is_null() {
        if !exc_occurred() {
            set_pending_exc(ExcInfo::new(
                builtins().type_error,
                format!("'{}' object does not support item deletion", type_name(target)),
            ));
        }
        return -1;
    }
    unsafe { decref(rtn) };
    0
}

/// `del target[key]`, CAPI flavor.
pub extern "C" fn delitem_capi(target: *mut PyObject, key: *mut PyObject) -> i32 {
    SLOWPATH_DELITEM.log();
    delitem_internal(target, key)
}

/// `del target[key]`, Result flavor.
pub fn delitem(target: *mut PyObject, key: *mut PyObject) -> PyResult<()> {
    if delitem_capi(target, key) != 0 {
        Err(crate::error::take_pending_exc().expect("delitem failed silently"))
    } else {
        Ok(())
    }
}
