//! Comparison dispatch.
//!
//! `is`/`is not` are pointer identity. `in`/`not in` prefer the class's
//! `sq_contains` hook, then `__contains__`, then iteration. The rich
//! comparisons try the `tp_richcompare` fast path for same-class builtin
//! operands, then `__op__`, the reflected form, three-way `__cmp__`, and
//! finally the default identity/address comparison.

use crate::dispatch::call::{callattr_internal1, CallRw};
use crate::dispatch::CallRA;
use crate::error::{exc_occurred, set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::{
    self, box_bool, builtins, decref, intern_string, not_implemented, type_name, unbox_int,
    PyObject, CLS_OFFSET, PY_EQ, PY_GE, PY_GT, PY_LE, PY_LT, PY_NE, SQ_CONTAINS_OFFSET,
    TP_AS_SEQUENCE_OFFSET, TP_RICHCOMPARE_OFFSET,
};
use crate::rewriter::{CmpOp, Location, RefType, Rewriter, VarId};
use crate::stats::StatCounter;

static SLOWPATH_COMPARE: StatCounter = StatCounter::new("slowpath_compare");

pub const CMP_EQ: i32 = 0;
pub const CMP_NOT_EQ: i32 = 1;
pub const CMP_LT: i32 = 2;
pub const CMP_LT_E: i32 = 3;
pub const CMP_GT: i32 = 4;
pub const CMP_GT_E: i32 = 5;
pub const CMP_IS: i32 = 6;
pub const CMP_IS_NOT: i32 = 7;
pub const CMP_IN: i32 = 8;
pub const CMP_NOT_IN: i32 = 9;

fn cmp_op_name(op_type: i32) -> &'static str {
    match op_type {
        CMP_EQ => "__eq__",
        CMP_NOT_EQ => "__ne__",
        CMP_LT => "__lt__",
        CMP_LT_E => "__le__",
        CMP_GT => "__gt__",
        CMP_GT_E => "__ge__",
        _ => panic!("no method name for compare op {}", op_type),
    }
}

fn cmp_reverse_op_name(op_type: i32) -> &'static str {
    match op_type {
        CMP_EQ => "__eq__",
        CMP_NOT_EQ => "__ne__",
        CMP_LT => "__gt__",
        CMP_LT_E => "__ge__",
        CMP_GT => "__lt__",
        CMP_GT_E => "__le__",
        _ => panic!("no reverse method name for compare op {}", op_type),
    }
}

fn to_cpython_op(op_type: i32) -> i32 {
    match op_type {
        CMP_EQ => PY_EQ,
        CMP_NOT_EQ => PY_NE,
        CMP_LT => PY_LT,
        CMP_LT_E => PY_LE,
        CMP_GT => PY_GT,
        CMP_GT_E => PY_GE,
        _ => panic!("not a rich-compare op: {}", op_type),
    }
}

fn convert_3way_to_bool(result: i64, op_type: i32) -> bool {
    match op_type {
        CMP_EQ => result == 0,
        CMP_NOT_EQ => result != 0,
        CMP_LT => result < 0,
        CMP_LT_E => result <= 0,
        CMP_GT => result > 0,
        CMP_GT_E => result >= 0,
        _ => unreachable!(),
    }
}

/// Truth-test a `__contains__` result and box it, negating for `not in`.
/// Steals the reference to `contained`.
extern "C" fn nonzero_and_box(contained: *mut PyObject) -> *mut PyObject {
    let b = crate::dispatch::len::nonzero_internal(contained, None);
    unsafe { decref(contained) };
    if b < 0 {
        return std::ptr::null_mut();
    }
    box_bool(b != 0)
}

extern "C" fn nonzero_and_box_negated(contained: *mut PyObject) -> *mut PyObject {
    let b = crate::dispatch::len::nonzero_internal(contained, None);
    unsafe { decref(contained) };
    if b < 0 {
        return std::ptr::null_mut();
    }
    box_bool(b == 0)
}

struct CompareVars {
    lhs: VarId,
    rhs: VarId,
    destination: Location,
}

fn compare_internal(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
    mut rw: Option<(&mut Rewriter, CompareVars)>,
    out_rtn: &mut Option<VarId>,
) -> *mut PyObject {
    let b = builtins();

    if op_type == CMP_IS || op_type == CMP_IS_NOT {
        let neg = op_type == CMP_IS_NOT;
        if let Some((r, vars)) = rw.as_mut() {
            let cmpres = r.cmp(
                if neg { CmpOp::NotEq } else { CmpOp::Eq },
                vars.lhs,
                vars.rhs,
                vars.destination,
            );
            let rtn = r.call(false, box_bool_as_obj as usize, &[cmpres]);
            let rtn = r.set_type(rtn, RefType::Owned);
            *out_rtn = Some(rtn);
        }
        return box_bool((lhs == rhs) ^ neg);
    }

    if op_type == CMP_IN || op_type == CMP_NOT_IN {
        let negate = op_type == CMP_NOT_IN;
        let rhs_cls = unsafe { (*rhs).cls };

        // Follows PySequence_Contains: a native sq_contains wins.
        if unsafe { (*rhs_cls).has_feature(objects::TypeFlags::HAVE_SEQUENCE_IN) } {
            let sqm = unsafe { (*rhs_cls).tp_as_sequence };
            let sq_contains = if sqm.is_null() {
                None
            } else {
                unsafe { (*sqm).sq_contains }
            };
            if let Some(contains) = sq_contains {
                if let Some((r, vars)) = rw.as_mut() {
                    let r_cls =
                        r.get_attr(vars.rhs, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
                    let r_sqm = r.get_attr(
                        r_cls,
                        TP_AS_SEQUENCE_OFFSET,
                        Location::any(),
                        crate::asm::MovType::Q,
                    );
                    r.add_guard_not_eq(r_sqm, 0);
                    // Guard the hook's identity and call the known target.
                    r.add_attr_guard(r_sqm, SQ_CONTAINS_OFFSET, contains as u64, false);
                    let r_b = r.call(true, contains as usize, &[vars.rhs, vars.lhs]);
                    r.check_and_throw_capi_exception(r_b, -1);
                    let boxer = if negate {
                        box_bool_negated_i64 as usize
                    } else {
                        box_bool_i64 as usize
                    };
                    let r_r = r.call(false, boxer, &[r_b]);
                    let r_r = r.set_type(r_r, RefType::Owned);
                    *out_rtn = Some(r_r);
                }

                let res = contains(rhs, lhs);
                if res == -1 {
                    return std::ptr::null_mut();
                }
                let res = res != 0;
                return box_bool(res != negate);
            }
        }

        // __contains__, then iteration.
        let contains_str = intern_string("__contains__");
        let mut r_contained = None;
        let mut kill_rw = false;
        let contained = match rw.as_mut() {
            Some((r, vars)) => {
                let mut cra = CallRA::new(vars.rhs, vars.destination);
                cra.arg1 = Some(vars.lhs);
                let inner: CallRw = Some((&mut **r, &mut cra));
                let contained = callattr_internal1(rhs, contains_str, inner, lhs);
                if cra.out_success && !contained.is_null() {
                    r_contained = cra.out_rtn;
                } else if !contained.is_null() {
                    kill_rw = true;
                }
                contained
            }
            None => callattr_internal1(rhs, contains_str, None, lhs),
        };
        if kill_rw {
            rw = None;
        }

        if contained.is_null() {
            if exc_occurred() {
                return std::ptr::null_mut();
            }
            // Iterate.
            let elements = match objects::py_elements(rhs) {
                Some(e) => e,
                None => {
                    set_pending_exc(ExcInfo::new(
                        b.type_error,
                        format!("argument of type '{}' is not iterable", type_name(rhs)),
                    ));
                    return std::ptr::null_mut();
                }
            };
            let mut found = false;
            for e in elements {
                let eq = compare_internal(lhs, e, CMP_EQ, None, &mut None);
                if eq.is_null() {
                    return std::ptr::null_mut();
                }
                let is_eq = truthy(eq);
                if is_eq {
                    found = true;
                    break;
                }
            }
            return box_bool(found != negate);
        }

        if let (Some((r, _vars)), Some(rc)) = (rw.as_mut(), r_contained) {
            let boxer = if negate {
                nonzero_and_box_negated as usize
            } else {
                nonzero_and_box as usize
            };
            let r_box = r.call(true, boxer, &[rc]);
            r.ref_consumed(rc);
            let r_box = r.set_type(r_box, RefType::Owned);
            let r_box = r.set_nullable(r_box, true);
            *out_rtn = Some(r_box);
        }

        let res = truthy(contained);
        return box_bool(res != negate);
    }

    // Rich comparison. Rewrites only cover non-user-defined operands.
    let lhs_cls = unsafe { (*lhs).cls };
    let rhs_cls = unsafe { (*rhs).cls };
    let any_user_defined =
        unsafe { (*lhs_cls).is_user_defined || (*rhs_cls).is_user_defined };
    if any_user_defined {
        rw = None;
    }

    if let Some((r, vars)) = rw.as_mut() {
        r.add_attr_guard(vars.lhs, CLS_OFFSET, lhs_cls as u64, false);
        r.add_attr_guard(vars.rhs, CLS_OFFSET, rhs_cls as u64, false);
    }

    let cpython_op = to_cpython_op(op_type);

    if !any_user_defined && lhs_cls == rhs_cls {
        if let Some(richcmp) = unsafe { (*lhs_cls).tp_richcompare } {
            // Builtin same-class compares never return NotImplemented.
            let rtn = richcmp(lhs, rhs, cpython_op);
            if let Some((r, vars)) = rw.as_mut() {
                let r_lhs_cls =
                    r.get_attr(vars.lhs, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
                r.add_attr_guard(r_lhs_cls, TP_RICHCOMPARE_OFFSET, richcmp as u64, false);
                let r_op = r.load_const(cpython_op as i64, Location::any());
                let r_rtn = r.call(true, richcmp as usize, &[vars.lhs, vars.rhs, r_op]);
                let r_rtn = r.set_type(r_rtn, RefType::Owned);
                let r_rtn = r.set_nullable(r_rtn, true);
                *out_rtn = Some(r_rtn);
            }
            return rtn;
        }
    }

    let op_name = intern_string(cmp_op_name(op_type));
    let mut kill_rw = false;
    let lrtn = match rw.as_mut() {
        Some((r, vars)) => {
            let mut cra = CallRA::new(vars.lhs, vars.destination);
            cra.arg1 = Some(vars.rhs);
            let inner: CallRw = Some((&mut **r, &mut cra));
            let lrtn = callattr_internal1(lhs, op_name, inner, rhs);
            if cra.out_success && !lrtn.is_null() && lrtn != not_implemented() {
                *out_rtn = cra.out_rtn;
            } else if !lrtn.is_null() {
                kill_rw = true;
            }
            lrtn
        }
        None => callattr_internal1(lhs, op_name, None, rhs),
    };
    if kill_rw {
        rw = None;
        *out_rtn = None;
    }

    if !lrtn.is_null() {
        if lrtn != not_implemented() {
            return lrtn;
        }
        unsafe { decref(lrtn) };
        rw = None;
        *out_rtn = None;
    } else if exc_occurred() {
        return std::ptr::null_mut();
    }

    // The remaining fallbacks aren't worth patching.
    drop(rw);

    let rop_name = intern_string(cmp_reverse_op_name(op_type));
    let rrtn = callattr_internal1(rhs, rop_name, None, lhs);
    if !rrtn.is_null() {
        if rrtn != not_implemented() {
            return rrtn;
        }
        unsafe { decref(rrtn) };
    } else if exc_occurred() {
        return std::ptr::null_mut();
    }

    let cmp_str = intern_string("__cmp__");
    let lrtn = callattr_internal1(lhs, cmp_str, None, rhs);
    if !lrtn.is_null() {
        let keep = objects::AutoDecref(lrtn);
        if lrtn != not_implemented() {
            if unsafe { !objects::is_subclass((*lrtn).cls, b.int_cls) } {
                set_pending_exc(ExcInfo::new(
                    b.type_error,
                    "comparison did not return an int".to_string(),
                ));
                return std::ptr::null_mut();
            }
            let result = unbox_int(lrtn);
            drop(keep);
            return box_bool(convert_3way_to_bool(result, op_type));
        }
    } else if exc_occurred() {
        return std::ptr::null_mut();
    }

    if op_type == CMP_EQ {
        return box_bool(lhs == rhs);
    }
    if op_type == CMP_NOT_EQ {
        return box_bool(lhs != rhs);
    }

    // Default three-way compare: identity, then address order.
    let c = if lhs == rhs {
        0
    } else if (lhs as usize) < (rhs as usize) {
        -1
    } else {
        1
    };
    box_bool(convert_3way_to_bool(c, op_type))
}

fn truthy(boxed: *mut PyObject) -> bool {
    let keep = objects::AutoDecref(boxed);
    let result = unsafe {
        if objects::is_subclass((*boxed).cls, builtins().int_cls) {
            unbox_int(boxed) != 0
        } else {
            crate::dispatch::len::nonzero_internal(boxed, None) > 0
        }
    };
    drop(keep);
    result
}

extern "C" fn box_bool_as_obj(v: i64) -> *mut PyObject {
    box_bool(v != 0)
}

extern "C" fn box_bool_i64(v: i64) -> *mut PyObject {
    box_bool(v != 0)
}

extern "C" fn box_bool_negated_i64(v: i64) -> *mut PyObject {
    box_bool(v == 0)
}

fn compare_entry(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
    rtn_addr: *const u8,
) -> *mut PyObject {
    SLOWPATH_COMPARE.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 3, "compare");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_lhs = r.get_arg(0);
            r.set_type(r_lhs, RefType::Borrowed);
            let r_rhs = r.get_arg(1);
            r.set_type(r_rhs, RefType::Borrowed);
            let r_op = r.get_arg(2);
            r.add_guard(r_op, op_type as u64);
            let vars = CompareVars {
                lhs: r_lhs,
                rhs: r_rhs,
                destination: r.get_return_destination(),
            };
            let mut out_rtn = None;
            rtn = compare_internal(lhs, rhs, op_type, Some((&mut *r, vars)), &mut out_rtn);
            if !r.is_failed() {
                commit = out_rtn;
            }
        }
        None => {
            let mut out_rtn = None;
            rtn = compare_internal(lhs, rhs, op_type, None, &mut out_rtn);
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }
    rtn
}

/// `lhs <cmp> rhs`, CAPI flavor.
pub extern "C" fn compare_capi(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
) -> *mut PyObject {
    compare_entry(lhs, rhs, op_type, take_ic_return_addr())
}

/// `lhs <cmp> rhs`, Result flavor.
pub fn compare(lhs: *mut PyObject, rhs: *mut PyObject, op_type: i32) -> PyResult<*mut PyObject> {
    crate::error::to_result(compare_entry(lhs, rhs, op_type, take_ic_return_addr()))
}
