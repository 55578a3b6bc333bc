//! Binary operators.
//!
//! Resolution order: `lhs.__iop__` (augmented only), then the reflected
//! `rhs.__rop__` when rhs is a proper subclass of lhs's class, then
//! `lhs.__op__`, then the reflected form — with `NotImplemented` falling
//! through each stage. Rewrites are attempted only when neither operand
//! class is user-defined, since user classes can answer differently per
//! call even for identical types.

use crate::dispatch::call::{callattr_internal1, CallRw};
use crate::dispatch::CallRA;
use crate::error::{set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::{
    builtins, decref, intern_string, is_subclass, not_implemented, type_name, PyObject, PyStr,
    CLS_OFFSET, TP_MRO_OFFSET,
};
use crate::rewriter::{Location, RefType, Rewriter, VarId};
use crate::stats::StatCounter;

static SLOWPATH_BINOP: StatCounter = StatCounter::new("slowpath_binop");
static SLOWPATH_AUGBINOP: StatCounter = StatCounter::new("slowpath_augbinop");

pub const OP_ADD: i32 = 0;
pub const OP_SUB: i32 = 1;
pub const OP_MUL: i32 = 2;
pub const OP_DIV: i32 = 3;
pub const OP_MOD: i32 = 4;
pub const OP_POW: i32 = 5;
pub const OP_LSHIFT: i32 = 6;
pub const OP_RSHIFT: i32 = 7;
pub const OP_AND: i32 = 8;
pub const OP_OR: i32 = 9;
pub const OP_XOR: i32 = 10;
pub const OP_FLOORDIV: i32 = 11;

fn op_base_name(op_type: i32) -> &'static str {
    match op_type {
        OP_ADD => "add",
        OP_SUB => "sub",
        OP_MUL => "mul",
        OP_DIV => "div",
        OP_MOD => "mod",
        OP_POW => "pow",
        OP_LSHIFT => "lshift",
        OP_RSHIFT => "rshift",
        OP_AND => "and",
        OP_OR => "or",
        OP_XOR => "xor",
        OP_FLOORDIV => "floordiv",
        _ => panic!("unknown binop {}", op_type),
    }
}

pub fn get_op_name(op_type: i32) -> *mut PyStr {
    intern_string(&format!("__{}__", op_base_name(op_type)))
}

pub fn get_reverse_op_name(op_type: i32) -> *mut PyStr {
    intern_string(&format!("__r{}__", op_base_name(op_type)))
}

pub fn get_inplace_op_name(op_type: i32) -> *mut PyStr {
    intern_string(&format!("__i{}__", op_base_name(op_type)))
}

pub fn get_op_symbol(op_type: i32) -> &'static str {
    match op_type {
        OP_ADD => "+",
        OP_SUB => "-",
        OP_MUL => "*",
        OP_DIV => "/",
        OP_MOD => "%",
        OP_POW => "**",
        OP_LSHIFT => "<<",
        OP_RSHIFT => ">>",
        OP_AND => "&",
        OP_OR => "|",
        OP_XOR => "^",
        OP_FLOORDIV => "//",
        _ => panic!("unknown binop {}", op_type),
    }
}

/// Try one `lhs.<op_name>(rhs)` stage. Returns null when the class has no
/// such method; `NotImplemented` when the method declined.
fn binop_internal_helper(
    rw: &mut Option<(&mut Rewriter, BinopVars)>,
    op_name: *mut PyStr,
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    swapped: bool,
    out_rtn: &mut Option<VarId>,
) -> *mut PyObject {
    let mut kill_rw = false;
    let rtn = match rw.as_mut() {
        Some((r, vars)) => {
            let (r_lhs, r_rhs) = if swapped {
                (vars.rhs, vars.lhs)
            } else {
                (vars.lhs, vars.rhs)
            };
            let mut cra = CallRA::new(r_lhs, vars.destination);
            cra.arg1 = Some(r_rhs);
            cra.args_guarded = true;
            let inner: CallRw = Some((&mut **r, &mut cra));
            let rtn = callattr_internal1(lhs, op_name, inner, rhs);

            if !cra.out_success {
                if !rtn.is_null() {
                    // The call happened but the rewrite didn't survive.
                    kill_rw = true;
                }
            } else if rtn == not_implemented() {
                // The guards so far were fine, but there are more stages
                // to run after a mutation already happened; give up.
                kill_rw = true;
            } else if !rtn.is_null() {
                *out_rtn = cra.out_rtn;
            }
            rtn
        }
        None => callattr_internal1(lhs, op_name, None, rhs),
    };
    if kill_rw {
        *rw = None;
    }
    rtn
}

struct BinopVars {
    lhs: VarId,
    rhs: VarId,
    destination: Location,
}

fn binop_internal(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
    inplace: bool,
    mut rw: Option<(&mut Rewriter, BinopVars)>,
    out_rtn: &mut Option<VarId>,
) -> *mut PyObject {
    let lhs_cls = unsafe { (*lhs).cls };
    let rhs_cls = unsafe { (*rhs).cls };

    if let Some((r, vars)) = rw.as_mut() {
        let r_lhs_cls = r.get_attr(vars.lhs, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
        let r_lhs_cls = r.set_type(r_lhs_cls, RefType::Borrowed);
        r.add_guard(r_lhs_cls, lhs_cls as u64);
        let r_rhs_cls = r.get_attr(vars.rhs, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
        let r_rhs_cls = r.set_type(r_rhs_cls, RefType::Borrowed);
        r.add_guard(r_rhs_cls, rhs_cls as u64);

        r.add_attr_guard(r_lhs_cls, TP_MRO_OFFSET, unsafe { (*lhs_cls).tp_mro } as u64, false);
        r.add_attr_guard(r_rhs_cls, TP_MRO_OFFSET, unsafe { (*rhs_cls).tp_mro } as u64, false);
    }

    if inplace {
        let iop_name = get_inplace_op_name(op_type);
        let irtn = binop_internal_helper(&mut rw, iop_name, lhs, rhs, false, out_rtn);
        if !irtn.is_null() {
            if irtn != not_implemented() {
                return irtn;
            }
            unsafe { decref(irtn) };
        } else if crate::error::exc_occurred() {
            return std::ptr::null_mut();
        }
    }

    // A subclass's reflected method outranks the forward one.
    let mut should_try_reverse = true;
    if lhs_cls != rhs_cls && is_subclass(rhs_cls, lhs_cls) {
        should_try_reverse = false;
        let rop_name = get_reverse_op_name(op_type);
        let rrtn = binop_internal_helper(&mut rw, rop_name, rhs, lhs, true, out_rtn);
        if !rrtn.is_null() {
            if rrtn != not_implemented() {
                return rrtn;
            }
            unsafe { decref(rrtn) };
        } else if crate::error::exc_occurred() {
            return std::ptr::null_mut();
        }
    }

    let op_name = get_op_name(op_type);
    let lrtn = binop_internal_helper(&mut rw, op_name, lhs, rhs, false, out_rtn);
    if !lrtn.is_null() {
        if lrtn != not_implemented() {
            return lrtn;
        }
        unsafe { decref(lrtn) };
    } else if crate::error::exc_occurred() {
        return std::ptr::null_mut();
    }

    if should_try_reverse {
        let rop_name = get_reverse_op_name(op_type);
        let rrtn = binop_internal_helper(&mut rw, rop_name, rhs, lhs, true, out_rtn);
        if !rrtn.is_null() {
            if rrtn != not_implemented() {
                return rrtn;
            }
            unsafe { decref(rrtn) };
        } else if crate::error::exc_occurred() {
            return std::ptr::null_mut();
        }
    }

    let suffix = if inplace { "=" } else { "" };
    set_pending_exc(ExcInfo::new(
        builtins().type_error,
        format!(
            "unsupported operand type(s) for {}{}: '{}' and '{}'",
            get_op_symbol(op_type),
            suffix,
            type_name(lhs),
            type_name(rhs),
        ),
    ));
    std::ptr::null_mut()
}

fn binop_entry(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
    inplace: bool,
    rtn_addr: *const u8,
) -> *mut PyObject {
    if inplace {
        SLOWPATH_AUGBINOP.log();
    } else {
        SLOWPATH_BINOP.log();
    }

    // User-defined operands can resolve differently per call even for the
    // same classes, so only builtin pairs get patched.
    let can_patchpoint =
        unsafe { !(*(*lhs).cls).is_user_defined && !(*(*rhs).cls).is_user_defined };

    let mut rewriter = if can_patchpoint {
        Rewriter::create_rewriter(rtn_addr, 3, "binop")
    } else {
        None
    };

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
            let vars = BinopVars {
                lhs: r_lhs,
                rhs: r_rhs,
                destination: r.get_return_destination(),
            };
            let mut out_rtn = None;
            rtn = binop_internal(lhs, rhs, op_type, inplace, Some((&mut *r, vars)), &mut out_rtn);
            if !r.is_failed() {
                commit = out_rtn;
            }
        }
        None => {
            let mut out_rtn = None;
            rtn = binop_internal(lhs, rhs, op_type, inplace, None, &mut out_rtn);
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }
    rtn
}

/// `lhs <op> rhs`, CAPI flavor.
pub extern "C" fn binop_capi(lhs: *mut PyObject, rhs: *mut PyObject, op_type: i32) -> *mut PyObject {
    binop_entry(lhs, rhs, op_type, false, take_ic_return_addr())
}

/// `lhs <op>= rhs`, CAPI flavor.
pub extern "C" fn augbinop_capi(
    lhs: *mut PyObject,
    rhs: *mut PyObject,
    op_type: i32,
) -> *mut PyObject {
    binop_entry(lhs, rhs, op_type, true, take_ic_return_addr())
}

/// `lhs <op> rhs`, Result flavor.
pub fn binop(lhs: *mut PyObject, rhs: *mut PyObject, op_type: i32) -> PyResult<*mut PyObject> {
    crate::error::to_result(binop_entry(lhs, rhs, op_type, false, take_ic_return_addr()))
}

/// `lhs <op>= rhs`, Result flavor.
pub fn augbinop(lhs: *mut PyObject, rhs: *mut PyObject, op_type: i32) -> PyResult<*mut PyObject> {
    crate::error::to_result(binop_entry(lhs, rhs, op_type, true, take_ic_return_addr()))
}
