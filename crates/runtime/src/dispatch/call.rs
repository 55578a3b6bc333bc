//! Call dispatch: `runtime_call` (call any callable) and `callattr`
//! (look up a method and call it without materializing a bound method).
//!
//! The fast path a committed rewrite produces is: identity-guard the
//! callable, rearrange arguments (usually a passthrough), and call the
//! function's native entry directly.

use crate::dispatch::args::{rearrange_arguments, ArgPassSpec, KeywordNames, ParamReceiveSpec};
use crate::dispatch::attr::getattr_for_call;
use crate::dispatch::{CallRA, GetattrRA, ReturnConvention};
use crate::error::{exc_occurred, set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::{
    self, builtins, decref, incref, intern_string, type_name, PyFunction, PyInstanceMethod,
    PyObject, PyStr, CLS_OFFSET, IM_FUNC_OFFSET, IM_OBJ_OFFSET,
};
use crate::rewriter::{Location, RefType, Rewriter, VarId};
use crate::stats::StatCounter;

static SLOWPATH_RUNTIMECALL: StatCounter = StatCounter::new("slowpath_runtimecall");
static SLOWPATH_CALLATTR: StatCounter = StatCounter::new("slowpath_callattr");

pub type CallRw<'a, 'b> = Option<(&'a mut Rewriter, &'b mut CallRA)>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallattrFlags: u32 {
        const CLS_ONLY = 1;
        const NULL_ON_NONEXISTENT = 2;
    }
}

/// Pack callattr flags and the argument spec into the single flag word
/// the entry point receives.
pub fn callattr_flags(cls_only: bool, null_on_nonexistent: bool, argspec: ArgPassSpec) -> u64 {
    let mut f = CallattrFlags::empty();
    if cls_only {
        f |= CallattrFlags::CLS_ONLY;
    }
    if null_on_nonexistent {
        f |= CallattrFlags::NULL_ON_NONEXISTENT;
    }
    (f.bits() as u64) | ((argspec.as_int() as u64) << 32)
}

fn unpack_callattr_flags(flags: u64) -> (bool, bool, ArgPassSpec) {
    let f = CallattrFlags::from_bits_truncate(flags as u32);
    (
        f.contains(CallattrFlags::CLS_ONLY),
        f.contains(CallattrFlags::NULL_ON_NONEXISTENT),
        ArgPassSpec::from_int((flags >> 32) as u32),
    )
}

/// Call a function object: rearrange the arguments into its parameter
/// shape and invoke the native entry.
#[allow(clippy::too_many_arguments)]
pub fn call_func(
    func: *mut PyFunction,
    mut rw: CallRw,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> *mut PyObject {
    // The whole rewrite is specialized to this exact function object; the
    // slot keeps it alive so the identity guard can't alias a recycled
    // allocation.
    if let Some((r, cra)) = rw.as_mut() {
        r.add_guard(cra.obj, func as u64);
        r.add_gc_reference(func as *mut PyObject);
    }

    let mut rewrite_success = false;
    let rearranged = {
        let rw_inner = rw
            .as_mut()
            .map(|(r, cra)| (&mut **r, &mut **cra));
        rearrange_arguments(
            ParamReceiveSpec::for_function(func),
            Some(unsafe { &(*func).param_names }),
            func,
            unsafe { &(*func).defaults },
            rw_inner,
            &mut rewrite_success,
            argspec,
            arg1,
            arg2,
            arg3,
            args,
            keyword_names,
        )
    };
    let outputs = match rearranged {
        Ok(o) => o,
        Err(e) => {
            set_pending_exc(e);
            return std::ptr::null_mut();
        }
    };

    let o1 = outputs.first().copied().unwrap_or(std::ptr::null_mut());
    let o2 = outputs.get(1).copied().unwrap_or(std::ptr::null_mut());
    let o3 = outputs.get(2).copied().unwrap_or(std::ptr::null_mut());
    let rest_ptr = if outputs.len() > 3 {
        outputs[3..].as_ptr() as *mut *mut PyObject
    } else {
        std::ptr::null_mut()
    };

    let entry = unsafe { (*func).entry };
    let rtn = entry(func, o1, o2, o3, rest_ptr);

    for &p in &outputs {
        unsafe { decref(p) };
    }

    if rewrite_success {
        if let Some((r, cra)) = rw.as_mut() {
            if !r.is_failed() {
                let total = ParamReceiveSpec::for_function(func).total_received();
                let zero = r.load_const(0, Location::any());
                let a1v = if total >= 1 { cra.arg1.unwrap_or(zero) } else { zero };
                let a2v = if total >= 2 { cra.arg2.unwrap_or(zero) } else { zero };
                let a3v = if total >= 3 { cra.arg3.unwrap_or(zero) } else { zero };
                let argsv = if total > 3 {
                    cra.args.expect("rearranged overflow args")
                } else {
                    zero
                };
                let r_rtn = r.call(true, entry as usize, &[cra.obj, a1v, a2v, a3v, argsv]);
                let r_rtn = r.set_type(r_rtn, RefType::Owned);
                let r_rtn = r.set_nullable(r_rtn, true);
                cra.out_rtn = Some(r_rtn);
                cra.out_success = true;
            }
        }
    }

    rtn
}

/// Call `callable` with a receiver prepended to the arguments.
#[allow(clippy::too_many_arguments)]
fn call_with_receiver(
    callable: *mut PyObject,
    mut rw: CallRw,
    r_receiver: Option<VarId>,
    receiver: *mut PyObject,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> *mut PyObject {
    let new_spec = ArgPassSpec::new(
        argspec.num_args as usize + 1,
        argspec.num_keywords as usize,
        argspec.has_starargs,
        argspec.has_kwargs,
    );
    let old_total = argspec.total_passed();
    let new_total = new_spec.total_passed();

    if new_total <= 3 {
        let mut kill_rw = false;
        if let Some((_, cra)) = rw.as_mut() {
            match r_receiver {
                Some(rv) => {
                    cra.arg3 = cra.arg2;
                    cra.arg2 = cra.arg1;
                    cra.arg1 = Some(rv);
                }
                None => {
                    kill_rw = true;
                }
            }
        }
        if kill_rw {
            rw = None;
        }
        return runtime_call_internal(
            callable, rw, new_spec, receiver, arg1, arg2, std::ptr::null_mut(), keyword_names,
        );
    }

    // Need an argument array: [arg3, old overflow args...].
    let n_rest = old_total.saturating_sub(3);
    let mut rest_buf: Vec<*mut PyObject> = Vec::with_capacity(n_rest + 1);
    rest_buf.push(arg3);
    for i in 0..n_rest {
        rest_buf.push(unsafe { *args.add(i) });
    }

    let mut kill_rw = false;
    if let Some((r, cra)) = rw.as_mut() {
        match (r_receiver, cra.arg3) {
            (Some(rv), Some(old_a3)) => {
                let new_args = r.allocate_and_copy_plus1(
                    old_a3,
                    if n_rest > 0 { cra.args } else { None },
                    n_rest,
                );
                cra.args = Some(new_args);
                cra.arg3 = cra.arg2;
                cra.arg2 = cra.arg1;
                cra.arg1 = Some(rv);
            }
            _ => {
                kill_rw = true;
            }
        }
    }
    if kill_rw {
        rw = None;
    }

    runtime_call_internal(
        callable,
        rw,
        new_spec,
        receiver,
        arg1,
        arg2,
        rest_buf.as_mut_ptr(),
        keyword_names,
    )
}

/// Call any callable. Returns an owned reference or null with the error
/// pending.
#[allow(clippy::too_many_arguments)]
pub fn runtime_call_internal(
    obj: *mut PyObject,
    mut rw: CallRw,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> *mut PyObject {
    let cls = unsafe { (*obj).cls };
    let b = builtins();

    if cls == b.function_cls {
        return call_func(
            obj as *mut PyFunction,
            rw,
            argspec,
            arg1,
            arg2,
            arg3,
            args,
            keyword_names,
        );
    }

    if cls == b.instancemethod_cls {
        let im = obj as *mut PyInstanceMethod;
        let im_func = unsafe { (*im).func };
        let im_obj = unsafe { (*im).obj };

        if im_obj.is_null() {
            // Unbound: call the underlying function as-is.
            let inner_rw = match rw.as_mut() {
                Some((r, cra)) => {
                    r.add_attr_guard(cra.obj, CLS_OFFSET, cls as u64, false);
                    r.add_attr_guard(cra.obj, IM_FUNC_OFFSET, im_func as u64, false);
                    let r_func = r.get_attr(
                        cra.obj,
                        IM_FUNC_OFFSET,
                        Location::any(),
                        crate::asm::MovType::Q,
                    );
                    let r_func = r.set_type(r_func, RefType::Borrowed);
                    cra.obj = r_func;
                    Some((&mut **r, &mut **cra))
                }
                None => None,
            };
            return runtime_call_internal(
                im_func, inner_rw, argspec, arg1, arg2, arg3, args, keyword_names,
            );
        }

        let r_im_obj = match rw.as_mut() {
            Some((r, cra)) => {
                r.add_attr_guard(cra.obj, CLS_OFFSET, cls as u64, false);
                r.add_attr_guard(cra.obj, IM_FUNC_OFFSET, im_func as u64, false);
                let r_im_obj = r.get_attr(
                    cra.obj,
                    IM_OBJ_OFFSET,
                    Location::any(),
                    crate::asm::MovType::Q,
                );
                let r_im_obj = r.set_type(r_im_obj, RefType::Borrowed);
                let r_func = r.get_attr(
                    cra.obj,
                    IM_FUNC_OFFSET,
                    Location::any(),
                    crate::asm::MovType::Q,
                );
                let r_func = r.set_type(r_func, RefType::Borrowed);
                cra.obj = r_func;
                Some(r_im_obj)
            }
            None => None,
        };
        return call_with_receiver(
            im_func, rw, r_im_obj, im_obj, argspec, arg1, arg2, arg3, args, keyword_names,
        );
    }

    // A generic callable: look up __call__ through its class.
    rw = None;
    let _ = rw;
    let call_str = intern_string("__call__");
    let rtn = callattr_internal(
        obj,
        call_str,
        true,
        None,
        argspec,
        arg1,
        arg2,
        arg3,
        args,
        keyword_names,
    );
    if rtn.is_null() && !exc_occurred() {
        set_pending_exc(ExcInfo::new(
            b.type_error,
            format!("'{}' object is not callable", type_name(obj)),
        ));
    }
    rtn
}

/// Method-call dispatch: look `attr` up for calling (binding the receiver
/// when the attribute is a plain function on the class), then call it.
/// Returns null *without* a pending exception when the attribute does not
/// exist; entry points decide how to report that.
#[allow(clippy::too_many_arguments)]
pub fn callattr_internal(
    obj: *mut PyObject,
    attr: *mut PyStr,
    cls_only: bool,
    mut rw: CallRw,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> *mut PyObject {
    let mut bind_obj: *mut PyObject = std::ptr::null_mut();
    let mut r_bind_obj: Option<VarId> = None;

    let mut r_val: Option<VarId> = None;
    let mut kill_rw = false;
    let val = match rw.as_mut() {
        Some((r, cra)) => {
            let mut gra = GetattrRA::new(cra.obj, cra.destination);
            let val = getattr_for_call(
                obj,
                attr,
                cls_only,
                Some((&mut **r, &mut gra)),
                &mut bind_obj,
                &mut r_bind_obj,
            );
            if !gra.is_successful() {
                kill_rw = true;
            } else if !val.is_null() {
                let (var, conv) = gra.take_return();
                if conv == ReturnConvention::HasReturn {
                    r_val = var;
                } else {
                    kill_rw = true;
                }
            } else {
                gra.clear_return();
            }
            val
        }
        None => getattr_for_call(obj, attr, cls_only, None, &mut bind_obj, &mut r_bind_obj),
    };
    if kill_rw {
        rw = None;
    }

    if val.is_null() {
        return std::ptr::null_mut();
    }

    let rtn = {
        let inner_rw = match (rw.as_mut(), r_val) {
            (Some((r, cra)), Some(rv)) => {
                cra.obj = rv;
                Some((&mut **r, &mut **cra))
            }
            _ => None,
        };

        if bind_obj.is_null() {
            runtime_call_internal(
                val, inner_rw, argspec, arg1, arg2, arg3, args, keyword_names,
            )
        } else {
            call_with_receiver(
                val,
                inner_rw,
                r_bind_obj,
                bind_obj,
                argspec,
                arg1,
                arg2,
                arg3,
                args,
                keyword_names,
            )
        }
    };

    unsafe { decref(val) };
    rtn
}

// ---- Entry points ----

fn runtime_call_entry(
    obj: *mut PyObject,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
    rtn_addr: *const u8,
) -> *mut PyObject {
    SLOWPATH_RUNTIMECALL.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 7, "runtime_call");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let r_spec = r.get_arg(1);
            r.add_guard(r_spec, argspec.as_int() as u64);

            let mut cra = CallRA::new(r_obj, r.get_return_destination());
            let total = argspec.total_passed();
            if total >= 1 {
                let v = r.get_arg(2);
                r.set_type(v, RefType::Borrowed);
                cra.arg1 = Some(v);
            }
            if total >= 2 {
                let v = r.get_arg(3);
                r.set_type(v, RefType::Borrowed);
                cra.arg2 = Some(v);
            }
            if total >= 3 {
                let v = r.get_arg(4);
                r.set_type(v, RefType::Borrowed);
                cra.arg3 = Some(v);
            }
            if total > 3 {
                let v = r.get_arg(5);
                r.set_type(v, RefType::Borrowed);
                cra.args = Some(v);
            }

            rtn = runtime_call_internal(
                obj, Some((&mut *r, &mut cra)), argspec, arg1, arg2, arg3, args, keyword_names,
            );
            if cra.out_success && !r.is_failed() {
                commit = cra.out_rtn;
            }
        }
        None => {
            rtn = runtime_call_internal(
                obj, None, argspec, arg1, arg2, arg3, args, keyword_names,
            );
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }
    rtn
}

/// Call `obj(...)`, CAPI flavor.
pub fn runtime_call_capi(
    obj: *mut PyObject,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: *const KeywordNames,
) -> *mut PyObject {
    let kw = unsafe { keyword_names.as_ref() };
    runtime_call_entry(obj, argspec, arg1, arg2, arg3, args, kw, take_ic_return_addr())
}

/// Call `obj(...)`, Result flavor.
pub fn runtime_call(
    obj: *mut PyObject,
    argspec: ArgPassSpec,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> PyResult<*mut PyObject> {
    crate::error::to_result(runtime_call_entry(
        obj,
        argspec,
        arg1,
        arg2,
        arg3,
        args,
        keyword_names,
        take_ic_return_addr(),
    ))
}

fn callattr_entry(
    obj: *mut PyObject,
    attr: *mut PyStr,
    flags: u64,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
    rtn_addr: *const u8,
) -> *mut PyObject {
    SLOWPATH_CALLATTR.log();
    let (cls_only, null_on_nonexistent, argspec) = unpack_callattr_flags(flags);

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 8, "callattr");
    let rtn;
    let mut commit: Option<VarId> = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let r_attr = r.get_arg(1);
            r.add_guard(r_attr, attr as u64);
            let r_flags = r.get_arg(2);
            r.add_guard(r_flags, flags);

            let mut cra = CallRA::new(r_obj, r.get_return_destination());
            let total = argspec.total_passed();
            if total >= 1 {
                let v = r.get_arg(3);
                r.set_type(v, RefType::Borrowed);
                cra.arg1 = Some(v);
            }
            if total >= 2 {
                let v = r.get_arg(4);
                r.set_type(v, RefType::Borrowed);
                cra.arg2 = Some(v);
            }
            if total >= 3 {
                let v = r.get_arg(5);
                r.set_type(v, RefType::Borrowed);
                cra.arg3 = Some(v);
            }
            if total > 3 {
                let v = r.get_arg(6);
                r.set_type(v, RefType::Borrowed);
                cra.args = Some(v);
            }

            rtn = callattr_internal(
                obj,
                attr,
                cls_only,
                Some((&mut *r, &mut cra)),
                argspec,
                arg1,
                arg2,
                arg3,
                args,
                keyword_names,
            );
            if cra.out_success && !r.is_failed() {
                commit = cra.out_rtn;
            }
        }
        None => {
            rtn = callattr_internal(
                obj,
                attr,
                cls_only,
                None,
                argspec,
                arg1,
                arg2,
                arg3,
                args,
                keyword_names,
            );
        }
    }

    if let Some(v) = commit {
        if !rtn.is_null() {
            rewriter.take().unwrap().commit_returning(v);
        }
    }

    if rtn.is_null() && !exc_occurred() && !null_on_nonexistent {
        set_pending_exc(ExcInfo::new(
            builtins().attribute_error,
            format!(
                "'{}' object has no attribute '{}'",
                type_name(obj),
                unsafe { (*attr).s() }
            ),
        ));
    }
    rtn
}

/// `obj.attr(...)`, CAPI flavor; flag word built by [`callattr_flags`].
#[allow(clippy::too_many_arguments)]
pub extern "C" fn callattr_capi(
    obj: *mut PyObject,
    attr: *mut PyStr,
    flags: u64,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: *const KeywordNames,
) -> *mut PyObject {
    let kw = unsafe { keyword_names.as_ref() };
    callattr_entry(
        obj,
        attr,
        flags,
        arg1,
        arg2,
        arg3,
        args,
        kw,
        take_ic_return_addr(),
    )
}

/// `obj.attr(...)`, Result flavor.
#[allow(clippy::too_many_arguments)]
pub fn callattr(
    obj: *mut PyObject,
    attr: *mut PyStr,
    flags: u64,
    arg1: *mut PyObject,
    arg2: *mut PyObject,
    arg3: *mut PyObject,
    args: *mut *mut PyObject,
    keyword_names: Option<&KeywordNames>,
) -> PyResult<*mut PyObject> {
    crate::error::to_result(callattr_entry(
        obj,
        attr,
        flags,
        arg1,
        arg2,
        arg3,
        args,
        keyword_names,
        take_ic_return_addr(),
    ))
}

/// Convenience for internal callers: `obj.attr(args...)` with plain
/// positional arguments, null-on-missing.
pub fn callattr_simple(
    obj: *mut PyObject,
    attr: *mut PyStr,
    call_args: &[*mut PyObject],
) -> *mut PyObject {
    debug_assert!(call_args.len() <= 3);
    let argspec = ArgPassSpec::positional(call_args.len());
    callattr_internal(
        obj,
        attr,
        true,
        None,
        argspec,
        call_args.first().copied().unwrap_or(std::ptr::null_mut()),
        call_args.get(1).copied().unwrap_or(std::ptr::null_mut()),
        call_args.get(2).copied().unwrap_or(std::ptr::null_mut()),
        std::ptr::null_mut(),
        None,
    )
}

/// Helper other slow paths use: CLASS_ONLY one-argument method call with
/// rewrite threading (the binop/compare shape).
pub fn callattr_internal1(
    obj: *mut PyObject,
    attr: *mut PyStr,
    rw: CallRw,
    arg1: *mut PyObject,
) -> *mut PyObject {
    callattr_internal(
        obj,
        attr,
        true,
        rw,
        ArgPassSpec::positional(1),
        arg1,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
}

/// CLASS_ONLY zero-argument method call with rewrite threading.
pub fn callattr_internal0(obj: *mut PyObject, attr: *mut PyStr, rw: CallRw) -> *mut PyObject {
    callattr_internal(
        obj,
        attr,
        true,
        rw,
        ArgPassSpec::positional(0),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
}

/// Bind `func` to `obj` if it is a plain function (embedder helper).
pub fn bind_if_needed(func: *mut PyObject, obj: *mut PyObject) -> *mut PyObject {
    unsafe {
        if (*func).cls == builtins().function_cls {
            objects::new_instance_method(func, obj)
        } else {
            incref(func);
            func
        }
    }
}
