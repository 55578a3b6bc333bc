//! Attribute get/set/del slow paths.
//!
//! The generic lookup follows the descriptor protocol: find the attribute
//! on the type (MRO walk through the method cache); a data descriptor
//! (defines both `__get__` and `__set__`) wins over instance storage;
//! otherwise instance storage wins over a non-data descriptor. Each stage
//! threads rewrite state so the common shapes collapse into a few guards
//! plus one or two loads.

use crate::dispatch::args::ArgPassSpec;
use crate::dispatch::call::runtime_call_internal;
use crate::dispatch::{CallRA, GetattrRA, ReturnConvention, SetattrRA};
use crate::error::{exc_occurred, set_pending_exc, ExcInfo, PyResult};
use crate::ics::take_ic_return_addr;
use crate::objects::hiddenclass::{
    HCAttrs, HiddenClassKind, ATTRLIST_ATTRS_OFFSET, HCATTRS_HCLS_OFFSET, HCATTRS_LIST_OFFSET,
    INITIAL_ARRAY_SIZE,
};
use crate::objects::typecache::{assign_version_tag, cached_lookup, cache_store, type_modified};
use crate::objects::{
    self, builtins, incref, intern_string, type_name, xdecref, PyClass, PyGetSetDescr,
    PyMemberDescr, PyObject, PyProperty, PyStr, TypeFlags, CLS_OFFSET, TP_FLAGS_OFFSET,
    TP_VERSION_TAG_OFFSET,
};
use crate::rewriter::{Location, RefType, Rewriter};
use crate::stats::StatCounter;

static SLOWPATH_GETATTR: StatCounter = StatCounter::new("slowpath_getattr");
static SLOWPATH_SETATTR: StatCounter = StatCounter::new("slowpath_setattr");
static SLOWPATH_DELATTR: StatCounter = StatCounter::new("slowpath_delattr");
static SLOWPATH_GETCLSATTR: StatCounter = StatCounter::new("slowpath_getclsattr");
static BOX_GETATTR_SLOWPATH: StatCounter = StatCounter::new("slowpath_box_getattr");

pub type AttrRw<'a, 'b> = Option<(&'a mut Rewriter, &'b mut GetattrRA)>;

fn attrs_of(obj: *mut PyObject) -> *mut HCAttrs {
    unsafe {
        let offset = (*(*obj).cls).attrs_offset;
        debug_assert!(offset >= 0);
        (obj as *mut u8).offset(offset as isize) as *mut HCAttrs
    }
}

fn raise_attribute_error(obj: *mut PyObject, attr: *mut PyStr) -> ExcInfo {
    ExcInfo::new(
        builtins().attribute_error,
        format!(
            "'{}' object has no attribute '{}'",
            type_name(obj),
            unsafe { (*attr).s() }
        ),
    )
}

// ---- Instance storage lookup (one shape guard, two loads) ----

/// Look `attr` up in the object's hidden-class storage. Returns a
/// borrowed reference. Guards: class identity plus hidden-class identity
/// (or a dependence on the singleton shape).
pub fn instance_getattr(obj: *mut PyObject, attr: *mut PyStr, mut rw: AttrRw) -> Option<*mut PyObject> {
    BOX_GETATTR_SLOWPATH.log();
    let cls = unsafe { (*obj).cls };

    // The class determines the object's layout, so everything below
    // starts with a class guard.
    if let Some((r, ra)) = rw.as_mut() {
        if !ra.obj_shape_guarded {
            r.add_attr_guard(ra.obj, CLS_OFFSET, cls as u64, false);
        }
    }

    if !unsafe { (*cls).instances_have_hcattrs() } {
        if let Some((_, ra)) = rw.as_mut() {
            ra.set_return(None, ReturnConvention::NoReturn);
        }
        return None;
    }

    let attrs = attrs_of(obj);
    let hcls = unsafe { (*attrs).hcls };
    let attrs_offset = unsafe { (*cls).attrs_offset };

    if let Some((r, ra)) = rw.as_mut() {
        if !ra.obj_hcls_guarded {
            match unsafe { (*hcls).kind } {
                HiddenClassKind::Normal => {
                    r.add_attr_guard(
                        ra.obj,
                        attrs_offset + HCATTRS_HCLS_OFFSET,
                        hcls as u64,
                        false,
                    );
                }
                HiddenClassKind::Singleton => unsafe {
                    r.add_attr_guard(
                        ra.obj,
                        attrs_offset + HCATTRS_HCLS_OFFSET,
                        hcls as u64,
                        false,
                    );
                    (*hcls).add_dependence(r);
                },
            }
        }
    }

    let offset = unsafe { (*hcls).get_offset(attr) };
    match offset {
        None => {
            if let Some((_, ra)) = rw.as_mut() {
                ra.set_return(None, ReturnConvention::NoReturn);
            }
            None
        }
        Some(off) => {
            if let Some((r, ra)) = rw.as_mut() {
                let r_attrs = r.get_attr(
                    ra.obj,
                    attrs_offset + HCATTRS_LIST_OFFSET,
                    Location::any(),
                    crate::asm::MovType::Q,
                );
                let r_rtn = r.get_attr(
                    r_attrs,
                    off * 8 + ATTRLIST_ATTRS_OFFSET,
                    Location::any(),
                    crate::asm::MovType::Q,
                );
                r.set_type(r_rtn, RefType::Borrowed);
                ra.set_return(Some(r_rtn), ReturnConvention::HasReturn);
            }
            Some(unsafe { (*attrs).read(off) })
        }
    }
}

// ---- Type lookup through the method cache ----

/// MRO lookup of `attr` on `cls`, memoized in the method cache. Returns a
/// borrowed reference. With rewrite state, guards the class's flags and
/// version tag and embeds the result as a constant, registering the IC as
/// depending on the class's shape.
pub fn type_lookup(cls: *mut PyClass, attr: *mut PyStr, mut rw: AttrRw) -> Option<*mut PyObject> {
    unsafe {
        if !(*cls).has_feature(TypeFlags::HAVE_VERSION_TAG) {
            // No version tag to guard on; walk without rewriting.
            if let Some((_, ra)) = rw.as_mut() {
                ra.abandon();
            }
            return type_lookup_walk(cls, attr);
        }

        let mut val: Option<*mut PyObject> = None;
        let mut found_cached = false;
        if (*cls).has_feature(TypeFlags::VALID_VERSION_TAG) {
            if let Some(cached) = cached_lookup(cls, attr) {
                val = if cached.is_null() { None } else { Some(cached) };
                found_cached = true;
            }
        }

        if !found_cached {
            val = type_lookup_walk(cls, attr);
            cache_store(cls, attr, val.unwrap_or(std::ptr::null_mut()));
        }

        if let Some((r, ra)) = rw.as_mut() {
            if !assign_version_tag(cls) {
                ra.abandon();
                return val;
            }
            r.add_attr_guard(ra.obj, TP_FLAGS_OFFSET, (*cls).tp_flags.bits(), false);
            r.add_attr_guard(ra.obj, TP_VERSION_TAG_OFFSET, (*cls).tp_version_tag, false);
            r.add_dependence_on(&mut (*cls).dependent_icgetattrs);
            match val {
                None => ra.set_return(None, ReturnConvention::NoReturn),
                Some(v) => {
                    // The emitted code embeds the lookup result; the slot
                    // takes a reference so the address stays meaningful
                    // even if the class later drops its own.
                    r.add_gc_reference(v);
                    let rv = r.load_const(v as i64, Location::any());
                    let rv = r.set_type(rv, RefType::Borrowed);
                    ra.set_return(Some(rv), ReturnConvention::HasReturn);
                }
            }
        }

        val
    }
}

fn type_lookup_walk(cls: *mut PyClass, attr: *mut PyStr) -> Option<*mut PyObject> {
    unsafe {
        for &base in (*cls).mro_slice() {
            let base = base as *mut PyClass;
            if let Some(v) = (*base).get_own_attr(attr) {
                return Some(v);
            }
        }
        None
    }
}

// ---- Descriptor special cases ----

/// Fast handling for the built-in data descriptors (member, getset,
/// property). Returns the finished (owned) result, or None to continue
/// the generic protocol.
fn data_descriptor_instance_special_cases(
    obj: *mut PyObject,
    attr: *mut PyStr,
    descr: *mut PyObject,
    r_descr: Option<crate::rewriter::VarId>,
    mut rw: AttrRw,
) -> Option<*mut PyObject> {
    let descr_cls = unsafe { (*descr).cls };
    let b = builtins();

    if descr_cls == b.member_cls {
        let member = descr as *mut PyMemberDescr;
        let offset = unsafe { (*member).offset };
        let val = unsafe {
            *((obj as *mut u8).offset(offset as isize) as *mut *mut PyObject)
        };
        if let Some((r, ra)) = rw.as_mut() {
            // The descriptor is a constant under the version-tag guards;
            // its offset can be inlined as a single load.
            let _ = r_descr;
            let r_val = r.get_attr(ra.obj, offset, Location::any(), crate::asm::MovType::Q);
            r.add_guard_not_eq(r_val, 0);
            let r_val = r.set_type(r_val, RefType::Borrowed);
            r.incref(r_val);
            let r_val = r.set_type(r_val, RefType::Owned);
            ra.set_return(Some(r_val), ReturnConvention::HasReturn);
        }
        if val.is_null() {
            set_pending_exc(raise_attribute_error(obj, attr));
            if let Some((_, ra)) = rw.as_mut() {
                ra.abandon();
            }
            return Some(std::ptr::null_mut());
        }
        unsafe { incref(val) };
        return Some(val);
    }

    if descr_cls == b.getset_cls {
        let getset = descr as *mut PyGetSetDescr;
        let get = unsafe { (*getset).get };
        if let Some((r, ra)) = rw.as_mut() {
            let rtn = r.call(true, get as usize, &[ra.obj]);
            let rtn = r.set_type(rtn, RefType::Owned);
            let rtn = r.set_nullable(rtn, true);
            ra.set_return(Some(rtn), ReturnConvention::CapiReturn);
        }
        return Some(get(obj));
    }

    if descr_cls == b.property_cls {
        let prop = descr as *mut PyProperty;
        let prop_get = unsafe { (*prop).prop_get };
        if prop_get.is_null() {
            if let Some((_, ra)) = rw.as_mut() {
                ra.abandon();
            }
            set_pending_exc(ExcInfo::new(b.attribute_error, "unreadable attribute".to_string()));
            return Some(std::ptr::null_mut());
        }
        let res = match rw.as_mut() {
            Some((r, ra)) => {
                let r_get = r_descr.map(|d| {
                    r.get_attr(
                        d,
                        std::mem::offset_of!(PyProperty, prop_get) as i32,
                        Location::any(),
                        crate::asm::MovType::Q,
                    )
                });
                match r_get {
                    Some(r_get) => {
                        let r_get = r.set_type(r_get, RefType::Borrowed);
                        let mut cra = CallRA::new(r_get, ra.destination);
                        cra.arg1 = Some(ra.obj);
                        let res = runtime_call_internal(
                            prop_get,
                            Some((&mut **r, &mut cra)),
                            ArgPassSpec::positional(1),
                            obj,
                            std::ptr::null_mut(),
                            std::ptr::null_mut(),
                            std::ptr::null_mut(),
                            None,
                        );
                        if cra.out_success {
                            ra.set_return(cra.out_rtn, ReturnConvention::CapiReturn);
                        } else {
                            ra.abandon();
                        }
                        res
                    }
                    None => {
                        ra.abandon();
                        runtime_call_internal(
                            prop_get,
                            None,
                            ArgPassSpec::positional(1),
                            obj,
                            std::ptr::null_mut(),
                            std::ptr::null_mut(),
                            std::ptr::null_mut(),
                            None,
                        )
                    }
                }
            }
            None => runtime_call_internal(
                prop_get,
                None,
                ArgPassSpec::positional(1),
                obj,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                None,
            ),
        };
        return Some(res);
    }

    None
}

fn is_nondata_descriptor_special_case(descr: *mut PyObject) -> bool {
    let cls = unsafe { (*descr).cls };
    cls == builtins().function_cls || cls == builtins().instancemethod_cls
}

extern "C" fn bind_instance_method(
    func: *mut PyObject,
    obj: *mut PyObject,
) -> *mut PyObject {
    objects::new_instance_method(func, obj)
}

/// Non-data special cases (currently: plain functions found on the
/// type). With `for_call`, skips the bound-method allocation and hands
/// the receiver out separately.
#[allow(clippy::too_many_arguments)]
fn nondata_descriptor_instance_special_cases(
    obj: *mut PyObject,
    descr: *mut PyObject,
    r_descr: Option<crate::rewriter::VarId>,
    mut rw: AttrRw,
    for_call: bool,
    bind_obj_out: &mut *mut PyObject,
    r_bind_obj_out: &mut Option<crate::rewriter::VarId>,
) -> Option<*mut PyObject> {
    let descr_cls = unsafe { (*descr).cls };
    if descr_cls != builtins().function_cls {
        return None;
    }

    if for_call {
        *bind_obj_out = obj;
        if let Some((_, ra)) = rw.as_mut() {
            *r_bind_obj_out = Some(ra.obj);
            match r_descr {
                Some(d) => ra.set_return(Some(d), ReturnConvention::HasReturn),
                None => ra.abandon(),
            }
        }
        unsafe { incref(descr) };
        return Some(descr);
    }

    if let Some((r, ra)) = rw.as_mut() {
        match r_descr {
            Some(d) => {
                let rtn = r.call(false, bind_instance_method as usize, &[d, ra.obj]);
                let rtn = r.set_type(rtn, RefType::Owned);
                ra.set_return(Some(rtn), ReturnConvention::HasReturn);
            }
            None => ra.abandon(),
        }
    }
    Some(objects::new_instance_method(descr, obj))
}

// ---- The generic protocol ----

/// Full generic attribute lookup. Returns an owned reference, or null
/// (with an exception pending only if the lookup itself failed; a plain
/// miss returns null without one, and the entry points raise).
#[allow(clippy::too_many_arguments)]
pub fn getattr_internal_ex(
    obj: *mut PyObject,
    attr: *mut PyStr,
    mut rw: AttrRw,
    cls_only: bool,
    for_call: bool,
    bind_obj_out: &mut *mut PyObject,
    r_bind_obj_out: &mut Option<crate::rewriter::VarId>,
) -> *mut PyObject {
    *bind_obj_out = std::ptr::null_mut();

    let cls = unsafe { (*obj).cls };
    let is_type = objects::type_check(obj);

    // A class with a non-generic getattr hook owns the whole operation.
    if !is_type {
        if let Some(getattro) = unsafe { (*cls).tp_getattro } {
            if let Some((_, ra)) = rw.as_mut() {
                ra.abandon();
            }
            return getattro(obj, attr);
        }
    }

    // Look up the class attribute (it might be a descriptor). A data
    // descriptor takes precedence over the instance attribute; a
    // non-data descriptor yields to it.
    let mut descr: Option<*mut PyObject> = None;
    let mut r_descr: Option<crate::rewriter::VarId> = None;
    let mut kill_rw = false;
    match rw.as_mut() {
        Some((r, ra)) => {
            let r_obj_cls = r.get_attr(ra.obj, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
            let mut gra = GetattrRA::new(r_obj_cls, ra.destination);
            descr = type_lookup(cls, attr, Some((&mut **r, &mut gra)));
            if !gra.is_successful() {
                ra.abandon();
                kill_rw = true;
            } else if descr.is_some() {
                r_descr = Some(gra.expect_return(ReturnConvention::HasReturn));
            } else {
                gra.assert_return_convention(ReturnConvention::NoReturn);
            }
        }
        None => {
            descr = type_lookup(cls, attr, None);
        }
    }
    if kill_rw {
        rw = None;
    }

    let mut descr_get: Option<objects::DescrGetFunc> = None;
    if let Some(descr) = descr {
        let descr_cls = unsafe { (*descr).cls };
        descr_get = unsafe { (*descr_cls).tp_descr_get };

        if let Some((r, ra)) = rw.as_mut() {
            if let Some(d) = r_descr {
                r.add_attr_guard(d, CLS_OFFSET, descr_cls as u64, false);
                let _ = ra;
            }
        }

        // Built-in data descriptors first.
        if let Some(res) =
            data_descriptor_instance_special_cases(obj, attr, descr, r_descr, rw.as_mut().map(|(r, ra)| (&mut **r, &mut **ra)))
        {
            return res;
        }

        if !is_nondata_descriptor_special_case(descr) && !cls_only {
            // A descriptor with __set__ is a data descriptor and takes
            // precedence over instance storage; apply it now.
            let set_str = intern_string("__set__");
            let get_str = intern_string("__get__");
            let has_set = unsafe { (*descr_cls).tp_descr_set.is_some() }
                || type_lookup(descr_cls, set_str, None).is_some();
            if has_set {
                if let Some(get) = descr_get {
                    if let Some((_, ra)) = rw.as_mut() {
                        ra.abandon();
                    }
                    return get(descr, obj, cls as *mut PyObject);
                }
                if let Some(user_get) = type_lookup(descr_cls, get_str, None) {
                    if let Some((_, ra)) = rw.as_mut() {
                        ra.abandon();
                    }
                    return runtime_call_internal(
                        user_get,
                        None,
                        ArgPassSpec::positional(3),
                        descr,
                        obj,
                        cls as *mut PyObject,
                        std::ptr::null_mut(),
                        None,
                    );
                }
            }
        }
    }

    if !cls_only {
        if !is_type {
            // Instance storage.
            let mut kill_rw = false;
            let mut found_var = None;
            let val = match rw.as_mut() {
                Some((r, ra)) => {
                    let mut hra = GetattrRA::new(ra.obj, ra.destination);
                    hra.obj_shape_guarded = ra.obj_shape_guarded;
                    hra.obj_hcls_guarded = ra.obj_hcls_guarded;
                    let val = instance_getattr(obj, attr, Some((&mut **r, &mut hra)));
                    if !hra.is_successful() {
                        ra.abandon();
                        kill_rw = true;
                    } else if val.is_some() {
                        found_var = Some(hra.expect_return(ReturnConvention::HasReturn));
                    } else {
                        hra.assert_return_convention(ReturnConvention::NoReturn);
                    }
                    val
                }
                None => instance_getattr(obj, attr, None),
            };
            if kill_rw {
                rw = None;
            }
            if let Some(v) = found_var {
                if let Some((r, ra)) = rw.as_mut() {
                    r.incref(v);
                    let v = r.set_type(v, RefType::Owned);
                    ra.set_return(Some(v), ReturnConvention::HasReturn);
                }
            }
            if let Some(val) = val {
                unsafe { incref(val) };
                return val;
            }
        } else {
            // Type objects look the attribute up through their own MRO
            // and apply the descriptor protocol with a null instance.
            let obj_as_cls = obj as *mut PyClass;
            let mut r_val = None;
            let mut kill_rw = false;
            let val = match rw.as_mut() {
                Some((r, ra)) => {
                    let mut gra = GetattrRA::new(ra.obj, ra.destination);
                    let val = type_lookup(obj_as_cls, attr, Some((&mut **r, &mut gra)));
                    if !gra.is_successful() {
                        ra.abandon();
                        kill_rw = true;
                    } else if val.is_some() {
                        r_val = Some(gra.expect_return(ReturnConvention::HasReturn));
                    } else {
                        gra.assert_return_convention(ReturnConvention::NoReturn);
                    }
                    val
                }
                None => type_lookup(obj_as_cls, attr, None),
            };
            if kill_rw {
                rw = None;
            }

            if let Some(val) = val {
                let val_cls = unsafe { (*val).cls };

                // Plain functions come back unbound from a class access.
                if val_cls == builtins().function_cls {
                    if for_call {
                        if let Some((_, ra)) = rw.as_mut() {
                            *r_bind_obj_out = None;
                            match r_val {
                                Some(v) => ra.set_return(Some(v), ReturnConvention::HasReturn),
                                None => ra.abandon(),
                            }
                        }
                        unsafe { incref(val) };
                        return val;
                    }
                    if let Some((r, ra)) = rw.as_mut() {
                        match r_val {
                            Some(v) => {
                                let v = r.set_type(v, RefType::Borrowed);
                                r.incref(v);
                                let v = r.set_type(v, RefType::Owned);
                                ra.set_return(Some(v), ReturnConvention::HasReturn);
                            }
                            None => ra.abandon(),
                        }
                    }
                    unsafe { incref(val) };
                    return val;
                }

                let local_get = unsafe { (*val_cls).tp_descr_get };
                if let Some((r, ra)) = rw.as_mut() {
                    if let Some(v) = r_val {
                        r.add_attr_guard(v, CLS_OFFSET, val_cls as u64, false);
                    }
                    match (local_get, r_val) {
                        (None, Some(v)) => {
                            let v = r.set_type(v, RefType::Borrowed);
                            r.incref(v);
                            let v = r.set_type(v, RefType::Owned);
                            ra.set_return(Some(v), ReturnConvention::HasReturn);
                        }
                        (Some(get), Some(v)) => {
                            let zero = r.load_const(0, Location::any());
                            let rtn = r.call(true, get as usize, &[v, zero, ra.obj]);
                            let rtn = r.set_type(rtn, RefType::Owned);
                            let rtn = r.set_nullable(rtn, true);
                            ra.set_return(Some(rtn), ReturnConvention::CapiReturn);
                        }
                        _ => ra.abandon(),
                    }
                }
                match local_get {
                    None => {
                        unsafe { incref(val) };
                        return val;
                    }
                    Some(get) => {
                        return get(val, std::ptr::null_mut(), obj);
                    }
                }
            }
        }
    }

    // Non-data descriptor application.
    if let Some(descr) = descr {
        if let Some(res) = nondata_descriptor_instance_special_cases(
            obj,
            descr,
            r_descr,
            rw.as_mut().map(|(r, ra)| (&mut **r, &mut **ra)),
            for_call,
            bind_obj_out,
            r_bind_obj_out,
        ) {
            return res;
        }

        if let Some(get) = descr_get {
            if for_call {
                if let Some((_, ra)) = rw.as_mut() {
                    ra.abandon();
                }
            } else if let Some((r, ra)) = rw.as_mut() {
                match r_descr {
                    Some(d) => {
                        let r_cls = r.load_const(cls as i64, Location::any());
                        let rtn = r.call(true, get as usize, &[d, ra.obj, r_cls]);
                        let rtn = r.set_type(rtn, RefType::Owned);
                        let rtn = r.set_nullable(rtn, true);
                        ra.set_return(Some(rtn), ReturnConvention::CapiReturn);
                    }
                    None => ra.abandon(),
                }
            }
            return get(descr, obj, cls as *mut PyObject);
        }

        // A user-level descriptor: __get__ defined as a class attribute.
        let get_str = intern_string("__get__");
        let descr_cls = unsafe { (*descr).cls };
        if let Some(user_get) = type_lookup(descr_cls, get_str, None) {
            if let Some((_, ra)) = rw.as_mut() {
                ra.abandon();
            }
            return runtime_call_internal(
                user_get,
                None,
                ArgPassSpec::positional(3),
                descr,
                obj,
                cls as *mut PyObject,
                std::ptr::null_mut(),
                None,
            );
        }

        // Otherwise, just return the class attribute itself.
        if let Some((r, ra)) = rw.as_mut() {
            match r_descr {
                Some(d) => {
                    let d = r.set_type(d, RefType::Borrowed);
                    r.incref(d);
                    let d = r.set_type(d, RefType::Owned);
                    ra.set_return(Some(d), ReturnConvention::HasReturn);
                }
                None => ra.abandon(),
            }
        }
        unsafe { incref(descr) };
        return descr;
    }

    if let Some((_, ra)) = rw.as_mut() {
        ra.set_return(None, ReturnConvention::NoReturn);
    }
    std::ptr::null_mut()
}

pub fn getattr_internal(obj: *mut PyObject, attr: *mut PyStr, rw: AttrRw) -> *mut PyObject {
    let mut bind_obj = std::ptr::null_mut();
    let mut r_bind_obj = None;
    getattr_internal_ex(obj, attr, rw, false, false, &mut bind_obj, &mut r_bind_obj)
}

// ---- Entry points ----

fn getattr_entry(obj: *mut PyObject, attr: *mut PyStr, rtn_addr: *const u8) -> *mut PyObject {
    SLOWPATH_GETATTR.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 2, "getattr");

    let rtn;
    let mut ra_opt = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let r_attr = r.get_arg(1);
            r.set_type(r_attr, RefType::Borrowed);
            // Attribute names are interned and fixed per call site.
            r.add_guard(r_attr, attr as u64);

            let mut ra = GetattrRA::new(r_obj, r.get_return_destination());
            rtn = getattr_internal(obj, attr, Some((&mut *r, &mut ra)));
            ra_opt = Some(ra);
        }
        None => {
            rtn = getattr_internal(obj, attr, None);
        }
    }

    if let (Some(mut rw), Some(mut ra)) = (rewriter.take(), ra_opt.take()) {
        if !rtn.is_null() && ra.is_successful() && !rw.is_failed() {
            let (var, conv) = ra.take_return();
            match (var, conv) {
                (Some(v), ReturnConvention::HasReturn)
                | (Some(v), ReturnConvention::CapiReturn)
                | (Some(v), ReturnConvention::NoexcPossible) => {
                    rw.commit_returning(v);
                }
                _ => {}
            }
        }
        // Dropped un-committed rewrites abort and back off.
    }

    if rtn.is_null() && !exc_occurred() {
        set_pending_exc(raise_attribute_error(obj, attr));
    }
    rtn
}

/// `obj.attr`, CAPI flavor: null return with the error pending.
pub extern "C" fn getattr_capi(obj: *mut PyObject, attr: *mut PyStr) -> *mut PyObject {
    getattr_entry(obj, attr, take_ic_return_addr())
}

/// `obj.attr`, Result flavor.
pub fn getattr(obj: *mut PyObject, attr: *mut PyStr) -> PyResult<*mut PyObject> {
    crate::error::to_result(getattr_entry(obj, attr, take_ic_return_addr()))
}

fn getclsattr_entry(obj: *mut PyObject, attr: *mut PyStr, rtn_addr: *const u8) -> *mut PyObject {
    SLOWPATH_GETCLSATTR.log();

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 2, "getclsattr");
    let rtn;
    let mut ra_opt = None;
    let mut bind_obj = std::ptr::null_mut();
    let mut r_bind_obj = None;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let r_attr = r.get_arg(1);
            r.set_type(r_attr, RefType::Borrowed);
            r.add_guard(r_attr, attr as u64);
            let mut ra = GetattrRA::new(r_obj, r.get_return_destination());
            rtn = getattr_internal_ex(obj, attr, Some((&mut *r, &mut ra)), true, false, &mut bind_obj, &mut r_bind_obj);
            ra_opt = Some(ra);
        }
        None => {
            rtn = getattr_internal_ex(obj, attr, None, true, false, &mut bind_obj, &mut r_bind_obj);
        }
    }

    if let (Some(mut rw), Some(mut ra)) = (rewriter.take(), ra_opt.take()) {
        if !rtn.is_null() && ra.is_successful() && !rw.is_failed() {
            if let (Some(v), _) = ra.take_return() {
                rw.commit_returning(v);
            }
        }
    }

    if rtn.is_null() && !exc_occurred() {
        set_pending_exc(raise_attribute_error(obj, attr));
    }
    rtn
}

/// Class-only attribute lookup (`getclsattr`).
pub extern "C" fn getclsattr_capi(obj: *mut PyObject, attr: *mut PyStr) -> *mut PyObject {
    getclsattr_entry(obj, attr, take_ic_return_addr())
}

pub fn getclsattr(obj: *mut PyObject, attr: *mut PyStr) -> PyResult<*mut PyObject> {
    crate::error::to_result(getclsattr_entry(obj, attr, take_ic_return_addr()))
}

// ---- setattr ----

/// Store into hidden-class storage, transitioning the shape on append.
/// Steals the reference to `val`.
pub fn instance_setattr(
    obj: *mut PyObject,
    attr: *mut PyStr,
    val: *mut PyObject,
    mut rw: Option<(&mut Rewriter, &mut SetattrRA)>,
) {
    let cls = unsafe { (*obj).cls };
    debug_assert!(unsafe { (*cls).instances_have_hcattrs() });
    let attrs = attrs_of(obj);
    let attrs_offset = unsafe { (*cls).attrs_offset };
    let hcls = unsafe { (*attrs).hcls };

    if let Some((r, ra)) = rw.as_mut() {
        r.add_attr_guard(ra.obj, CLS_OFFSET, cls as u64, false);
        r.add_attr_guard(ra.obj, attrs_offset + HCATTRS_HCLS_OFFSET, hcls as u64, false);
    }

    match unsafe { (*hcls).kind } {
        HiddenClassKind::Normal => {
            if let Some(offset) = unsafe { (*hcls).get_offset(attr) } {
                if let Some((r, ra)) = rw.as_mut() {
                    let r_list = r.get_attr(
                        ra.obj,
                        attrs_offset + HCATTRS_LIST_OFFSET,
                        Location::any(),
                        crate::asm::MovType::Q,
                    );
                    let r_old = r.get_attr(
                        r_list,
                        offset * 8 + ATTRLIST_ATTRS_OFFSET,
                        Location::any(),
                        crate::asm::MovType::Q,
                    );
                    r.set_type(r_old, RefType::Owned);
                    r.set_attr(r_list, offset * 8 + ATTRLIST_ATTRS_OFFSET, ra.attrval);
                    r.ref_consumed(ra.attrval);
                    ra.out_success = true;
                }
                unsafe { (*attrs).replace(offset, val) };
            } else {
                let cur_size = unsafe { (*hcls).attribute_array_size() };
                let new_hcls = unsafe { (*hcls).get_or_make_child(attr) };

                if let Some((r, ra)) = rw.as_mut() {
                    let list_is_null = unsafe { (*attrs).attr_list.is_null() };
                    let at_capacity = cur_size >= INITIAL_ARRAY_SIZE && cur_size.is_power_of_two();
                    if list_is_null || at_capacity {
                        // The store would need a (re)allocation; leave
                        // that to the slow path.
                        ra.out_success = false;
                    } else {
                        let r_list = r.get_attr(
                            ra.obj,
                            attrs_offset + HCATTRS_LIST_OFFSET,
                            Location::any(),
                            crate::asm::MovType::Q,
                        );
                        r.set_attr(
                            r_list,
                            (cur_size as i32) * 8 + ATTRLIST_ATTRS_OFFSET,
                            ra.attrval,
                        );
                        r.ref_consumed(ra.attrval);
                        let r_newhcls = r.load_const(new_hcls as i64, Location::any());
                        r.set_attr(ra.obj, attrs_offset + HCATTRS_HCLS_OFFSET, r_newhcls);
                        ra.out_success = true;
                    }
                }

                unsafe {
                    (*attrs).append(cur_size, val);
                    (*attrs).hcls = new_hcls;
                }
            }
        }
        HiddenClassKind::Singleton => {
            unsafe {
                match (*hcls).get_offset(attr) {
                    Some(offset) => (*attrs).replace(offset, val),
                    None => {
                        let cur_size = (*hcls).attribute_array_size();
                        (*hcls).append_attribute(attr);
                        (*attrs).append(cur_size, val);
                    }
                }
            }
        }
    }
}

/// The generic setattr protocol. Steals the reference to `val`.
fn setattr_generic(
    obj: *mut PyObject,
    attr: *mut PyStr,
    val: *mut PyObject,
    mut rw: Option<(&mut Rewriter, &mut SetattrRA)>,
) -> PyResult<()> {
    // Data-descriptor dispatch: a descriptor on the type with a setter
    // intercepts the store.
    let cls = unsafe { (*obj).cls };
    let mut kill_rw = false;
    let descr = match rw.as_mut() {
        Some((r, ra)) => {
            let r_cls = r.get_attr(ra.obj, CLS_OFFSET, Location::any(), crate::asm::MovType::Q);
            let mut gra = GetattrRA::new(r_cls, Location::any());
            let descr = type_lookup(cls, attr, Some((&mut **r, &mut gra)));
            if !gra.is_successful() {
                kill_rw = true;
            } else if descr.is_some() {
                gra.clear_return();
            } else {
                gra.assert_return_convention(ReturnConvention::NoReturn);
            }
            descr
        }
        None => type_lookup(cls, attr, None),
    };
    if kill_rw {
        rw = None;
    }

    if let Some(descr) = descr {
        let descr_cls = unsafe { (*descr).cls };
        if let Some(descr_set) = unsafe { (*descr_cls).tp_descr_set } {
            // The value is stolen: release after handing it off.
            let r = descr_set(descr, obj, val);
            unsafe { xdecref(val) };
            if r != 0 {
                return Err(crate::error::take_pending_exc().expect("setter failed silently"));
            }
            return Ok(());
        }

        let set_str = intern_string("__set__");
        if let Some(user_set) = type_lookup(descr_cls, set_str, None) {
            let rtn = runtime_call_internal(
                user_set,
                None,
                ArgPassSpec::positional(3),
                descr,
                obj,
                val,
                std::ptr::null_mut(),
                None,
            );
            unsafe { xdecref(val) };
            if rtn.is_null() {
                return Err(crate::error::take_pending_exc().expect("setter failed silently"));
            }
            unsafe { xdecref(rtn) };
            return Ok(());
        }
    }

    if !unsafe { (*cls).instances_have_hcattrs() } {
        unsafe { xdecref(val) };
        return Err(ExcInfo::new(
            builtins().attribute_error,
            format!(
                "'{}' object has no attribute '{}'",
                type_name(obj),
                unsafe { (*attr).s() }
            ),
        ));
    }

    instance_setattr(obj, attr, val, rw);
    Ok(())
}

fn setattr_entry(
    obj: *mut PyObject,
    attr: *mut PyStr,
    val: *mut PyObject,
    rtn_addr: *const u8,
) -> i32 {
    SLOWPATH_SETATTR.log();

    // Class attribute assignment has its own (unrewritten) path.
    if objects::type_check(obj) {
        let cls = obj as *mut PyClass;
        if !unsafe { (*cls).is_user_defined } {
            unsafe { xdecref(val) };
            set_pending_exc(ExcInfo::new(
                builtins().type_error,
                format!(
                    "can't set attributes of built-in/extension type '{}'",
                    unsafe { &(*cls).name }
                ),
            ));
            return -1;
        }
        class_set_attr(cls, attr, val);
        unsafe { xdecref(val) };
        return 0;
    }

    if let Some(tp_setattro) = unsafe { (*(*obj).cls).tp_setattro } {
        let r = tp_setattro(obj, attr, val);
        unsafe { xdecref(val) };
        return r;
    }

    let mut rewriter = Rewriter::create_rewriter(rtn_addr, 3, "setattr");

    let result;
    let mut should_commit = false;
    match rewriter.as_mut() {
        Some(r) => {
            let r_obj = r.get_arg(0);
            r.set_type(r_obj, RefType::Borrowed);
            let r_attr = r.get_arg(1);
            r.set_type(r_attr, RefType::Borrowed);
            let r_val = r.get_arg(2);
            r.set_type(r_val, RefType::Owned);
            r.add_guard(r_attr, attr as u64);

            let mut ra = SetattrRA::new(r_obj, r_val);
            result = setattr_generic(obj, attr, val, Some((&mut *r, &mut ra)));
            should_commit = result.is_ok() && ra.out_success && !r.is_failed();
        }
        None => {
            result = setattr_generic(obj, attr, val, None);
        }
    }
    if should_commit {
        // The caller reads a status word; the fast path reports success.
        let mut rw = rewriter.take().unwrap();
        let zero = rw.load_const(0, Location::any());
        rw.commit_returning_non_python(zero);
    }

    match result {
        Ok(()) => 0,
        Err(e) => {
            set_pending_exc(e);
            -1
        }
    }
}

/// `obj.attr = val`, CAPI flavor. Steals the reference to `val`.
pub extern "C" fn setattr_capi(obj: *mut PyObject, attr: *mut PyStr, val: *mut PyObject) -> i32 {
    setattr_entry(obj, attr, val, take_ic_return_addr())
}

/// `obj.attr = val`, Result flavor. Steals the reference to `val`.
pub fn setattr(obj: *mut PyObject, attr: *mut PyStr, val: *mut PyObject) -> PyResult<()> {
    if setattr_capi(obj, attr, val) != 0 {
        Err(crate::error::take_pending_exc().expect("setattr failed silently"))
    } else {
        Ok(())
    }
}

/// Runtime-internal class attribute mutation: stores and fires the
/// type-modification protocol (version bump, cache purge, IC clears).
pub fn class_set_attr(cls: *mut PyClass, attr: *mut PyStr, val: *mut PyObject) {
    unsafe {
        (*cls).set_own_attr(attr, val);
        type_modified(cls);
    }
}

pub fn class_del_attr(cls: *mut PyClass, attr: *mut PyStr) -> bool {
    unsafe {
        let deleted = (*cls).del_own_attr(attr);
        if deleted {
            type_modified(cls);
        }
        deleted
    }
}

// ---- delattr ----

fn delattr_generic(obj: *mut PyObject, attr: *mut PyStr) -> PyResult<()> {
    let cls = unsafe { (*obj).cls };
    if !unsafe { (*cls).instances_have_hcattrs() } {
        return Err(raise_attribute_error(obj, attr));
    }

    let attrs = attrs_of(obj);
    let hcls = unsafe { (*attrs).hcls };
    match unsafe { (*hcls).kind } {
        HiddenClassKind::Normal => unsafe {
            let offset = match (*hcls).get_offset(attr) {
                Some(o) => o,
                None => return Err(raise_attribute_error(obj, attr)),
            };
            let old_size = (*hcls).attribute_array_size();
            let removed = (*attrs).remove_at(offset, old_size);
            (*attrs).hcls = (*hcls).del_attr_to_make_hc(attr);
            xdecref(removed);
            Ok(())
        },
        HiddenClassKind::Singleton => unsafe {
            let offset = match (*hcls).get_offset(attr) {
                Some(o) => o,
                None => return Err(raise_attribute_error(obj, attr)),
            };
            let old_size = (*hcls).attribute_array_size();
            let removed = (*attrs).remove_at(offset, old_size);
            (*hcls).del_attribute(attr);
            xdecref(removed);
            Ok(())
        },
    }
}

fn delattr_entry(obj: *mut PyObject, attr: *mut PyStr) -> i32 {
    SLOWPATH_DELATTR.log();

    if objects::type_check(obj) {
        let cls = obj as *mut PyClass;
        if !unsafe { (*cls).is_user_defined } {
            set_pending_exc(ExcInfo::new(
                builtins().type_error,
                format!(
                    "can't set attributes of built-in/extension type '{}'",
                    unsafe { &(*cls).name }
                ),
            ));
            return -1;
        }
        if !class_del_attr(cls, attr) {
            set_pending_exc(raise_attribute_error(obj, attr));
            return -1;
        }
        return 0;
    }

    // A user __delattr__ takes over.
    let delattr_str = intern_string("__delattr__");
    if let Some(del_attr) = type_lookup(unsafe { (*obj).cls }, delattr_str, None) {
        let rtn = runtime_call_internal(
            del_attr,
            None,
            ArgPassSpec::positional(2),
            obj,
            attr as *mut PyObject,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            None,
        );
        if rtn.is_null() {
            return -1;
        }
        unsafe { xdecref(rtn) };
        return 0;
    }

    match delattr_generic(obj, attr) {
        Ok(()) => 0,
        Err(e) => {
            set_pending_exc(e);
            -1
        }
    }
}

/// `del obj.attr`, CAPI flavor.
pub extern "C" fn delattr_capi(obj: *mut PyObject, attr: *mut PyStr) -> i32 {
    delattr_entry(obj, attr)
}

/// `del obj.attr`, Result flavor.
pub fn delattr(obj: *mut PyObject, attr: *mut PyStr) -> PyResult<()> {
    if delattr_entry(obj, attr) != 0 {
        Err(crate::error::take_pending_exc().expect("delattr failed silently"))
    } else {
        Ok(())
    }
}

// Small conveniences used across the dispatch layer and tests.

pub fn getattr_str(obj: *mut PyObject, name: &str) -> PyResult<*mut PyObject> {
    getattr(obj, intern_string(name))
}

pub fn setattr_str(obj: *mut PyObject, name: &str, val: *mut PyObject) -> PyResult<()> {
    unsafe { incref(val) };
    setattr(obj, intern_string(name), val)
}

pub fn delattr_str(obj: *mut PyObject, name: &str) -> PyResult<()> {
    delattr(obj, intern_string(name))
}

/// Lookup for a call: like getattr but may hand back the receiver
/// separately instead of allocating a bound method.
#[allow(clippy::too_many_arguments)]
pub fn getattr_for_call(
    obj: *mut PyObject,
    attr: *mut PyStr,
    cls_only: bool,
    rw: AttrRw,
    bind_obj_out: &mut *mut PyObject,
    r_bind_obj_out: &mut Option<crate::rewriter::VarId>,
) -> *mut PyObject {
    getattr_internal_ex(obj, attr, rw, cls_only, true, bind_obj_out, r_bind_obj_out)
}
