//! Methods on the builtin classes, registered as ordinary function
//! objects so the generic dispatch (and its rewrites) treat builtins and
//! user classes uniformly.

use crate::error::set_pending_exc;
use crate::error::ExcInfo;
use crate::objects::*;

fn int_like(cls: *mut PyClass, b: &Builtins) -> bool {
    cls == b.int_cls || cls == b.bool_cls || cls == b.long_cls
}

macro_rules! int_binop_entry {
    ($name:ident, $op:tt) => {
        extern "C" fn $name(
            _f: *mut PyFunction,
            a: *mut PyObject,
            b: *mut PyObject,
            _a3: *mut PyObject,
            _rest: *mut *mut PyObject,
        ) -> *mut PyObject {
            let bt = builtins_raw();
            unsafe {
                if !int_like((*a).cls, bt) || !int_like((*b).cls, bt) {
                    incref(bt.not_implemented);
                    return bt.not_implemented;
                }
                let x = (*(a as *mut PyInt)).n;
                let y = (*(b as *mut PyInt)).n;
                box_int(x $op y)
            }
        }
    };
}

int_binop_entry!(int_add_entry, +);
int_binop_entry!(int_sub_entry, -);
int_binop_entry!(int_mul_entry, *);

extern "C" fn int_radd_entry(
    f: *mut PyFunction,
    a: *mut PyObject,
    b: *mut PyObject,
    a3: *mut PyObject,
    rest: *mut *mut PyObject,
) -> *mut PyObject {
    int_add_entry(f, b, a, a3, rest)
}

extern "C" fn str_add_entry(
    _f: *mut PyFunction,
    a: *mut PyObject,
    b: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    let bt = builtins_raw();
    unsafe {
        if (*a).cls != bt.str_cls || (*b).cls != bt.str_cls {
            incref(bt.not_implemented);
            return bt.not_implemented;
        }
        let mut s = (*(a as *mut PyStr)).value.clone();
        s.push_str(&(*(b as *mut PyStr)).value);
        new_string_uninterned(&s)
    }
}

extern "C" fn dict_keys_entry(
    _f: *mut PyFunction,
    d: *mut PyObject,
    _a2: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    let bt = builtins_raw();
    unsafe {
        if !is_subclass((*d).cls, bt.dict_cls) {
            set_pending_exc(ExcInfo::new(
                bt.type_error,
                format!("descriptor 'keys' requires a 'dict' object but received a '{}'", type_name(d)),
            ));
            return std::ptr::null_mut();
        }
        let keys: Vec<*mut PyObject> = (*(d as *mut PyDict))
            .map
            .keys()
            .map(|&k| k as *mut PyObject)
            .collect();
        new_list(&keys)
    }
}

extern "C" fn list_append_entry(
    _f: *mut PyFunction,
    l: *mut PyObject,
    item: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    let bt = builtins_raw();
    unsafe {
        if !is_subclass((*l).cls, bt.list_cls) {
            set_pending_exc(ExcInfo::new(
                bt.type_error,
                "descriptor 'append' requires a 'list' object".to_string(),
            ));
            return std::ptr::null_mut();
        }
        incref(item);
        (*(l as *mut PyList)).elts.push(item);
        incref(bt.none);
        bt.none
    }
}

fn method(b: &Builtins, cls: *mut PyClass, name: &str, entry: FunctionEntry, num_args: u32) {
    let f = new_function(name, entry, num_args, false, false, &[], &[]);
    unsafe {
        (*cls).set_own_attr(intern_string(name), f);
        decref(f);
    }
    let _ = b;
}

/// Install the builtin methods. Runs once, after the class table exists.
pub(super) fn register(b: &Builtins) {
    method(b, b.int_cls, "__add__", int_add_entry, 2);
    method(b, b.int_cls, "__radd__", int_radd_entry, 2);
    method(b, b.int_cls, "__sub__", int_sub_entry, 2);
    method(b, b.int_cls, "__mul__", int_mul_entry, 2);
    method(b, b.str_cls, "__add__", str_add_entry, 2);
    method(b, b.dict_cls, "keys", dict_keys_entry, 1);
    method(b, b.list_cls, "append", list_append_entry, 2);

    // Registering methods bumped the version tags; start the classes
    // clean so the first lookups cache against their final shapes.
    for &cls in &[b.int_cls, b.str_cls, b.dict_cls, b.list_cls] {
        crate::objects::typecache::assign_version_tag(cls);
    }
}
