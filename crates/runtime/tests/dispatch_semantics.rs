//! Slow-path semantics: every operation must behave like the full
//! generic protocol regardless of any caching. These tests never execute
//! patched code; they drive the Result-flavored entry points directly.

use quickening::dispatch::args::ArgPassSpec;
use quickening::dispatch::{attr, binop, call, compare, item, len};
use quickening::error::take_pending_exc;
use quickening::objects::{
    self, box_bool, box_int, box_str, builtins, create_user_class, intern_string, new_function,
    new_instance, new_list, new_property, new_slice, new_tuple, not_implemented, refcnt,
    unbox_bool, unbox_int, PyFunction, PyObject,
};

fn obj_of(cls_name: &str) -> *mut PyObject {
    let _ = env_logger::builder().is_test(true).try_init();
    let cls = create_user_class(cls_name, &[]);
    new_instance(cls)
}

unsafe fn drop_obj(o: *mut PyObject) {
    objects::decref(o);
}

// ---- attribute protocol ----

#[test]
fn getattr_reads_what_setattr_wrote() {
    let obj = obj_of("AttrRoundTrip");
    attr::setattr_str(obj, "x", box_int(7)).unwrap();

    let v = attr::getattr_str(obj, "x").unwrap();
    assert_eq!(unbox_int(v), 7);
    unsafe {
        objects::decref(v);
        drop_obj(obj);
    }
}

#[test]
fn missing_attribute_raises_attribute_error() {
    let obj = obj_of("AttrMissing");
    let err = attr::getattr_str(obj, "nope").unwrap_err();
    assert_eq!(err.exc_type, builtins().attribute_error);
    assert!(err.message.contains("nope"));
    unsafe { drop_obj(obj) };
}

#[test]
fn set_then_del_restores_reachable_attribute_set() {
    let obj = obj_of("AttrDel");
    attr::setattr_str(obj, "a", box_int(1)).unwrap();
    attr::setattr_str(obj, "b", box_int(2)).unwrap();

    let v = box_int(99);
    attr::setattr_str(obj, "tmp", v).unwrap();
    attr::delattr_str(obj, "tmp").unwrap();
    // The deleted attribute released its reference.
    assert_eq!(refcnt(v), 1);
    unsafe { objects::decref(v) };

    assert!(attr::getattr_str(obj, "tmp").is_err());
    let a = attr::getattr_str(obj, "a").unwrap();
    let b = attr::getattr_str(obj, "b").unwrap();
    assert_eq!(unbox_int(a), 1);
    assert_eq!(unbox_int(b), 2);
    unsafe {
        objects::decref(a);
        objects::decref(b);
        drop_obj(obj);
    }
}

#[test]
fn overwriting_attribute_releases_old_value() {
    let obj = obj_of("AttrOverwrite");
    let old = box_int(1);
    attr::setattr_str(obj, "v", old).unwrap();
    assert_eq!(refcnt(old), 2);
    attr::setattr_str(obj, "v", box_int(2)).unwrap();
    assert_eq!(refcnt(old), 1);
    let v = attr::getattr_str(obj, "v").unwrap();
    assert_eq!(unbox_int(v), 2);
    unsafe {
        objects::decref(v);
        objects::decref(old);
        drop_obj(obj);
    }
}

// ---- functions, methods, calls ----

extern "C" fn add_one_entry(
    _f: *mut PyFunction,
    _self: *mut PyObject,
    a: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(unbox_int(a) + 1)
}

extern "C" fn sum3_entry(
    _f: *mut PyFunction,
    a: *mut PyObject,
    b: *mut PyObject,
    c: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(unbox_int(a) + unbox_int(b) + unbox_int(c))
}

extern "C" fn sum5_entry(
    _f: *mut PyFunction,
    a: *mut PyObject,
    b: *mut PyObject,
    c: *mut PyObject,
    rest: *mut *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let d = *rest;
        let e = *rest.add(1);
        box_int(unbox_int(a) + unbox_int(b) + unbox_int(c) + unbox_int(d) + unbox_int(e))
    }
}

extern "C" fn varargs_len_entry(
    _f: *mut PyFunction,
    _a: *mut PyObject,
    varargs: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    // signature: f(a, *args) -> len(args)
    let n = objects::py_elements(varargs).map(|v| v.len()).unwrap_or(0);
    box_int(n as i64)
}

#[test]
fn method_call_binds_receiver() {
    let cls = create_user_class("MethodBind", &[]);
    let m = new_function("add_one", add_one_entry, 2, false, false, &["self", "a"], &[]);
    attr::class_set_attr(cls, intern_string("add_one"), m);
    unsafe { objects::decref(m) };

    let obj = new_instance(cls);
    let arg = box_int(41);
    let flags = call::callattr_flags(false, false, ArgPassSpec::positional(1));
    let r = call::callattr(
        obj,
        intern_string("add_one"),
        flags,
        arg,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
    .unwrap();
    assert_eq!(unbox_int(r), 42);
    unsafe {
        objects::decref(r);
        objects::decref(arg);
        drop_obj(obj);
    }
}

#[test]
fn call_with_defaults_and_overflow_args() {
    let d1 = box_int(10);
    let d2 = box_int(20);
    let f = new_function("sum5", sum5_entry, 5, false, false, &["a", "b", "c", "d", "e"], &[d1, d2]);

    // Three passed, two defaults.
    let a = box_int(1);
    let b = box_int(2);
    let c = box_int(3);
    let r = call::runtime_call(
        f,
        ArgPassSpec::positional(3),
        a,
        b,
        c,
        std::ptr::null_mut(),
        None,
    )
    .unwrap();
    assert_eq!(unbox_int(r), 1 + 2 + 3 + 10 + 20);
    unsafe {
        objects::decref(r);
        objects::decref(a);
        objects::decref(b);
        objects::decref(c);
        objects::decref(d1);
        objects::decref(d2);
        objects::decref(f);
    }
}

#[test]
fn call_missing_required_argument_is_type_error() {
    let f = new_function("sum3", sum3_entry, 3, false, false, &["a", "b", "c"], &[]);
    let a = box_int(1);
    let err = call::runtime_call(
        f,
        ArgPassSpec::positional(1),
        a,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
    .unwrap_err();
    assert_eq!(err.exc_type, builtins().type_error);
    assert!(err.message.contains("sum3"));
    unsafe {
        objects::decref(a);
        objects::decref(f);
    }
}

#[test]
fn call_with_too_many_arguments_is_type_error() {
    let f = new_function("sum3", sum3_entry, 3, false, false, &["a", "b", "c"], &[]);
    let args: Vec<_> = (0..4).map(box_int).collect();
    let mut rest = [args[3]];
    let err = call::runtime_call(
        f,
        ArgPassSpec::positional(4),
        args[0],
        args[1],
        args[2],
        rest.as_mut_ptr(),
        None,
    )
    .unwrap_err();
    assert_eq!(err.exc_type, builtins().type_error);
    assert!(err.message.contains("takes at most 3 arguments"));
    unsafe {
        for a in args {
            objects::decref(a);
        }
        objects::decref(f);
    }
}

#[test]
fn keywords_fill_positional_slots() {
    let f = new_function("sum3", sum3_entry, 3, false, false, &["a", "b", "c"], &[]);
    let a = box_int(100);
    let c_val = box_int(3);
    let b_val = box_int(20);
    // sum3(100, c=3, b=20)
    let kw = vec![intern_string("c"), intern_string("b")];
    let r = call::runtime_call(
        f,
        ArgPassSpec::new(1, 2, false, false),
        a,
        c_val,
        b_val,
        std::ptr::null_mut(),
        Some(&kw),
    )
    .unwrap();
    assert_eq!(unbox_int(r), 123);
    unsafe {
        objects::decref(r);
        objects::decref(a);
        objects::decref(b_val);
        objects::decref(c_val);
        objects::decref(f);
    }
}

#[test]
fn duplicate_keyword_is_type_error() {
    let f = new_function("sum3", sum3_entry, 3, false, false, &["a", "b", "c"], &[]);
    let a = box_int(1);
    let a_kw = box_int(2);
    let kw = vec![intern_string("a")];
    let err = call::runtime_call(
        f,
        ArgPassSpec::new(1, 1, false, false),
        a,
        a_kw,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        Some(&kw),
    )
    .unwrap_err();
    assert!(err.message.contains("multiple values"));
    unsafe {
        objects::decref(a);
        objects::decref(a_kw);
        objects::decref(f);
    }
}

#[test]
fn starargs_expand_into_positionals() {
    let f = new_function("sum3", sum3_entry, 3, false, false, &["a", "b", "c"], &[]);
    let a = box_int(1);
    let t = new_tuple(&[box_int(2), box_int(3)]);
    // Drop the extra refs the tuple constructor left with us.
    unsafe {
        let elts = objects::py_elements(t).unwrap();
        for e in elts {
            objects::decref(e);
        }
    }
    let r = call::runtime_call(
        f,
        ArgPassSpec::new(1, 0, true, false),
        a,
        t,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
    .unwrap();
    assert_eq!(unbox_int(r), 6);
    unsafe {
        objects::decref(r);
        objects::decref(a);
        objects::decref(t);
        objects::decref(f);
    }
}

#[test]
fn extra_positionals_go_to_varargs() {
    let f = new_function("vl", varargs_len_entry, 1, true, false, &["a"], &[]);
    let args: Vec<_> = (0..3).map(box_int).collect();
    let r = call::runtime_call(
        f,
        ArgPassSpec::positional(3),
        args[0],
        args[1],
        args[2],
        std::ptr::null_mut(),
        None,
    )
    .unwrap();
    assert_eq!(unbox_int(r), 2);
    unsafe {
        objects::decref(r);
        for a in args {
            objects::decref(a);
        }
        objects::decref(f);
    }
}

#[test]
fn non_callable_is_type_error() {
    let x = box_int(5);
    let err = call::runtime_call(
        x,
        ArgPassSpec::positional(0),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        None,
    )
    .unwrap_err();
    assert!(err.message.contains("not callable"));
    unsafe { objects::decref(x) };
}

// ---- descriptors ----

extern "C" fn prop_get_entry(
    _f: *mut PyFunction,
    _obj: *mut PyObject,
    _a2: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(123)
}

#[test]
fn property_intercepts_instance_storage() {
    let cls = create_user_class("WithProp", &[]);
    let getter = new_function("getter", prop_get_entry, 1, false, false, &["self"], &[]);
    let prop = new_property(getter, std::ptr::null_mut());
    attr::class_set_attr(cls, intern_string("p"), prop);
    unsafe {
        objects::decref(getter);
        objects::decref(prop);
    }

    let obj = new_instance(cls);
    let v = attr::getattr_str(obj, "p").unwrap();
    assert_eq!(unbox_int(v), 123);
    unsafe {
        objects::decref(v);
        drop_obj(obj);
    }
}

#[test]
fn plain_class_attribute_is_shared() {
    let cls = create_user_class("ClassAttr", &[]);
    attr::class_set_attr(cls, intern_string("tag"), box_str("shared"));

    let o1 = new_instance(cls);
    let o2 = new_instance(cls);
    let v1 = attr::getattr_str(o1, "tag").unwrap();
    let v2 = attr::getattr_str(o2, "tag").unwrap();
    assert_eq!(v1, v2);
    unsafe {
        objects::decref(v1);
        objects::decref(v2);
        drop_obj(o1);
        drop_obj(o2);
    }
}

#[test]
fn instance_attribute_shadows_nondata_class_attribute() {
    let cls = create_user_class("Shadow", &[]);
    attr::class_set_attr(cls, intern_string("v"), box_str("class"));
    let obj = new_instance(cls);
    attr::setattr_str(obj, "v", box_str("instance")).unwrap();
    let v = attr::getattr_str(obj, "v").unwrap();
    assert_eq!(objects::str_value(v), "instance");
    unsafe {
        objects::decref(v);
        drop_obj(obj);
    }
}

// ---- binop ----

extern "C" fn notimpl_entry(
    _f: *mut PyFunction,
    _a: *mut PyObject,
    _b: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    let ni = not_implemented();
    unsafe { objects::incref(ni) };
    ni
}

extern "C" fn radd_42_entry(
    _f: *mut PyFunction,
    _a: *mut PyObject,
    _b: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(42)
}

#[test]
fn binop_falls_through_notimplemented_to_reflected() {
    let a_cls = create_user_class("BinopA", &[]);
    let b_cls = create_user_class("BinopB", &[]);
    let add = new_function("__add__", notimpl_entry, 2, false, false, &["self", "other"], &[]);
    let radd = new_function("__radd__", radd_42_entry, 2, false, false, &["self", "other"], &[]);
    attr::class_set_attr(a_cls, intern_string("__add__"), add);
    attr::class_set_attr(b_cls, intern_string("__radd__"), radd);
    unsafe {
        objects::decref(add);
        objects::decref(radd);
    }

    let a = new_instance(a_cls);
    let b = new_instance(b_cls);
    let r = binop::binop(a, b, binop::OP_ADD).unwrap();
    assert_eq!(unbox_int(r), 42);
    unsafe {
        objects::decref(r);
        drop_obj(a);
        drop_obj(b);
    }
}

#[test]
fn builtin_int_binops() {
    let a = box_int(30);
    let b = box_int(12);
    let sum = binop::binop(a, b, binop::OP_ADD).unwrap();
    let diff = binop::binop(a, b, binop::OP_SUB).unwrap();
    let prod = binop::binop(a, b, binop::OP_MUL).unwrap();
    assert_eq!(unbox_int(sum), 42);
    assert_eq!(unbox_int(diff), 18);
    assert_eq!(unbox_int(prod), 360);
    unsafe {
        objects::decref(sum);
        objects::decref(diff);
        objects::decref(prod);
        objects::decref(a);
        objects::decref(b);
    }
}

#[test]
fn unsupported_binop_is_type_error() {
    let a = obj_of("NoOps1");
    let b = obj_of("NoOps2");
    let err = binop::binop(a, b, binop::OP_ADD).unwrap_err();
    assert_eq!(err.exc_type, builtins().type_error);
    assert!(err.message.contains("unsupported operand type(s) for +"));
    unsafe {
        drop_obj(a);
        drop_obj(b);
    }
}

#[test]
fn augbinop_prefers_inplace_method() {
    let cls = create_user_class("Aug", &[]);
    let iadd = new_function("__iadd__", radd_42_entry, 2, false, false, &["self", "other"], &[]);
    attr::class_set_attr(cls, intern_string("__iadd__"), iadd);
    unsafe { objects::decref(iadd) };

    let a = new_instance(cls);
    let b = box_int(1);
    let r = binop::augbinop(a, b, binop::OP_ADD).unwrap();
    assert_eq!(unbox_int(r), 42);
    unsafe {
        objects::decref(r);
        objects::decref(b);
        drop_obj(a);
    }
}

// ---- compare ----

#[test]
fn identity_comparisons() {
    let a = box_int(5);
    let b = box_int(5);
    let same = compare::compare(a, a, compare::CMP_IS).unwrap();
    let diff = compare::compare(a, b, compare::CMP_IS).unwrap();
    let not_same = compare::compare(a, b, compare::CMP_IS_NOT).unwrap();
    assert!(unbox_bool(same));
    assert!(!unbox_bool(diff));
    assert!(unbox_bool(not_same));
    unsafe {
        objects::decref(same);
        objects::decref(diff);
        objects::decref(not_same);
        objects::decref(a);
        objects::decref(b);
    }
}

#[test]
fn containment_uses_sq_contains() {
    let one = box_int(1);
    let two = box_int(2);
    let l = new_list(&[one]);
    let in_l = compare::compare(one, l, compare::CMP_IN).unwrap();
    let not_in_l = compare::compare(two, l, compare::CMP_NOT_IN).unwrap();
    assert!(unbox_bool(in_l));
    assert!(unbox_bool(not_in_l));
    unsafe {
        objects::decref(in_l);
        objects::decref(not_in_l);
        objects::decref(l);
        objects::decref(one);
        objects::decref(two);
    }
}

#[test]
fn rich_compare_builtins() {
    let a = box_int(3);
    let b = box_int(7);
    let lt = compare::compare(a, b, compare::CMP_LT).unwrap();
    let ge = compare::compare(a, b, compare::CMP_GT_E).unwrap();
    assert!(unbox_bool(lt));
    assert!(!unbox_bool(ge));

    let s1 = box_str("abc");
    let s2 = box_str("abd");
    let slt = compare::compare(s1, s2, compare::CMP_LT).unwrap();
    assert!(unbox_bool(slt));
    unsafe {
        objects::decref(lt);
        objects::decref(ge);
        objects::decref(slt);
        objects::decref(a);
        objects::decref(b);
    }
}

#[test]
fn default_compare_is_identity_for_eq() {
    let a = obj_of("DefaultEq1");
    let b = obj_of("DefaultEq2");
    let eq = compare::compare(a, b, compare::CMP_EQ).unwrap();
    let ne = compare::compare(a, b, compare::CMP_NOT_EQ).unwrap();
    assert!(!unbox_bool(eq));
    assert!(unbox_bool(ne));
    unsafe {
        objects::decref(eq);
        objects::decref(ne);
        drop_obj(a);
        drop_obj(b);
    }
}

// ---- subscript ----

#[test]
fn dict_subscript_round_trip() {
    let d = objects::create_dict();
    let k = box_str("k");
    let v = box_int(9);
    item::setitem(d, k, v).unwrap();
    let got = item::getitem(d, k).unwrap();
    assert_eq!(got, v);
    item::delitem(d, k).unwrap();
    let err = item::getitem(d, k).unwrap_err();
    assert_eq!(err.exc_type, builtins().key_error);
    unsafe {
        objects::decref(got);
        objects::decref(v);
        objects::decref(d);
    }
}

#[test]
fn list_indexing_and_bounds() {
    let elts: Vec<_> = (10..13).map(box_int).collect();
    let l = new_list(&elts);
    let idx = box_int(1);
    let got = item::getitem(l, idx).unwrap();
    assert_eq!(unbox_int(got), 11);

    let neg = box_int(-1);
    let last = item::getitem(l, neg).unwrap();
    assert_eq!(unbox_int(last), 12);

    let oob = box_int(3);
    let err = item::getitem(l, oob).unwrap_err();
    assert_eq!(err.exc_type, builtins().index_error);
    unsafe {
        objects::decref(got);
        objects::decref(last);
        objects::decref(idx);
        objects::decref(neg);
        objects::decref(oob);
        for e in elts {
            objects::decref(e);
        }
        objects::decref(l);
    }
}

extern "C" fn getslice_entry(
    _f: *mut PyFunction,
    _self_obj: *mut PyObject,
    start: *mut PyObject,
    stop: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(unbox_int(start) * 1000 + unbox_int(stop))
}

#[test]
fn stepless_slice_routes_to_getslice() {
    let cls = create_user_class("Sliceable", &[]);
    let f = new_function(
        "__getslice__",
        getslice_entry,
        3,
        false,
        false,
        &["self", "i", "j"],
        &[],
    );
    attr::class_set_attr(cls, intern_string("__getslice__"), f);
    unsafe { objects::decref(f) };

    let obj = new_instance(cls);
    let start = box_int(2);
    let stop = box_int(5);
    let none = objects::none_object();
    let slice = new_slice(start, stop, none);
    let r = item::getitem(obj, slice).unwrap();
    assert_eq!(unbox_int(r), 2005);
    unsafe {
        objects::decref(r);
        objects::decref(slice);
        objects::decref(start);
        objects::decref(stop);
        drop_obj(obj);
    }
}

// ---- len / nonzero ----

#[test]
fn len_of_builtins() {
    let elts: Vec<_> = (0..3).map(box_int).collect();
    let l = new_list(&elts);
    assert_eq!(len::unboxed_len(l).unwrap(), 3);

    let s = box_str("hello");
    assert_eq!(len::unboxed_len(s).unwrap(), 5);

    let boxed = len::len(l).unwrap();
    assert_eq!(unbox_int(boxed), 3);
    unsafe {
        objects::decref(boxed);
        for e in elts {
            objects::decref(e);
        }
        objects::decref(l);
    }
}

extern "C" fn len_entry_7(
    _f: *mut PyFunction,
    _s: *mut PyObject,
    _a2: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(7)
}

extern "C" fn len_entry_negative(
    _f: *mut PyFunction,
    _s: *mut PyObject,
    _a2: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(-2)
}

#[test]
fn user_len_is_used_and_validated() {
    let cls = create_user_class("HasLen", &[]);
    let f = new_function("__len__", len_entry_7, 1, false, false, &["self"], &[]);
    attr::class_set_attr(cls, intern_string("__len__"), f);
    unsafe { objects::decref(f) };
    let obj = new_instance(cls);
    assert_eq!(len::unboxed_len(obj).unwrap(), 7);
    unsafe { drop_obj(obj) };

    let bad_cls = create_user_class("NegLen", &[]);
    let f = new_function("__len__", len_entry_negative, 1, false, false, &["self"], &[]);
    attr::class_set_attr(bad_cls, intern_string("__len__"), f);
    unsafe { objects::decref(f) };
    let obj = new_instance(bad_cls);
    let err = len::unboxed_len(obj).unwrap_err();
    assert_eq!(err.exc_type, builtins().value_error);
    unsafe { drop_obj(obj) };
}

#[test]
fn len_of_lenless_object_is_type_error() {
    let obj = obj_of("NoLen");
    let err = len::len(obj).unwrap_err();
    assert_eq!(err.exc_type, builtins().type_error);
    assert!(err.message.contains("has no len()"));
    unsafe { drop_obj(obj) };
}

#[test]
fn truthiness_of_builtins() {
    let t = box_bool(true);
    let f = box_bool(false);
    let zero = box_int(0);
    let one = box_int(1);
    let empty = new_list(&[]);
    let none = objects::none_object();
    let s = box_str("x");

    assert!(len::nonzero(t).unwrap());
    assert!(!len::nonzero(f).unwrap());
    assert!(!len::nonzero(zero).unwrap());
    assert!(len::nonzero(one).unwrap());
    assert!(!len::nonzero(empty).unwrap());
    assert!(!len::nonzero(none).unwrap());
    assert!(len::nonzero(s).unwrap());

    // Objects with no truth protocol default to true.
    let plain = obj_of("AlwaysTrue");
    assert!(len::nonzero(plain).unwrap());
    unsafe {
        objects::decref(t);
        objects::decref(f);
        objects::decref(zero);
        objects::decref(one);
        objects::decref(empty);
        drop_obj(plain);
    }
}

#[test]
fn no_stray_pending_exceptions() {
    // Each Result-flavored call either returns the error or leaves the
    // pending slot clean.
    let obj = obj_of("CleanPending");
    let _ = attr::getattr_str(obj, "gone");
    assert!(take_pending_exc().is_none());
    unsafe { drop_obj(obj) };
}
