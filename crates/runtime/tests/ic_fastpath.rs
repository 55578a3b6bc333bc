//! End-to-end inline-cache behavior: real trampolines, real patched
//! machine code. Gated on x86-64 since the tests execute emitted code.
//!
//! The tests in this file share process-wide statistics, so they
//! serialize on one lock and measure counter deltas inside it.
#![cfg(target_arch = "x86_64")]

use std::sync::Mutex;

use quickening::dispatch::attr;
use quickening::dispatch::binop::OP_ADD;
use quickening::ics::runtime_ics::{BinopIC, GetattrIC, LenIC, NonzeroIC, SetattrIC};
use quickening::objects::{
    self, box_int, box_str, create_user_class, intern_string, new_function, new_getset_descr,
    new_instance, new_list, refcnt, unbox_int, PyFunction, PyObject,
};
use quickening::stats;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn times_rewritten(ic: &quickening::ics::RuntimeIC) -> u32 {
    unsafe { (*ic.ic_handle().unwrap().get()).times_rewritten() }
}

fn all_slots_unused(ic: &quickening::ics::RuntimeIC) -> bool {
    unsafe {
        let info = &mut *ic.ic_handle().unwrap().get();
        (0..info.num_slots()).all(|i| !(*info.slot(i)).used)
    }
}

unsafe fn drop_obj(o: *mut PyObject) {
    objects::decref(o);
}

// Scenario A: a monomorphic attribute load is rewritten once and then
// served by the fast path.
#[test]
fn monomorphic_attribute_load_patches_once() {
    let _guard = lock();

    let ic = GetattrIC::new().unwrap();
    let cls = create_user_class("MonoA", &[]);
    let obj = new_instance(cls);
    attr::setattr_str(obj, "x", box_int(7)).unwrap();
    let x = intern_string("x");

    let slow_before = stats::counter("slowpath_getattr");
    for _ in 0..5 {
        let v = ic.call(obj, x);
        assert!(!v.is_null());
        assert_eq!(unbox_int(v), 7);
        unsafe { objects::decref(v) };
    }
    let slow_after = stats::counter("slowpath_getattr");

    assert_eq!(slow_after - slow_before, 1, "only the first call may be slow");
    assert_eq!(times_rewritten(ic.ic()), 1);
    unsafe { drop_obj(obj) };
}

// Scenario B: a shape transition falls back to the slow path and
// re-specializes without breaking anything.
#[test]
fn shape_transition_respecializes() {
    let _guard = lock();

    let ic = GetattrIC::new().unwrap();
    let cls = create_user_class("TransB", &[]);
    let obj = new_instance(cls);
    attr::setattr_str(obj, "x", box_int(7)).unwrap();
    let x = intern_string("x");

    let v = ic.call(obj, x);
    assert_eq!(unbox_int(v), 7);
    unsafe { objects::decref(v) };
    assert_eq!(times_rewritten(ic.ic()), 1);

    // Grow the object: its hidden class changes, the old guard fails.
    attr::setattr_str(obj, "y", box_int(8)).unwrap();

    let v = ic.call(obj, x);
    assert_eq!(unbox_int(v), 7);
    unsafe { objects::decref(v) };
    assert_eq!(times_rewritten(ic.ic()), 2);

    // And the new fast path holds.
    let slow_before = stats::counter("slowpath_getattr");
    for _ in 0..3 {
        let v = ic.call(obj, x);
        assert_eq!(unbox_int(v), 7);
        unsafe { objects::decref(v) };
    }
    assert_eq!(stats::counter("slowpath_getattr"), slow_before);
    unsafe { drop_obj(obj) };
}

// Scenario C: after enough distinct shapes the IC goes megamorphic and
// stops rewriting.
#[test]
fn megamorphic_site_stops_rewriting() {
    let _guard = lock();

    let ic = GetattrIC::new().unwrap();
    let f = intern_string("f");

    let mut objs = Vec::new();
    for i in 0..101 {
        let cls = create_user_class(&format!("Mega{}", i), &[]);
        let obj = new_instance(cls);
        attr::setattr_str(obj, "f", box_int(i as i64)).unwrap();
        objs.push(obj);
    }

    for (i, &obj) in objs.iter().enumerate() {
        let v = ic.call(obj, f);
        assert!(!v.is_null());
        assert_eq!(unbox_int(v), i as i64, "megamorphic call {} wrong", i);
        unsafe { objects::decref(v) };
    }

    unsafe {
        let info = &mut *ic.ic().ic_handle().unwrap().get();
        assert!(info.is_megamorphic());
        assert_eq!(info.times_rewritten(), 100);
        assert!(!info.should_attempt());
    }

    for obj in objs {
        unsafe { drop_obj(obj) };
    }
}

// Scenario D: replacing a method on a base class clears the slots that
// embedded the old lookup before the next call runs.
#[test]
fn class_modification_invalidates_committed_slots() {
    let _guard = lock();

    let base = create_user_class("InvalBase", &[]);
    let sub = create_user_class("InvalSub", &[base]);
    attr::class_set_attr(base, intern_string("m"), box_str("v1"));

    let ic = GetattrIC::new().unwrap();
    let m = intern_string("m");
    let obj = new_instance(sub);

    for _ in 0..3 {
        let v = ic.call(obj, m);
        assert_eq!(objects::str_value(v), "v1");
        unsafe { objects::decref(v) };
    }
    assert_eq!(times_rewritten(ic.ic()), 1);
    assert!(!all_slots_unused(ic.ic()));

    // Replace the method: the dependent slot must be cleared eagerly.
    attr::class_set_attr(base, intern_string("m"), box_str("v2"));
    assert!(all_slots_unused(ic.ic()));

    let v = ic.call(obj, m);
    assert_eq!(objects::str_value(v), "v2");
    unsafe { objects::decref(v) };
    unsafe { drop_obj(obj) };
}

// Binop fast path: builtin int addition patches once.
#[test]
fn binop_int_add_patches_once() {
    let _guard = lock();

    let ic = BinopIC::new().unwrap();
    let a = box_int(30);
    let b = box_int(12);

    let slow_before = stats::counter("slowpath_binop");
    for _ in 0..5 {
        let r = ic.call(a, b, OP_ADD);
        assert!(!r.is_null());
        assert_eq!(unbox_int(r), 42);
        unsafe { objects::decref(r) };
    }
    assert_eq!(stats::counter("slowpath_binop") - slow_before, 1);
    unsafe {
        objects::decref(a);
        objects::decref(b);
    }
}

// Nonzero fast paths for bool and int.
#[test]
fn nonzero_specializes_per_class() {
    let _guard = lock();

    let ic = NonzeroIC::new().unwrap();
    let t = objects::box_bool(true);
    let zero = box_int(0);

    let slow_before = stats::counter("slowpath_nonzero");
    for _ in 0..4 {
        assert_eq!(ic.call(t), 1);
    }
    // bool was patched; int is a second shape in a second slot.
    for _ in 0..4 {
        assert_eq!(ic.call(zero), 0);
    }
    let delta = stats::counter("slowpath_nonzero") - slow_before;
    assert_eq!(delta, 2, "one slow call per distinct class");

    unsafe {
        objects::decref(t);
        objects::decref(zero);
    }
}

#[test]
fn len_of_list_patches() {
    let _guard = lock();

    let ic = LenIC::new().unwrap();
    let elts: Vec<_> = (0..3).map(box_int).collect();
    let l = new_list(&elts);

    let slow_before = stats::counter("slowpath_len");
    for _ in 0..4 {
        let v = ic.call(l);
        assert!(!v.is_null());
        assert_eq!(unbox_int(v), 3);
        unsafe { objects::decref(v) };
    }
    assert_eq!(stats::counter("slowpath_len") - slow_before, 1);

    unsafe {
        for e in elts {
            objects::decref(e);
        }
        objects::decref(l);
    }
}

// Property 5: the net refcount effect of the fast path equals the slow
// path's.
#[test]
fn fast_path_preserves_refcounts() {
    let _guard = lock();

    let ic = GetattrIC::new().unwrap();
    let cls = create_user_class("RefNet", &[]);
    let obj = new_instance(cls);
    let val = box_int(5);
    attr::setattr_str(obj, "v", val).unwrap();
    let v_name = intern_string("v");

    let base = refcnt(val);
    for _ in 0..6 {
        let v = ic.call(obj, v_name);
        assert_eq!(v, val);
        // One reference was handed to us; give it back.
        assert_eq!(refcnt(val), base + 1);
        unsafe { objects::decref(v) };
        assert_eq!(refcnt(val), base);
    }
    unsafe {
        drop_obj(obj);
        objects::decref(val);
    }
}

// Setattr fast path: repeated stores to an existing slot keep the
// refcounts of old and new values straight.
#[test]
fn setattr_fast_path_swaps_references() {
    let _guard = lock();

    let ic = SetattrIC::new().unwrap();
    let cls = create_user_class("SetFast", &[]);
    let obj = new_instance(cls);
    attr::setattr_str(obj, "v", box_int(0)).unwrap();
    let v_name = intern_string("v");

    let vals: Vec<_> = (0..5).map(|i| box_int(100 + i)).collect();
    let slow_before = stats::counter("slowpath_setattr");
    for &v in &vals {
        // The entry steals one reference.
        unsafe { objects::incref(v) };
        let status = ic.call(obj, v_name, v);
        assert_eq!(status, 0);
    }
    assert_eq!(stats::counter("slowpath_setattr") - slow_before, 1);

    // Only the last stored value still carries the stored reference.
    for (i, &v) in vals.iter().enumerate() {
        let expected = if i == vals.len() - 1 { 2 } else { 1 };
        assert_eq!(refcnt(v), expected, "value {}", i);
    }
    let got = attr::getattr_str(obj, "v").unwrap();
    assert_eq!(unbox_int(got), 104);
    unsafe {
        objects::decref(got);
        drop_obj(obj);
        for v in vals {
            objects::decref(v);
        }
    }
}

// Scenario F: invalidating a class while a frame is executing inside one
// of its slots defers the release of embedded references until the frame
// leaves, and releases them exactly once.
static INVALIDATE_ON_GET: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn volatile_get(obj: *mut PyObject) -> *mut PyObject {
    if INVALIDATE_ON_GET.load(std::sync::atomic::Ordering::Relaxed) {
        unsafe { quickening::objects::typecache::type_modified((*obj).cls) };
    }
    box_int(9)
}

#[test]
fn invalidation_inside_slot_defers_reference_release() {
    let _guard = lock();
    INVALIDATE_ON_GET.store(false, std::sync::atomic::Ordering::Relaxed);

    let cls = create_user_class("DeepInval", &[]);
    let descr = new_getset_descr("g", volatile_get, None);
    attr::class_set_attr(cls, intern_string("g"), descr);
    // Our handle plus the class's.
    assert_eq!(refcnt(descr), 2);

    let ic = GetattrIC::new().unwrap();
    let g = intern_string("g");
    let obj = new_instance(cls);

    // First call: slow path, commits a fast path embedding the
    // descriptor (the slot now holds a reference).
    let v = ic.call(obj, g);
    assert_eq!(unbox_int(v), 9);
    unsafe { objects::decref(v) };
    assert_eq!(times_rewritten(ic.ic()), 1);
    assert_eq!(refcnt(descr), 3);

    // Second call runs the fast path; mid-call the getter invalidates
    // the class, clearing the slot under our feet. The frame completes,
    // and the embedded reference is retained for now.
    INVALIDATE_ON_GET.store(true, std::sync::atomic::Ordering::Relaxed);
    let v = ic.call(obj, g);
    assert_eq!(unbox_int(v), 9);
    unsafe { objects::decref(v) };
    INVALIDATE_ON_GET.store(false, std::sync::atomic::Ordering::Relaxed);

    assert!(all_slots_unused(ic.ic()));
    assert_eq!(refcnt(descr), 3, "release is deferred while a frame was inside");

    // Tearing down the IC releases the deferred reference exactly once.
    drop(ic);
    assert_eq!(refcnt(descr), 2);

    unsafe {
        drop_obj(obj);
        objects::decref(descr);
    }
}

// Method calls through the generic machinery get patched down to a
// guarded direct call.
extern "C" fn double_entry(
    _f: *mut PyFunction,
    _self_obj: *mut PyObject,
    a: *mut PyObject,
    _a3: *mut PyObject,
    _rest: *mut *mut PyObject,
) -> *mut PyObject {
    box_int(unbox_int(a) * 2)
}

#[test]
fn method_call_fast_path() {
    let _guard = lock();

    let cls = create_user_class("CallFast", &[]);
    let f = new_function("double", double_entry, 2, false, false, &["self", "a"], &[]);
    attr::class_set_attr(cls, intern_string("double"), f);
    unsafe { objects::decref(f) };

    let ic = quickening::ics::runtime_ics::CallattrIC::new().unwrap();
    let obj = new_instance(cls);
    let name = intern_string("double");
    let flags = quickening::dispatch::call::callattr_flags(
        false,
        false,
        quickening::dispatch::args::ArgPassSpec::positional(1),
    );

    let slow_before = stats::counter("slowpath_callattr");
    for i in 0..5 {
        let arg = box_int(i);
        let r = ic.call(
            obj,
            name,
            flags,
            arg,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null(),
        );
        assert!(!r.is_null());
        assert_eq!(unbox_int(r), 2 * i);
        unsafe {
            objects::decref(r);
            objects::decref(arg);
        }
    }
    assert_eq!(stats::counter("slowpath_callattr") - slow_before, 1);
    unsafe { drop_obj(obj) };
}

#[test]
fn cleared_ic_registry_lookup_roundtrip() {
    let _guard = lock();

    // The registry maps the slow-path return address to the IC.
    let ic = GetattrIC::new().unwrap();
    let info = ic.ic().ic_handle().unwrap().get();
    let rtn_addr = unsafe { (*info).slowpath_rtn_addr };
    assert_eq!(quickening::ics::get_ic_info(rtn_addr), Some(info));
    drop(ic);
    assert_eq!(quickening::ics::get_ic_info(rtn_addr), None);
}

#[test]
fn backoff_after_aborts() {
    let _guard = lock();

    // Keyword calls abort their rewrites, driving the back-off up; the
    // IC keeps answering correctly the whole time.
    let cls = create_user_class("Backoff", &[]);
    let f = new_function("double", double_entry, 2, false, false, &["self", "a"], &[]);
    attr::class_set_attr(cls, intern_string("double"), f);
    unsafe { objects::decref(f) };

    let ic = quickening::ics::runtime_ics::CallattrIC::new().unwrap();
    let obj = new_instance(cls);
    let name = intern_string("double");
    let kw = vec![intern_string("a")];
    let flags = quickening::dispatch::call::callattr_flags(
        false,
        false,
        quickening::dispatch::args::ArgPassSpec::new(0, 1, false, false),
    );

    for i in 0..6 {
        let arg = box_int(i);
        let r = ic.call(
            obj,
            name,
            flags,
            arg,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &kw as *const _,
        );
        assert!(!r.is_null());
        assert_eq!(unbox_int(r), 2 * i);
        unsafe {
            objects::decref(r);
            objects::decref(arg);
        }
    }
    // Never committed, still answering.
    assert_eq!(times_rewritten(ic.ic()), 0);
    unsafe { drop_obj(obj) };
}
