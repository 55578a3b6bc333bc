//! Minimal object model: the layout and class contracts the dispatch slow
//! paths and emitted fast paths rely on.
//!
//! Everything that machine code touches is `#[repr(C)]` so attribute
//! guards can embed fixed byte offsets. Objects are manually
//! reference-counted raw pointers; classes, interned strings and hidden
//! classes are immortal (there is no GC in this subsystem, so anything
//! whose address gets baked into code untracked must never die).
//!
//! # Thread model
//! Object-graph mutation assumes the runtime's single execution thread.
//! Only the process-wide tables (interning, method cache, IC registries)
//! take locks, so independent object graphs on different threads (as in
//! the test suite) stay safe.

pub mod hiddenclass;
mod methods;
pub mod typecache;

use std::collections::BTreeMap;
use std::ffi::c_char;
use std::mem::offset_of;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::error::{set_pending_exc, ExcInfo};
use crate::ics::invalidator::ICInvalidator;
use hiddenclass::HCAttrs;

// ---- Core layout ----

#[repr(C)]
pub struct PyObject {
    pub ob_refcnt: i64,
    pub cls: *mut PyClass,
}

/// Field offsets the rewriter bakes into guards and loads.
pub const REFCNT_OFFSET: i32 = offset_of!(PyObject, ob_refcnt) as i32;
pub const CLS_OFFSET: i32 = offset_of!(PyObject, cls) as i32;

const IMMORTAL_REFCNT: i64 = 1 << 60;

pub type GetAttroFunc = extern "C" fn(*mut PyObject, *mut PyStr) -> *mut PyObject;
pub type SetAttrFunc = extern "C" fn(*mut PyObject, *const c_char, *mut PyObject) -> i32;
pub type SetAttroFunc = extern "C" fn(*mut PyObject, *mut PyStr, *mut PyObject) -> i32;
pub type DescrGetFunc = extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject;
pub type DescrSetFunc = extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> i32;
pub type RichCmpFunc = extern "C" fn(*mut PyObject, *mut PyObject, i32) -> *mut PyObject;
pub type LenFunc = extern "C" fn(*mut PyObject) -> i64;
pub type SsizeArgFunc = extern "C" fn(*mut PyObject, i64) -> *mut PyObject;
pub type ObjObjProc = extern "C" fn(*mut PyObject, *mut PyObject) -> i32;
pub type BinaryFunc = extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject;
pub type ObjObjArgProc = extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> i32;
pub type DeallocFunc = extern "C" fn(*mut PyObject);

#[repr(C)]
pub struct PySequenceMethods {
    pub sq_length: Option<LenFunc>,
    pub sq_item: Option<SsizeArgFunc>,
    pub sq_contains: Option<ObjObjProc>,
}

pub const SQ_LENGTH_OFFSET: i32 = offset_of!(PySequenceMethods, sq_length) as i32;
pub const SQ_CONTAINS_OFFSET: i32 = offset_of!(PySequenceMethods, sq_contains) as i32;

#[repr(C)]
pub struct PyMappingMethods {
    pub mp_subscript: Option<BinaryFunc>,
    pub mp_ass_subscript: Option<ObjObjArgProc>,
}

pub const MP_SUBSCRIPT_OFFSET: i32 = offset_of!(PyMappingMethods, mp_subscript) as i32;
pub const MP_ASS_SUBSCRIPT_OFFSET: i32 = offset_of!(PyMappingMethods, mp_ass_subscript) as i32;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u64 {
        const HAVE_VERSION_TAG  = 1 << 18;
        const VALID_VERSION_TAG = 1 << 19;
        const HAVE_SEQUENCE_IN  = 1 << 20;
    }
}

#[repr(C)]
pub struct PyClass {
    pub base: PyObject,
    pub tp_flags: TypeFlags,
    pub tp_version_tag: u64,
    /// Linearized MRO (self first), stored as a tuple so its identity can
    /// be guarded.
    pub tp_mro: *mut PyTuple,
    pub tp_getattro: Option<GetAttroFunc>,
    pub tp_setattr: Option<SetAttrFunc>,
    pub tp_setattro: Option<SetAttroFunc>,
    pub tp_descr_get: Option<DescrGetFunc>,
    pub tp_descr_set: Option<DescrSetFunc>,
    pub tp_richcompare: Option<RichCmpFunc>,
    pub tp_as_sequence: *mut PySequenceMethods,
    pub tp_as_mapping: *mut PyMappingMethods,
    pub tp_dealloc: Option<DeallocFunc>,
    /// Byte offset of the `HCAttrs` header in instances, or -1 when
    /// instances carry no hidden-class storage.
    pub attrs_offset: i32,
    pub is_user_defined: bool,
    // Rust-side bookkeeping; never touched by emitted code.
    pub name: String,
    pub attrs: BTreeMap<usize, *mut PyObject>,
    pub bases: Vec<*mut PyClass>,
    pub subclasses: Vec<*mut PyClass>,
    /// Fired when this class's shape changes; getattr rewrites that
    /// embedded lookups through this class depend on it.
    pub dependent_icgetattrs: ICInvalidator,
}

pub const TP_FLAGS_OFFSET: i32 = offset_of!(PyClass, tp_flags) as i32;
pub const TP_VERSION_TAG_OFFSET: i32 = offset_of!(PyClass, tp_version_tag) as i32;
pub const TP_MRO_OFFSET: i32 = offset_of!(PyClass, tp_mro) as i32;
pub const TP_GETATTRO_OFFSET: i32 = offset_of!(PyClass, tp_getattro) as i32;
pub const TP_SETATTR_OFFSET: i32 = offset_of!(PyClass, tp_setattr) as i32;
pub const TP_SETATTRO_OFFSET: i32 = offset_of!(PyClass, tp_setattro) as i32;
pub const TP_DESCR_GET_OFFSET: i32 = offset_of!(PyClass, tp_descr_get) as i32;
pub const TP_RICHCOMPARE_OFFSET: i32 = offset_of!(PyClass, tp_richcompare) as i32;
pub const TP_AS_SEQUENCE_OFFSET: i32 = offset_of!(PyClass, tp_as_sequence) as i32;
pub const TP_AS_MAPPING_OFFSET: i32 = offset_of!(PyClass, tp_as_mapping) as i32;

impl PyClass {
    pub fn instances_have_hcattrs(&self) -> bool {
        self.attrs_offset >= 0
    }

    pub fn has_feature(&self, flag: TypeFlags) -> bool {
        self.tp_flags.contains(flag)
    }

    pub fn mro_slice(&self) -> &[*mut PyObject] {
        unsafe { &(*self.tp_mro).elts }
    }

    /// The class's own attribute (no MRO walk).
    pub fn get_own_attr(&self, attr: *mut PyStr) -> Option<*mut PyObject> {
        self.attrs.get(&(attr as usize)).copied()
    }

    pub fn set_own_attr(&mut self, attr: *mut PyStr, val: *mut PyObject) {
        unsafe { incref(val) };
        if let Some(old) = self.attrs.insert(attr as usize, val) {
            unsafe { decref(old) };
        }
    }

    pub fn del_own_attr(&mut self, attr: *mut PyStr) -> bool {
        match self.attrs.remove(&(attr as usize)) {
            Some(old) => {
                unsafe { decref(old) };
                true
            }
            None => false,
        }
    }
}

// ---- Reference counting ----

/// # Safety
/// `obj` must point at a live object.
pub unsafe fn incref(obj: *mut PyObject) {
    debug_assert!(!obj.is_null());
    (*obj).ob_refcnt += 1;
}

pub unsafe fn xincref(obj: *mut PyObject) {
    if !obj.is_null() {
        incref(obj);
    }
}

/// # Safety
/// `obj` must point at a live object whose count is positive.
pub unsafe fn decref(obj: *mut PyObject) {
    debug_assert!(!obj.is_null());
    debug_assert!((*obj).ob_refcnt > 0);
    (*obj).ob_refcnt -= 1;
    if (*obj).ob_refcnt == 0 {
        dealloc_object(obj);
    }
}

pub unsafe fn xdecref(obj: *mut PyObject) {
    if !obj.is_null() {
        decref(obj);
    }
}

pub fn refcnt(obj: *mut PyObject) -> i64 {
    unsafe { (*obj).ob_refcnt }
}

/// Free an object whose refcount reached zero. Callable from emitted code.
pub extern "C" fn dealloc_object(obj: *mut PyObject) {
    unsafe {
        let cls = (*obj).cls;
        match (*cls).tp_dealloc {
            Some(dealloc) => dealloc(obj),
            None => {
                // Immortals never get here; a missing destructor on a
                // heap object is a refcounting bug.
                unreachable!("no deallocator for instance of {}", (*cls).name);
            }
        }
    }
}

/// RAII decref guard for slow-path temporaries.
pub struct AutoDecref(pub *mut PyObject);

impl Drop for AutoDecref {
    fn drop(&mut self) {
        unsafe { xdecref(self.0) };
    }
}

// ---- Boxed builtins ----

#[repr(C)]
pub struct PyStr {
    pub base: PyObject,
    pub hash: u64,
    pub value: String,
}

impl PyStr {
    pub fn s(&self) -> &str {
        &self.value
    }
}

#[repr(C)]
pub struct PyInt {
    pub base: PyObject,
    pub n: i64,
}

pub const INT_N_OFFSET: i32 = offset_of!(PyInt, n) as i32;

#[repr(C)]
pub struct PyFloat {
    pub base: PyObject,
    pub f: f64,
}

pub const FLOAT_F_OFFSET: i32 = offset_of!(PyFloat, f) as i32;

/// Arbitrary-precision integers are out of scope; `long` carries an i64
/// payload, which is all the dispatch semantics here need.
#[repr(C)]
pub struct PyLong {
    pub base: PyObject,
    pub n: i64,
}

#[repr(C)]
pub struct PyTuple {
    pub base: PyObject,
    pub elts: Vec<*mut PyObject>,
}

#[repr(C)]
pub struct PyList {
    pub base: PyObject,
    pub elts: Vec<*mut PyObject>,
}

#[repr(C)]
pub struct PyDict {
    pub base: PyObject,
    /// Keyed by object identity. String keys are interned, so equal
    /// strings share an address and identity equals equality.
    pub map: BTreeMap<usize, *mut PyObject>,
}

#[repr(C)]
pub struct PySlice {
    pub base: PyObject,
    pub start: *mut PyObject,
    pub stop: *mut PyObject,
    pub step: *mut PyObject,
}

/// Signature of a function's native entry point: the function object plus
/// up to three register arguments and a pointer to the rest. Errors follow
/// the CAPI convention (null + pending exception).
pub type FunctionEntry = extern "C" fn(
    *mut PyFunction,
    *mut PyObject,
    *mut PyObject,
    *mut PyObject,
    *mut *mut PyObject,
) -> *mut PyObject;

#[repr(C)]
pub struct PyFunction {
    pub base: PyObject,
    pub entry: FunctionEntry,
    pub num_args: u32,
    pub takes_varargs: bool,
    pub takes_kwargs: bool,
    pub param_names: Vec<*mut PyStr>,
    pub defaults: Vec<*mut PyObject>,
    pub name: String,
}

pub const FUNCTION_ENTRY_OFFSET: i32 = offset_of!(PyFunction, entry) as i32;

#[repr(C)]
pub struct PyInstanceMethod {
    pub base: PyObject,
    pub func: *mut PyObject,
    pub obj: *mut PyObject,
}

pub const IM_FUNC_OFFSET: i32 = offset_of!(PyInstanceMethod, func) as i32;
pub const IM_OBJ_OFFSET: i32 = offset_of!(PyInstanceMethod, obj) as i32;

#[repr(C)]
pub struct PyProperty {
    pub base: PyObject,
    pub prop_get: *mut PyObject,
    pub prop_set: *mut PyObject,
}

#[repr(C)]
pub struct PyGetSetDescr {
    pub base: PyObject,
    pub get: extern "C" fn(*mut PyObject) -> *mut PyObject,
    pub set: Option<extern "C" fn(*mut PyObject, *mut PyObject) -> i32>,
    pub name: String,
}

/// Member descriptor: a raw pointer-sized field at a fixed offset in the
/// instance, the shape the rewriter can inline as a single load.
#[repr(C)]
pub struct PyMemberDescr {
    pub base: PyObject,
    pub offset: i32,
    pub name: String,
}

/// A generic user-class instance: header plus hidden-class storage.
#[repr(C)]
pub struct PyInstance {
    pub base: PyObject,
    pub attrs: HCAttrs,
}

pub const INSTANCE_ATTRS_OFFSET: i32 = offset_of!(PyInstance, attrs) as i32;

// ---- Allocation helpers ----

fn alloc_object<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

fn header(cls: *mut PyClass) -> PyObject {
    PyObject {
        ob_refcnt: 1,
        cls,
    }
}

unsafe fn drop_as<T>(obj: *mut PyObject) {
    drop(Box::from_raw(obj as *mut T));
}

extern "C" fn str_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyStr>(obj) }
}

extern "C" fn int_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyInt>(obj) }
}

extern "C" fn float_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyFloat>(obj) }
}

extern "C" fn long_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyLong>(obj) }
}

extern "C" fn tuple_dealloc(obj: *mut PyObject) {
    unsafe {
        let t = obj as *mut PyTuple;
        for &e in &(*t).elts {
            xdecref(e);
        }
        drop_as::<PyTuple>(obj);
    }
}

extern "C" fn list_dealloc(obj: *mut PyObject) {
    unsafe {
        let l = obj as *mut PyList;
        for &e in &(*l).elts {
            xdecref(e);
        }
        drop_as::<PyList>(obj);
    }
}

extern "C" fn dict_dealloc(obj: *mut PyObject) {
    unsafe {
        let d = obj as *mut PyDict;
        for (&k, &v) in (*d).map.iter() {
            decref(k as *mut PyObject);
            decref(v);
        }
        drop_as::<PyDict>(obj);
    }
}

extern "C" fn slice_dealloc(obj: *mut PyObject) {
    unsafe {
        let s = obj as *mut PySlice;
        xdecref((*s).start);
        xdecref((*s).stop);
        xdecref((*s).step);
        drop_as::<PySlice>(obj);
    }
}

extern "C" fn function_dealloc(obj: *mut PyObject) {
    unsafe {
        let f = obj as *mut PyFunction;
        for &d in &(*f).defaults {
            decref(d);
        }
        drop_as::<PyFunction>(obj);
    }
}

extern "C" fn instancemethod_dealloc(obj: *mut PyObject) {
    unsafe {
        let im = obj as *mut PyInstanceMethod;
        decref((*im).func);
        xdecref((*im).obj);
        drop_as::<PyInstanceMethod>(obj);
    }
}

extern "C" fn property_dealloc(obj: *mut PyObject) {
    unsafe {
        let p = obj as *mut PyProperty;
        xdecref((*p).prop_get);
        xdecref((*p).prop_set);
        drop_as::<PyProperty>(obj);
    }
}

extern "C" fn getset_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyGetSetDescr>(obj) }
}

extern "C" fn member_dealloc(obj: *mut PyObject) {
    unsafe { drop_as::<PyMemberDescr>(obj) }
}

extern "C" fn instance_dealloc(obj: *mut PyObject) {
    unsafe {
        let inst = obj as *mut PyInstance;
        (*inst).attrs.clear_for_dealloc();
        drop_as::<PyInstance>(obj);
    }
}

// ---- Builtin class table ----

pub struct Builtins {
    pub object_cls: *mut PyClass,
    pub type_cls: *mut PyClass,
    pub str_cls: *mut PyClass,
    pub int_cls: *mut PyClass,
    pub bool_cls: *mut PyClass,
    pub float_cls: *mut PyClass,
    pub long_cls: *mut PyClass,
    pub none_cls: *mut PyClass,
    pub notimplemented_cls: *mut PyClass,
    pub tuple_cls: *mut PyClass,
    pub list_cls: *mut PyClass,
    pub dict_cls: *mut PyClass,
    pub slice_cls: *mut PyClass,
    pub function_cls: *mut PyClass,
    pub instancemethod_cls: *mut PyClass,
    pub property_cls: *mut PyClass,
    pub getset_cls: *mut PyClass,
    pub member_cls: *mut PyClass,

    pub type_error: *mut PyClass,
    pub attribute_error: *mut PyClass,
    pub key_error: *mut PyClass,
    pub index_error: *mut PyClass,
    pub value_error: *mut PyClass,

    pub none: *mut PyObject,
    pub not_implemented: *mut PyObject,
    pub true_obj: *mut PyObject,
    pub false_obj: *mut PyObject,
    pub empty_tuple: *mut PyObject,
}

unsafe impl Sync for Builtins {}
unsafe impl Send for Builtins {}

fn raw_class(name: &str) -> *mut PyClass {
    alloc_object(PyClass {
        base: PyObject {
            ob_refcnt: IMMORTAL_REFCNT,
            cls: std::ptr::null_mut(),
        },
        tp_flags: TypeFlags::HAVE_VERSION_TAG,
        tp_version_tag: 0,
        tp_mro: std::ptr::null_mut(),
        tp_getattro: None,
        tp_setattr: None,
        tp_setattro: None,
        tp_descr_get: None,
        tp_descr_set: None,
        tp_richcompare: None,
        tp_as_sequence: std::ptr::null_mut(),
        tp_as_mapping: std::ptr::null_mut(),
        tp_dealloc: None,
        attrs_offset: -1,
        is_user_defined: false,
        name: name.to_string(),
        attrs: BTreeMap::new(),
        bases: Vec::new(),
        subclasses: Vec::new(),
        dependent_icgetattrs: ICInvalidator::new(),
    })
}

fn build_mro(cls: *mut PyClass, tuple_cls: *mut PyClass) {
    // Depth-first linearization with duplicate suppression; enough for
    // the single-inheritance shapes this runtime builds. The mro tuple
    // is created by hand so class setup never recurses into the lazily
    // initialized builtin table.
    unsafe {
        let mut mro: Vec<*mut PyObject> = vec![cls as *mut PyObject];
        let mut work: Vec<*mut PyClass> = (*cls).bases.clone();
        while let Some(b) = work.pop() {
            if !mro.contains(&(b as *mut PyObject)) {
                mro.push(b as *mut PyObject);
                for &bb in (*b).bases.iter() {
                    work.push(bb);
                }
            }
        }
        let tuple = alloc_object(PyTuple {
            base: PyObject {
                ob_refcnt: IMMORTAL_REFCNT,
                cls: tuple_cls,
            },
            elts: mro,
        });
        (*cls).tp_mro = tuple;
    }
}

fn init_builtins() -> Builtins {
    let object_cls = raw_class("object");
    let type_cls = raw_class("type");

    macro_rules! cls {
        ($name:expr) => {{
            let c = raw_class($name);
            unsafe {
                (*c).base.cls = type_cls;
                (*c).bases = vec![object_cls];
            }
            c
        }};
    }

    unsafe {
        (*object_cls).base.cls = type_cls;
        (*type_cls).base.cls = type_cls;
        (*type_cls).bases = vec![object_cls];
    }

    let str_cls = cls!("str");
    let int_cls = cls!("int");
    let bool_cls = {
        let c = raw_class("bool");
        unsafe {
            (*c).base.cls = type_cls;
            (*c).bases = vec![int_cls];
        }
        c
    };
    let float_cls = cls!("float");
    let long_cls = cls!("long");
    let none_cls = cls!("NoneType");
    let notimplemented_cls = cls!("NotImplementedType");
    let tuple_cls = cls!("tuple");
    let list_cls = cls!("list");
    let dict_cls = cls!("dict");
    let slice_cls = cls!("slice");
    let function_cls = cls!("function");
    let instancemethod_cls = cls!("instancemethod");
    let property_cls = cls!("property");
    let getset_cls = cls!("getset_descriptor");
    let member_cls = cls!("member_descriptor");

    let type_error = cls!("TypeError");
    let attribute_error = cls!("AttributeError");
    let key_error = cls!("KeyError");
    let index_error = cls!("IndexError");
    let value_error = cls!("ValueError");

    unsafe {
        (*str_cls).tp_dealloc = Some(str_dealloc);
        (*int_cls).tp_dealloc = Some(int_dealloc);
        (*bool_cls).tp_dealloc = Some(int_dealloc);
        (*float_cls).tp_dealloc = Some(float_dealloc);
        (*long_cls).tp_dealloc = Some(long_dealloc);
        (*tuple_cls).tp_dealloc = Some(tuple_dealloc);
        (*list_cls).tp_dealloc = Some(list_dealloc);
        (*dict_cls).tp_dealloc = Some(dict_dealloc);
        (*slice_cls).tp_dealloc = Some(slice_dealloc);
        (*function_cls).tp_dealloc = Some(function_dealloc);
        (*instancemethod_cls).tp_dealloc = Some(instancemethod_dealloc);
        (*property_cls).tp_dealloc = Some(property_dealloc);
        (*getset_cls).tp_dealloc = Some(getset_dealloc);
        (*member_cls).tp_dealloc = Some(member_dealloc);

        (*property_cls).tp_descr_get = Some(property_descr_get);
        (*property_cls).tp_descr_set = Some(property_descr_set);
        (*getset_cls).tp_descr_get = Some(getset_descr_get);
        (*getset_cls).tp_descr_set = Some(getset_descr_set);
        (*member_cls).tp_descr_get = Some(member_descr_get);
        (*member_cls).tp_descr_set = Some(member_descr_set);
        (*function_cls).tp_descr_get = Some(function_descr_get);

        (*int_cls).tp_richcompare = Some(int_richcompare);
        (*bool_cls).tp_richcompare = Some(int_richcompare);
        (*str_cls).tp_richcompare = Some(str_richcompare);
        (*float_cls).tp_richcompare = Some(float_richcompare);

        (*str_cls).tp_flags |= TypeFlags::HAVE_SEQUENCE_IN;
        (*tuple_cls).tp_flags |= TypeFlags::HAVE_SEQUENCE_IN;
        (*list_cls).tp_flags |= TypeFlags::HAVE_SEQUENCE_IN;
        (*dict_cls).tp_flags |= TypeFlags::HAVE_SEQUENCE_IN;

        (*str_cls).tp_as_sequence = alloc_object(PySequenceMethods {
            sq_length: Some(str_length),
            sq_item: None,
            sq_contains: Some(str_contains),
        });
        (*tuple_cls).tp_as_sequence = alloc_object(PySequenceMethods {
            sq_length: Some(tuple_length),
            sq_item: Some(tuple_item),
            sq_contains: Some(tuple_contains),
        });
        (*list_cls).tp_as_sequence = alloc_object(PySequenceMethods {
            sq_length: Some(list_length),
            sq_item: Some(list_item),
            sq_contains: Some(list_contains),
        });
        (*dict_cls).tp_as_sequence = alloc_object(PySequenceMethods {
            sq_length: Some(dict_length),
            sq_item: None,
            sq_contains: Some(dict_contains),
        });
        (*list_cls).tp_as_mapping = alloc_object(PyMappingMethods {
            mp_subscript: Some(list_subscript),
            mp_ass_subscript: Some(list_ass_subscript),
        });
        (*dict_cls).tp_as_mapping = alloc_object(PyMappingMethods {
            mp_subscript: Some(dict_subscript),
            mp_ass_subscript: Some(dict_ass_subscript),
        });
        (*tuple_cls).tp_as_mapping = alloc_object(PyMappingMethods {
            mp_subscript: Some(tuple_subscript),
            mp_ass_subscript: None,
        });
    }

    let all = [
        object_cls,
        type_cls,
        str_cls,
        int_cls,
        bool_cls,
        float_cls,
        long_cls,
        none_cls,
        notimplemented_cls,
        tuple_cls,
        list_cls,
        dict_cls,
        slice_cls,
        function_cls,
        instancemethod_cls,
        property_cls,
        getset_cls,
        member_cls,
        type_error,
        attribute_error,
        key_error,
        index_error,
        value_error,
    ];

    let none = alloc_object(PyObject {
        ob_refcnt: IMMORTAL_REFCNT,
        cls: none_cls,
    });
    let not_implemented = alloc_object(PyObject {
        ob_refcnt: IMMORTAL_REFCNT,
        cls: notimplemented_cls,
    });
    let true_obj = alloc_object(PyInt {
        base: PyObject {
            ob_refcnt: IMMORTAL_REFCNT,
            cls: bool_cls,
        },
        n: 1,
    }) as *mut PyObject;
    let false_obj = alloc_object(PyInt {
        base: PyObject {
            ob_refcnt: IMMORTAL_REFCNT,
            cls: bool_cls,
        },
        n: 0,
    }) as *mut PyObject;
    let empty_tuple = alloc_object(PyTuple {
        base: PyObject {
            ob_refcnt: IMMORTAL_REFCNT,
            cls: tuple_cls,
        },
        elts: Vec::new(),
    }) as *mut PyObject;

    let b = Builtins {
        object_cls,
        type_cls,
        str_cls,
        int_cls,
        bool_cls,
        float_cls,
        long_cls,
        none_cls,
        notimplemented_cls,
        tuple_cls,
        list_cls,
        dict_cls,
        slice_cls,
        function_cls,
        instancemethod_cls,
        property_cls,
        getset_cls,
        member_cls,
        type_error,
        attribute_error,
        key_error,
        index_error,
        value_error,
        none,
        not_implemented,
        true_obj,
        false_obj,
        empty_tuple,
    };

    // MROs need the tuple class set up, so build them last.
    for &c in &all {
        build_mro(c, tuple_cls);
    }

    b
}

lazy_static! {
    static ref BUILTINS: Builtins = init_builtins();
}

static BUILTIN_METHODS_INIT: std::sync::Once = std::sync::Once::new();

pub fn builtins() -> &'static Builtins {
    let b: &'static Builtins = &BUILTINS;
    BUILTIN_METHODS_INIT.call_once(|| methods::register(b));
    b
}

// Internal accessor that must not re-enter method registration.
pub(crate) fn builtins_raw() -> &'static Builtins {
    &BUILTINS
}

pub fn object_cls() -> *mut PyClass {
    BUILTINS.object_cls
}

pub fn type_cls() -> *mut PyClass {
    BUILTINS.type_cls
}

pub fn none_object() -> *mut PyObject {
    BUILTINS.none
}

pub fn not_implemented() -> *mut PyObject {
    BUILTINS.not_implemented
}

pub fn empty_tuple() -> *mut PyObject {
    BUILTINS.empty_tuple
}

// ---- Interned strings ----

lazy_static! {
    static ref INTERNED_STRINGS: Mutex<BTreeMap<String, usize>> = Mutex::new(BTreeMap::new());
}

/// Intern `s`, returning the canonical immortal `PyStr`. Attribute names
/// are always interned, so name equality is pointer equality.
pub fn intern_string(s: &str) -> *mut PyStr {
    let mut table = INTERNED_STRINGS.lock().unwrap();
    if let Some(&p) = table.get(s) {
        return p as *mut PyStr;
    }
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    let obj = alloc_object(PyStr {
        base: PyObject {
            ob_refcnt: IMMORTAL_REFCNT,
            cls: BUILTINS.str_cls,
        },
        hash: hasher.finish(),
        value: s.to_string(),
    });
    table.insert(s.to_string(), obj as usize);
    obj
}

// ---- Constructors ----

pub fn box_int(n: i64) -> *mut PyObject {
    alloc_object(PyInt {
        base: header(BUILTINS.int_cls),
        n,
    }) as *mut PyObject
}

pub fn box_float(f: f64) -> *mut PyObject {
    alloc_object(PyFloat {
        base: header(BUILTINS.float_cls),
        f,
    }) as *mut PyObject
}

pub fn box_long(n: i64) -> *mut PyObject {
    alloc_object(PyLong {
        base: header(BUILTINS.long_cls),
        n,
    }) as *mut PyObject
}

/// Boxed booleans are the two shared singletons, returned owned.
pub extern "C" fn box_bool(b: bool) -> *mut PyObject {
    let obj = if b { BUILTINS.true_obj } else { BUILTINS.false_obj };
    unsafe { incref(obj) };
    obj
}

pub extern "C" fn box_bool_negated(b: bool) -> *mut PyObject {
    box_bool(!b)
}

pub fn box_str(s: &str) -> *mut PyObject {
    intern_string(s) as *mut PyObject
}

/// A fresh (non-interned, refcounted) string, for computed values like
/// concatenation results.
pub fn new_string_uninterned(s: &str) -> *mut PyObject {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    alloc_object(PyStr {
        base: header(BUILTINS.str_cls),
        hash: hasher.finish(),
        value: s.to_string(),
    }) as *mut PyObject
}

pub fn new_tuple(elts: &[*mut PyObject]) -> *mut PyObject {
    for &e in elts {
        unsafe { incref(e) };
    }
    alloc_object(PyTuple {
        base: header(BUILTINS.tuple_cls),
        elts: elts.to_vec(),
    }) as *mut PyObject
}

pub fn new_list(elts: &[*mut PyObject]) -> *mut PyObject {
    for &e in elts {
        unsafe { incref(e) };
    }
    alloc_object(PyList {
        base: header(BUILTINS.list_cls),
        elts: elts.to_vec(),
    }) as *mut PyObject
}

pub extern "C" fn create_dict() -> *mut PyObject {
    alloc_object(PyDict {
        base: header(BUILTINS.dict_cls),
        map: BTreeMap::new(),
    }) as *mut PyObject
}

pub fn new_slice(start: *mut PyObject, stop: *mut PyObject, step: *mut PyObject) -> *mut PyObject {
    unsafe {
        incref(start);
        incref(stop);
        incref(step);
    }
    alloc_object(PySlice {
        base: header(BUILTINS.slice_cls),
        start,
        stop,
        step,
    }) as *mut PyObject
}

pub fn new_function(
    name: &str,
    entry: FunctionEntry,
    num_args: u32,
    takes_varargs: bool,
    takes_kwargs: bool,
    param_names: &[&str],
    defaults: &[*mut PyObject],
) -> *mut PyObject {
    for &d in defaults {
        unsafe { incref(d) };
    }
    alloc_object(PyFunction {
        base: header(BUILTINS.function_cls),
        entry,
        num_args,
        takes_varargs,
        takes_kwargs,
        param_names: param_names.iter().map(|s| intern_string(s)).collect(),
        defaults: defaults.to_vec(),
        name: name.to_string(),
    }) as *mut PyObject
}

pub fn new_instance_method(func: *mut PyObject, obj: *mut PyObject) -> *mut PyObject {
    unsafe {
        incref(func);
        xincref(obj);
    }
    alloc_object(PyInstanceMethod {
        base: header(BUILTINS.instancemethod_cls),
        func,
        obj,
    }) as *mut PyObject
}

pub fn new_property(prop_get: *mut PyObject, prop_set: *mut PyObject) -> *mut PyObject {
    unsafe {
        xincref(prop_get);
        xincref(prop_set);
    }
    alloc_object(PyProperty {
        base: header(BUILTINS.property_cls),
        prop_get,
        prop_set,
    }) as *mut PyObject
}

pub fn new_getset_descr(
    name: &str,
    get: extern "C" fn(*mut PyObject) -> *mut PyObject,
    set: Option<extern "C" fn(*mut PyObject, *mut PyObject) -> i32>,
) -> *mut PyObject {
    alloc_object(PyGetSetDescr {
        base: header(BUILTINS.getset_cls),
        get,
        set,
        name: name.to_string(),
    }) as *mut PyObject
}

pub fn new_member_descr(name: &str, offset: i32) -> *mut PyObject {
    alloc_object(PyMemberDescr {
        base: header(BUILTINS.member_cls),
        offset,
        name: name.to_string(),
    }) as *mut PyObject
}

/// Instantiate a user class (hidden-class storage, empty).
pub fn new_instance(cls: *mut PyClass) -> *mut PyObject {
    unsafe {
        assert!((*cls).instances_have_hcattrs());
        assert_eq!((*cls).attrs_offset, INSTANCE_ATTRS_OFFSET);
    }
    alloc_object(PyInstance {
        base: header(cls),
        attrs: HCAttrs::new(),
    }) as *mut PyObject
}

/// Create a user-defined class deriving from `bases` (object if empty).
pub fn create_user_class(name: &str, bases: &[*mut PyClass]) -> *mut PyClass {
    let cls = raw_class(name);
    unsafe {
        (*cls).base.cls = BUILTINS.type_cls;
        (*cls).bases = if bases.is_empty() {
            vec![BUILTINS.object_cls]
        } else {
            bases.to_vec()
        };
        (*cls).is_user_defined = true;
        (*cls).attrs_offset = INSTANCE_ATTRS_OFFSET;
        (*cls).tp_dealloc = Some(instance_dealloc);
        for &b in (*cls).bases.iter() {
            (*b).subclasses.push(cls);
        }
        build_mro(cls, BUILTINS.tuple_cls);
    }
    cls
}

// ---- Type checks and small helpers ----

pub fn is_subclass(child: *mut PyClass, parent: *mut PyClass) -> bool {
    if child == parent {
        return true;
    }
    unsafe {
        (*child)
            .mro_slice()
            .iter()
            .any(|&c| c as *mut PyClass == parent)
    }
}

pub fn type_check(obj: *mut PyObject) -> bool {
    unsafe { is_subclass((*obj).cls, BUILTINS.type_cls) }
}

pub fn type_name(obj: *mut PyObject) -> &'static str {
    unsafe {
        let cls = (*obj).cls;
        std::mem::transmute::<&str, &'static str>((*cls).name.as_str())
    }
}

pub fn unbox_int(obj: *mut PyObject) -> i64 {
    unsafe {
        debug_assert!(is_subclass((*obj).cls, BUILTINS.int_cls));
        (*(obj as *mut PyInt)).n
    }
}

pub fn unbox_bool(obj: *mut PyObject) -> bool {
    unbox_int(obj) != 0
}

pub fn str_value(obj: *mut PyObject) -> &'static str {
    unsafe {
        debug_assert_eq!((*obj).cls, BUILTINS.str_cls);
        std::mem::transmute::<&str, &'static str>((*(obj as *mut PyStr)).value.as_str())
    }
}

/// Iterate a tuple or list's elements (the only iterables this runtime
/// produces for varargs).
pub fn py_elements(obj: *mut PyObject) -> Option<Vec<*mut PyObject>> {
    unsafe {
        let cls = (*obj).cls;
        if is_subclass(cls, BUILTINS.tuple_cls) {
            Some((*(obj as *mut PyTuple)).elts.clone())
        } else if is_subclass(cls, BUILTINS.list_cls) {
            Some((*(obj as *mut PyList)).elts.clone())
        } else {
            None
        }
    }
}

// ---- Builtin tp-slot implementations ----

fn raise_capi(exc_type: *mut PyClass, msg: String) {
    set_pending_exc(ExcInfo {
        exc_type,
        message: msg,
    });
}

extern "C" fn str_length(obj: *mut PyObject) -> i64 {
    unsafe { (*(obj as *mut PyStr)).value.chars().count() as i64 }
}

extern "C" fn str_contains(container: *mut PyObject, item: *mut PyObject) -> i32 {
    unsafe {
        if (*item).cls != BUILTINS.str_cls {
            raise_capi(
                BUILTINS.type_error,
                "'in <string>' requires string as left operand".to_string(),
            );
            return -1;
        }
        let haystack = &(*(container as *mut PyStr)).value;
        let needle = &(*(item as *mut PyStr)).value;
        haystack.contains(needle.as_str()) as i32
    }
}

extern "C" fn tuple_length(obj: *mut PyObject) -> i64 {
    unsafe { (*(obj as *mut PyTuple)).elts.len() as i64 }
}

extern "C" fn list_length(obj: *mut PyObject) -> i64 {
    unsafe { (*(obj as *mut PyList)).elts.len() as i64 }
}

extern "C" fn dict_length(obj: *mut PyObject) -> i64 {
    unsafe { (*(obj as *mut PyDict)).map.len() as i64 }
}

fn seq_index(len: usize, idx: i64) -> Option<usize> {
    let n = len as i64;
    let idx = if idx < 0 { idx + n } else { idx };
    if idx < 0 || idx >= n {
        None
    } else {
        Some(idx as usize)
    }
}

extern "C" fn tuple_item(obj: *mut PyObject, idx: i64) -> *mut PyObject {
    unsafe {
        let elts = &(*(obj as *mut PyTuple)).elts;
        match seq_index(elts.len(), idx) {
            Some(i) => {
                incref(elts[i]);
                elts[i]
            }
            None => {
                raise_capi(BUILTINS.index_error, "tuple index out of range".to_string());
                std::ptr::null_mut()
            }
        }
    }
}

extern "C" fn list_item(obj: *mut PyObject, idx: i64) -> *mut PyObject {
    unsafe {
        let elts = &(*(obj as *mut PyList)).elts;
        match seq_index(elts.len(), idx) {
            Some(i) => {
                incref(elts[i]);
                elts[i]
            }
            None => {
                raise_capi(BUILTINS.index_error, "list index out of range".to_string());
                std::ptr::null_mut()
            }
        }
    }
}

fn obj_eq(a: *mut PyObject, b: *mut PyObject) -> bool {
    if a == b {
        return true;
    }
    unsafe {
        let ca = (*a).cls;
        let cb = (*b).cls;
        let int_like = |c: *mut PyClass| {
            c == BUILTINS.int_cls || c == BUILTINS.bool_cls || c == BUILTINS.long_cls
        };
        if int_like(ca) && int_like(cb) {
            return (*(a as *mut PyInt)).n == (*(b as *mut PyInt)).n;
        }
        if ca == BUILTINS.str_cls && cb == BUILTINS.str_cls {
            return (*(a as *mut PyStr)).value == (*(b as *mut PyStr)).value;
        }
        if ca == BUILTINS.float_cls && cb == BUILTINS.float_cls {
            return (*(a as *mut PyFloat)).f == (*(b as *mut PyFloat)).f;
        }
        false
    }
}

extern "C" fn tuple_contains(container: *mut PyObject, item: *mut PyObject) -> i32 {
    unsafe {
        (*(container as *mut PyTuple))
            .elts
            .iter()
            .any(|&e| obj_eq(e, item)) as i32
    }
}

extern "C" fn list_contains(container: *mut PyObject, item: *mut PyObject) -> i32 {
    unsafe {
        (*(container as *mut PyList))
            .elts
            .iter()
            .any(|&e| obj_eq(e, item)) as i32
    }
}

extern "C" fn dict_contains(container: *mut PyObject, item: *mut PyObject) -> i32 {
    unsafe { (*(container as *mut PyDict)).map.contains_key(&(item as usize)) as i32 }
}

pub fn dict_get_item(d: *mut PyObject, key: *mut PyObject) -> Option<*mut PyObject> {
    unsafe { (*(d as *mut PyDict)).map.get(&(key as usize)).copied() }
}

pub fn dict_set_item(d: *mut PyObject, key: *mut PyObject, val: *mut PyObject) {
    unsafe {
        incref(val);
        let map = &mut (*(d as *mut PyDict)).map;
        match map.insert(key as usize, val) {
            Some(old) => decref(old),
            None => incref(key),
        }
    }
}

pub fn dict_del_item(d: *mut PyObject, key: *mut PyObject) -> bool {
    unsafe {
        match (*(d as *mut PyDict)).map.remove(&(key as usize)) {
            Some(old) => {
                decref(old);
                decref(key);
                true
            }
            None => false,
        }
    }
}

extern "C" fn dict_subscript(d: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    match dict_get_item(d, key) {
        Some(v) => {
            unsafe { incref(v) };
            v
        }
        None => {
            raise_capi(BUILTINS.key_error, "key not found".to_string());
            std::ptr::null_mut()
        }
    }
}

extern "C" fn dict_ass_subscript(d: *mut PyObject, key: *mut PyObject, val: *mut PyObject) -> i32 {
    if val.is_null() {
        if !dict_del_item(d, key) {
            raise_capi(BUILTINS.key_error, "key not found".to_string());
            return -1;
        }
        return 0;
    }
    dict_set_item(d, key, val);
    0
}

extern "C" fn list_subscript(l: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    unsafe {
        if is_subclass((*key).cls, BUILTINS.int_cls) {
            return list_item(l, (*(key as *mut PyInt)).n);
        }
        raise_capi(
            BUILTINS.type_error,
            format!("list indices must be integers, not {}", type_name(key)),
        );
        std::ptr::null_mut()
    }
}

extern "C" fn list_ass_subscript(l: *mut PyObject, key: *mut PyObject, val: *mut PyObject) -> i32 {
    unsafe {
        if !is_subclass((*key).cls, BUILTINS.int_cls) {
            raise_capi(
                BUILTINS.type_error,
                format!("list indices must be integers, not {}", type_name(key)),
            );
            return -1;
        }
        let elts = &mut (*(l as *mut PyList)).elts;
        let idx = match seq_index(elts.len(), (*(key as *mut PyInt)).n) {
            Some(i) => i,
            None => {
                raise_capi(
                    BUILTINS.index_error,
                    "list assignment index out of range".to_string(),
                );
                return -1;
            }
        };
        if val.is_null() {
            let old = elts.remove(idx);
            decref(old);
        } else {
            incref(val);
            let old = std::mem::replace(&mut elts[idx], val);
            decref(old);
        }
        0
    }
}

extern "C" fn tuple_subscript(t: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    unsafe {
        if is_subclass((*key).cls, BUILTINS.int_cls) {
            return tuple_item(t, (*(key as *mut PyInt)).n);
        }
        raise_capi(
            BUILTINS.type_error,
            format!("tuple indices must be integers, not {}", type_name(key)),
        );
        std::ptr::null_mut()
    }
}

pub const PY_LT: i32 = 0;
pub const PY_LE: i32 = 1;
pub const PY_EQ: i32 = 2;
pub const PY_NE: i32 = 3;
pub const PY_GT: i32 = 4;
pub const PY_GE: i32 = 5;

fn cmp_outcome<T: PartialOrd + PartialEq>(a: T, b: T, op: i32) -> bool {
    match op {
        PY_LT => a < b,
        PY_LE => a <= b,
        PY_EQ => a == b,
        PY_NE => a != b,
        PY_GT => a > b,
        PY_GE => a >= b,
        _ => unreachable!(),
    }
}

extern "C" fn int_richcompare(a: *mut PyObject, b: *mut PyObject, op: i32) -> *mut PyObject {
    unsafe {
        let int_like = |c: *mut PyClass| {
            c == BUILTINS.int_cls || c == BUILTINS.bool_cls || c == BUILTINS.long_cls
        };
        if !int_like((*b).cls) {
            incref(BUILTINS.not_implemented);
            return BUILTINS.not_implemented;
        }
        box_bool(cmp_outcome(
            (*(a as *mut PyInt)).n,
            (*(b as *mut PyInt)).n,
            op,
        ))
    }
}

extern "C" fn str_richcompare(a: *mut PyObject, b: *mut PyObject, op: i32) -> *mut PyObject {
    unsafe {
        if (*b).cls != BUILTINS.str_cls {
            incref(BUILTINS.not_implemented);
            return BUILTINS.not_implemented;
        }
        let sa = &(*(a as *mut PyStr)).value;
        let sb = &(*(b as *mut PyStr)).value;
        box_bool(cmp_outcome(sa.as_str(), sb.as_str(), op))
    }
}

extern "C" fn float_richcompare(a: *mut PyObject, b: *mut PyObject, op: i32) -> *mut PyObject {
    unsafe {
        let fa = (*(a as *mut PyFloat)).f;
        let fb = if (*b).cls == BUILTINS.float_cls {
            (*(b as *mut PyFloat)).f
        } else if is_subclass((*b).cls, BUILTINS.int_cls) {
            (*(b as *mut PyInt)).n as f64
        } else {
            incref(BUILTINS.not_implemented);
            return BUILTINS.not_implemented;
        };
        box_bool(cmp_outcome(fa, fb, op))
    }
}

// ---- Descriptor tp-slot implementations ----

extern "C" fn property_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let prop = descr as *mut PyProperty;
        if obj.is_null() {
            incref(descr);
            return descr;
        }
        if (*prop).prop_get.is_null() {
            raise_capi(BUILTINS.attribute_error, "unreadable attribute".to_string());
            return std::ptr::null_mut();
        }
        crate::dispatch::call::runtime_call_capi(
            (*prop).prop_get,
            crate::dispatch::args::ArgPassSpec::positional(1),
            obj,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null(),
        )
    }
}

extern "C" fn property_descr_set(
    descr: *mut PyObject,
    obj: *mut PyObject,
    val: *mut PyObject,
) -> i32 {
    unsafe {
        let prop = descr as *mut PyProperty;
        if (*prop).prop_set.is_null() {
            raise_capi(BUILTINS.attribute_error, "can't set attribute".to_string());
            return -1;
        }
        let r = crate::dispatch::call::runtime_call_capi(
            (*prop).prop_set,
            crate::dispatch::args::ArgPassSpec::positional(2),
            obj,
            val,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null(),
        );
        if r.is_null() {
            return -1;
        }
        decref(r);
        0
    }
}

extern "C" fn getset_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        if obj.is_null() {
            incref(descr);
            return descr;
        }
        ((*(descr as *mut PyGetSetDescr)).get)(obj)
    }
}

extern "C" fn getset_descr_set(descr: *mut PyObject, obj: *mut PyObject, val: *mut PyObject) -> i32 {
    unsafe {
        match (*(descr as *mut PyGetSetDescr)).set {
            Some(set) => set(obj, val),
            None => {
                raise_capi(BUILTINS.attribute_error, "can't set attribute".to_string());
                -1
            }
        }
    }
}

extern "C" fn member_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        if obj.is_null() {
            incref(descr);
            return descr;
        }
        let offset = (*(descr as *mut PyMemberDescr)).offset;
        let slot = (obj as *mut u8).offset(offset as isize) as *mut *mut PyObject;
        let val = *slot;
        if val.is_null() {
            raise_capi(
                BUILTINS.attribute_error,
                (*(descr as *mut PyMemberDescr)).name.clone(),
            );
            return std::ptr::null_mut();
        }
        incref(val);
        val
    }
}

extern "C" fn member_descr_set(descr: *mut PyObject, obj: *mut PyObject, val: *mut PyObject) -> i32 {
    unsafe {
        let offset = (*(descr as *mut PyMemberDescr)).offset;
        let slot = (obj as *mut u8).offset(offset as isize) as *mut *mut PyObject;
        xincref(val);
        let old = *slot;
        *slot = val;
        xdecref(old);
        0
    }
}

extern "C" fn function_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    // Functions bind into instance methods.
    new_instance_method(descr, obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_are_stable() {
        assert_eq!(REFCNT_OFFSET, 0);
        assert_eq!(CLS_OFFSET, 8);
        assert_eq!(INT_N_OFFSET, 16);
        assert_eq!(INSTANCE_ATTRS_OFFSET, 16);
    }

    #[test]
    fn interning_is_canonical() {
        let a = intern_string("attr_name");
        let b = intern_string("attr_name");
        let c = intern_string("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        unsafe {
            assert_eq!((*a).s(), "attr_name");
        }
    }

    #[test]
    fn refcount_life_cycle() {
        let x = box_int(7);
        assert_eq!(refcnt(x), 1);
        unsafe {
            incref(x);
            assert_eq!(refcnt(x), 2);
            decref(x);
            assert_eq!(refcnt(x), 1);
            decref(x);
        }
    }

    #[test]
    fn bool_singletons_are_shared() {
        let a = box_bool(true);
        let b = box_bool(true);
        assert_eq!(a, b);
        unsafe {
            decref(a);
            decref(b);
        }
    }

    #[test]
    fn user_class_mro() {
        let a = create_user_class("A", &[]);
        let b = create_user_class("B", &[a]);
        assert!(is_subclass(b, a));
        assert!(is_subclass(b, object_cls()));
        assert!(!is_subclass(a, b));
        unsafe {
            assert_eq!((*b).mro_slice().len(), 3);
        }
    }

    #[test]
    fn dict_identity_semantics() {
        let d = create_dict();
        let k = box_str("k");
        let v = box_int(1);
        dict_set_item(d, k, v);
        assert_eq!(dict_get_item(d, box_str("k")), Some(v));
        assert!(dict_del_item(d, k));
        assert_eq!(dict_get_item(d, k), None);
        unsafe {
            decref(v);
            decref(d);
        }
    }
}
