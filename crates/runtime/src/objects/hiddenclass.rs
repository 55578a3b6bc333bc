//! Hidden classes: shared shape descriptors mapping attribute names to
//! fixed slots in an instance's attribute array.
//!
//! Two kinds. `Normal` hidden classes form a transition tree: appending an
//! attribute follows (or creates) a child edge, so objects that gain the
//! same attributes in the same order share a shape, and one identity check
//! guards every offset. `Singleton` hidden classes belong to a single
//! owner (a module-like object); they mutate in place and carry an
//! invalidator that fires on every shape change.
//!
//! Hidden classes are immortal: their addresses are embedded in emitted
//! guards without reference tracking.

use std::collections::BTreeMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::ics::invalidator::ICInvalidator;
use crate::objects::{decref, xdecref, PyObject, PyStr};
use crate::rewriter::Rewriter;
use crate::stats::StatCounter;

static NUM_HIDDEN_CLASSES: StatCounter = StatCounter::new("num_hidden_classes");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenClassKind {
    Normal,
    Singleton,
}

pub struct HiddenClass {
    pub kind: HiddenClassKind,
    /// Interned attribute name -> index into the attribute array.
    attr_offsets: BTreeMap<usize, i32>,
    /// Transition edges, keyed by the appended attribute name.
    children: Mutex<BTreeMap<usize, *mut HiddenClass>>,
    /// Fired on in-place shape changes (Singleton only).
    pub dependent_getattrs: ICInvalidator,
}

unsafe impl Sync for HiddenClass {}
unsafe impl Send for HiddenClass {}

lazy_static! {
    static ref ROOT: usize = HiddenClass::alloc(HiddenClassKind::Normal, BTreeMap::new()) as usize;
}

impl HiddenClass {
    fn alloc(kind: HiddenClassKind, attr_offsets: BTreeMap<usize, i32>) -> *mut HiddenClass {
        NUM_HIDDEN_CLASSES.log();
        Box::into_raw(Box::new(HiddenClass {
            kind,
            attr_offsets,
            children: Mutex::new(BTreeMap::new()),
            dependent_getattrs: ICInvalidator::new(),
        }))
    }

    /// The empty root shape every fresh object starts from.
    pub fn root() -> *mut HiddenClass {
        *ROOT as *mut HiddenClass
    }

    /// A fresh singleton shape for an object that will mutate in place.
    pub fn make_singleton() -> *mut HiddenClass {
        HiddenClass::alloc(HiddenClassKind::Singleton, BTreeMap::new())
    }

    pub fn attribute_array_size(&self) -> usize {
        self.attr_offsets.len()
    }

    pub fn get_offset(&self, attr: *mut PyStr) -> Option<i32> {
        self.attr_offsets.get(&(attr as usize)).copied()
    }

    pub fn attr_names(&self) -> Vec<*mut PyStr> {
        let mut names = vec![std::ptr::null_mut(); self.attr_offsets.len()];
        for (&name, &off) in &self.attr_offsets {
            names[off as usize] = name as *mut PyStr;
        }
        names
    }

    /// Follow (or create) the transition edge for appending `attr`.
    pub fn get_or_make_child(&self, attr: *mut PyStr) -> *mut HiddenClass {
        debug_assert_eq!(self.kind, HiddenClassKind::Normal);
        debug_assert!(self.get_offset(attr).is_none());

        let mut children = self.children.lock().unwrap();
        if let Some(&child) = children.get(&(attr as usize)) {
            return child;
        }

        let mut offsets = self.attr_offsets.clone();
        offsets.insert(attr as usize, self.attribute_array_size() as i32);
        let child = HiddenClass::alloc(HiddenClassKind::Normal, offsets);
        children.insert(attr as usize, child);
        unsafe {
            debug_assert_eq!(
                (*child).attribute_array_size(),
                self.attribute_array_size() + 1
            );
        }
        child
    }

    /// Shape after deleting `attr`, preserving the order of the remaining
    /// attributes. Rebuilt from the root; the transition edges cache the
    /// result for subsequent deletes of the same name.
    pub fn del_attr_to_make_hc(&self, attr: *mut PyStr) -> *mut HiddenClass {
        debug_assert_eq!(self.kind, HiddenClassKind::Normal);
        let idx = self.get_offset(attr).expect("deleting a missing attribute");

        let mut new_attrs = vec![std::ptr::null_mut(); self.attribute_array_size() - 1];
        for (&name, &off) in &self.attr_offsets {
            if off < idx {
                new_attrs[off as usize] = name as *mut PyStr;
            } else if off > idx {
                new_attrs[(off - 1) as usize] = name as *mut PyStr;
            }
        }

        let mut cur = HiddenClass::root();
        for name in new_attrs {
            cur = unsafe { (*cur).get_or_make_child(name) };
        }
        cur
    }

    // Singleton operations: mutate in place, invalidating dependents.

    pub fn append_attribute(&mut self, attr: *mut PyStr) {
        debug_assert_eq!(self.kind, HiddenClassKind::Singleton);
        self.dependent_getattrs.invalidate_all();
        debug_assert!(self.get_offset(attr).is_none());
        let n = self.attribute_array_size() as i32;
        self.attr_offsets.insert(attr as usize, n);
    }

    pub fn del_attribute(&mut self, attr: *mut PyStr) {
        debug_assert_eq!(self.kind, HiddenClassKind::Singleton);
        self.dependent_getattrs.invalidate_all();
        let prev_idx = self.attr_offsets.remove(&(attr as usize)).unwrap();
        for (_, off) in self.attr_offsets.iter_mut() {
            debug_assert!(*off != prev_idx);
            if *off > prev_idx {
                *off -= 1;
            }
        }
    }

    /// Rewrites reading through a singleton shape must depend on it not
    /// changing.
    pub fn add_dependence(&mut self, rewriter: &mut Rewriter) {
        debug_assert_eq!(self.kind, HiddenClassKind::Singleton);
        rewriter.add_dependence_on(&mut self.dependent_getattrs);
    }
}

// ---- Attribute-array storage ----

/// Header embedded in objects whose class has `attrs_offset >= 0`.
#[repr(C)]
pub struct HCAttrs {
    pub hcls: *mut HiddenClass,
    pub attr_list: *mut AttrList,
}

pub const HCATTRS_HCLS_OFFSET: i32 = 0;
pub const HCATTRS_LIST_OFFSET: i32 = 8;

/// Variable-length attribute array; `attrs` is the payload.
#[repr(C)]
pub struct AttrList {
    pub attrs: [*mut PyObject; 0],
}

pub const ATTRLIST_ATTRS_OFFSET: i32 = 0;

// Array growth: start at 4 slots, double at capacity. Freed arrays up to
// 32 slots go on per-size-class freelists.
pub const INITIAL_ARRAY_SIZE: usize = 4;
const NUM_FREELISTS: usize = 4;
const FREELIST_MAX: usize = 100;
const MAX_FREELIST_SIZE: usize = INITIAL_ARRAY_SIZE << (NUM_FREELISTS - 1);

lazy_static! {
    static ref ATTRLIST_FREELISTS: Mutex<[Vec<usize>; NUM_FREELISTS]> =
        Mutex::new([Vec::new(), Vec::new(), Vec::new(), Vec::new()]);
}

fn capacity_for(nattrs: usize) -> usize {
    let mut cap = INITIAL_ARRAY_SIZE;
    while cap < nattrs {
        cap *= 2;
    }
    cap
}

fn freelist_index(cap: usize) -> usize {
    debug_assert!(cap.is_power_of_two() && cap >= INITIAL_ARRAY_SIZE);
    (cap / INITIAL_ARRAY_SIZE).trailing_zeros() as usize
}

// Size-agnostic allocation: deletes shrink the logical size without
// reallocating, so the block backing an array can be one size class
// larger than its contents imply. malloc/free tolerate that; the
// freelists only ever under-promise a block's capacity.
fn alloc_attr_list(cap: usize) -> *mut AttrList {
    if cap <= MAX_FREELIST_SIZE {
        let mut lists = ATTRLIST_FREELISTS.lock().unwrap();
        if let Some(p) = lists[freelist_index(cap)].pop() {
            return p as *mut AttrList;
        }
    }
    unsafe { libc::malloc(cap * std::mem::size_of::<*mut PyObject>()) as *mut AttrList }
}

fn free_attr_list(list: *mut AttrList, cap: usize) {
    if cap <= MAX_FREELIST_SIZE {
        let mut lists = ATTRLIST_FREELISTS.lock().unwrap();
        let fl = &mut lists[freelist_index(cap)];
        if fl.len() < FREELIST_MAX {
            fl.push(list as usize);
            return;
        }
    }
    unsafe { libc::free(list as *mut libc::c_void) }
}

impl HCAttrs {
    pub fn new() -> HCAttrs {
        HCAttrs {
            hcls: HiddenClass::root(),
            attr_list: std::ptr::null_mut(),
        }
    }

    fn slot(&self, offset: i32) -> *mut *mut PyObject {
        debug_assert!(!self.attr_list.is_null());
        unsafe {
            ((*self.attr_list).attrs.as_ptr() as *mut *mut PyObject).offset(offset as isize)
        }
    }

    /// Borrowed read of the slot at `offset`.
    pub fn read(&self, offset: i32) -> *mut PyObject {
        unsafe { *self.slot(offset) }
    }

    /// Overwrite the slot at `offset` with an owned reference, releasing
    /// the previous occupant.
    pub fn replace(&mut self, offset: i32, val: *mut PyObject) {
        unsafe {
            let slot = self.slot(offset);
            let old = *slot;
            *slot = val;
            decref(old);
        }
    }

    /// Append an owned reference at index `cur_size`, growing (or
    /// allocating) the array when it hits a capacity boundary. The caller
    /// transitions `hcls` itself.
    pub fn append(&mut self, cur_size: usize, val: *mut PyObject) {
        if self.attr_list.is_null() {
            debug_assert_eq!(cur_size, 0);
            self.attr_list = alloc_attr_list(INITIAL_ARRAY_SIZE);
        } else if cur_size >= INITIAL_ARRAY_SIZE && cur_size.is_power_of_two() {
            // At capacity: move to an array twice the size.
            let new_list = alloc_attr_list(cur_size * 2);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (*self.attr_list).attrs.as_ptr(),
                    (*new_list).attrs.as_ptr() as *mut *mut PyObject,
                    cur_size,
                );
            }
            free_attr_list(self.attr_list, cur_size);
            self.attr_list = new_list;
        }
        unsafe {
            *self.slot(cur_size as i32) = val;
        }
    }

    /// Remove the slot at `offset`, shifting later attributes down. The
    /// caller owns the hidden-class transition and the dropped reference.
    pub fn remove_at(&mut self, offset: i32, old_size: usize) -> *mut PyObject {
        unsafe {
            let removed = self.read(offset);
            for i in offset as usize..old_size - 1 {
                *self.slot(i as i32) = *self.slot(i as i32 + 1);
            }
            removed
        }
    }

    /// Release every stored reference (object teardown).
    pub fn clear_for_dealloc(&mut self) {
        if self.attr_list.is_null() {
            return;
        }
        let n = unsafe { (*self.hcls).attribute_array_size() };
        for i in 0..n {
            unsafe { xdecref(self.read(i as i32)) };
        }
        free_attr_list(self.attr_list, capacity_for(n.max(1)));
        self.attr_list = std::ptr::null_mut();
        self.hcls = HiddenClass::root();
    }
}

impl Default for HCAttrs {
    fn default() -> Self {
        HCAttrs::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{box_int, intern_string, refcnt};

    #[test]
    fn transitions_are_shared() {
        let x = intern_string("hc_x");
        let y = intern_string("hc_y");
        let root = HiddenClass::root();
        unsafe {
            let a = (*root).get_or_make_child(x);
            let b = (*(*root).get_or_make_child(x)).get_or_make_child(y);
            let b2 = (*a).get_or_make_child(y);
            assert_eq!(b, b2);
            assert_eq!((*a).get_offset(x), Some(0));
            assert_eq!((*b).get_offset(y), Some(1));
            assert_eq!((*root).get_offset(x), None);
        }
    }

    #[test]
    fn delete_rebuilds_shape() {
        let x = intern_string("hcdel_x");
        let y = intern_string("hcdel_y");
        let z = intern_string("hcdel_z");
        unsafe {
            let root = HiddenClass::root();
            let xyz = (*(*(*root).get_or_make_child(x)).get_or_make_child(y)).get_or_make_child(z);
            let without_y = (*xyz).del_attr_to_make_hc(y);
            assert_eq!((*without_y).get_offset(x), Some(0));
            assert_eq!((*without_y).get_offset(z), Some(1));
            assert_eq!((*without_y).get_offset(y), None);
            // Same shape as building x,z directly.
            let xz = (*(*root).get_or_make_child(x)).get_or_make_child(z);
            assert_eq!(without_y, xz);
        }
    }

    #[test]
    fn attr_array_grows_through_boundaries() {
        let mut attrs = HCAttrs::new();
        let vals: Vec<_> = (0..10).map(box_int).collect();
        for (i, &v) in vals.iter().enumerate() {
            attrs.append(i, v);
        }
        for (i, &v) in vals.iter().enumerate() {
            assert_eq!(attrs.read(i as i32), v);
        }
        // Fake a hidden class of the right size for teardown.
        let root = HiddenClass::root();
        let mut hcls = root;
        for i in 0..10 {
            hcls = unsafe { (*hcls).get_or_make_child(intern_string(&format!("hcgrow_{}", i))) };
        }
        attrs.hcls = hcls;
        for &v in &vals {
            assert_eq!(refcnt(v), 1);
        }
        attrs.clear_for_dealloc();
    }

    #[test]
    fn singleton_invalidates_on_change() {
        let attr = intern_string("hcsing_a");
        unsafe {
            let hc = HiddenClass::make_singleton();
            (*hc).append_attribute(attr);
            assert_eq!((*hc).get_offset(attr), Some(0));
            (*hc).del_attribute(attr);
            assert_eq!((*hc).get_offset(attr), None);
        }
    }
}
