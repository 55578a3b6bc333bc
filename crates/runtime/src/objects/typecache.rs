//! Type version tags and the global method-lookup cache.
//!
//! Every class with `HAVE_VERSION_TAG` can be assigned a version; MRO
//! lookups are memoized in a 1024-entry direct-mapped cache keyed by
//! `(version, name-hash)`. Any shape change bumps the class (and its
//! subclasses) off its version, purges matching cache entries, and fires
//! the class's dependent-IC invalidator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::objects::{PyClass, PyObject, PyStr, TypeFlags};

const MCACHE_SIZE_EXP: u32 = 10;
pub const MCACHE_SIZE: usize = 1 << MCACHE_SIZE_EXP;

#[derive(Debug, Clone, Copy, Default)]
struct McacheEntry {
    version: u64,
    /// Interned name pointer; 0 for an empty entry.
    name: usize,
    /// Borrowed result (may be 0 for a cached miss with a live name).
    value: usize,
}

lazy_static! {
    static ref METHOD_CACHE: Mutex<Vec<McacheEntry>> =
        Mutex::new(vec![McacheEntry::default(); MCACHE_SIZE]);
}

static NEXT_VERSION_TAG: AtomicU64 = AtomicU64::new(1);

fn mcache_hash(version: u64, name_hash: u64) -> usize {
    (version.wrapping_mul(name_hash) >> (64 - MCACHE_SIZE_EXP)) as usize
}

/// Give `cls` a valid version tag if it can have one. On counter
/// wraparound the whole cache is flushed and numbering restarts.
pub fn assign_version_tag(cls: *mut PyClass) -> bool {
    unsafe {
        if (*cls).has_feature(TypeFlags::VALID_VERSION_TAG) {
            return true;
        }
        if !(*cls).has_feature(TypeFlags::HAVE_VERSION_TAG) {
            return false;
        }
        let mut tag = NEXT_VERSION_TAG.fetch_add(1, Ordering::Relaxed);
        if tag == 0 {
            clear_cache();
            tag = NEXT_VERSION_TAG.fetch_add(1, Ordering::Relaxed);
        }
        (*cls).tp_version_tag = tag;
        (*cls).tp_flags |= TypeFlags::VALID_VERSION_TAG;
        true
    }
}

/// Consult the cache. `Some(value)` is a hit (the cached lookup result,
/// possibly null for a cached miss); `None` means fall back to the walk.
pub fn cached_lookup(cls: *mut PyClass, attr: *mut PyStr) -> Option<*mut PyObject> {
    unsafe {
        if !(*cls).has_feature(TypeFlags::VALID_VERSION_TAG) {
            return None;
        }
        let h = mcache_hash((*cls).tp_version_tag, (*attr).hash);
        let entry = METHOD_CACHE.lock().unwrap()[h];
        if entry.version == (*cls).tp_version_tag && entry.name == attr as usize {
            Some(entry.value as *mut PyObject)
        } else {
            None
        }
    }
}

/// Store a lookup result. The value is borrowed: class attribute tables
/// keep it alive, and `type_modified` purges the entry before any change
/// can invalidate that.
pub fn cache_store(cls: *mut PyClass, attr: *mut PyStr, value: *mut PyObject) {
    if !assign_version_tag(cls) {
        return;
    }
    unsafe {
        let h = mcache_hash((*cls).tp_version_tag, (*attr).hash);
        METHOD_CACHE.lock().unwrap()[h] = McacheEntry {
            version: (*cls).tp_version_tag,
            name: attr as usize,
            value: value as usize,
        };
    }
}

/// Drop every cache entry. Returns how many were occupied.
pub fn clear_cache() -> usize {
    let mut cache = METHOD_CACHE.lock().unwrap();
    let occupied = cache.iter().filter(|e| e.name != 0).count();
    cache.fill(McacheEntry::default());
    occupied
}

/// True if some cache entry carries `version` (test hook).
pub fn cache_has_version(version: u64) -> bool {
    METHOD_CACHE
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.name != 0 && e.version == version)
}

/// The class's shape changed: invalidate its version tag, purge cache
/// entries made under it, fire dependent ICs, and propagate to
/// subclasses.
pub fn type_modified(cls: *mut PyClass) {
    unsafe {
        if !(*cls).has_feature(TypeFlags::VALID_VERSION_TAG) {
            // Still fire the IC dependents: code may depend on a class
            // that never had a tag.
            (*cls).dependent_icgetattrs.invalidate_all();
            return;
        }

        let old_version = (*cls).tp_version_tag;
        (*cls).tp_flags &= !TypeFlags::VALID_VERSION_TAG;

        let mut cache = METHOD_CACHE.lock().unwrap();
        for entry in cache.iter_mut() {
            if entry.version == old_version {
                *entry = McacheEntry::default();
            }
        }
        drop(cache);

        (*cls).dependent_icgetattrs.invalidate_all();

        for &sub in (*cls).subclasses.clone().iter() {
            type_modified(sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{create_user_class, intern_string};

    // The cache tests only need classes and interned names; values are
    // arbitrary non-null pointers.
    #[test]
    fn cache_round_trip_and_invalidation() {
        let cls = create_user_class("McTest", &[]);
        let attr = intern_string("mc_attr");
        let val = intern_string("mc_val") as *mut PyObject;

        assert!(assign_version_tag(cls));
        cache_store(cls, attr, val);
        assert_eq!(cached_lookup(cls, attr), Some(val));

        let old_version = unsafe { (*cls).tp_version_tag };
        type_modified(cls);
        assert!(!cache_has_version(old_version));
        assert_eq!(cached_lookup(cls, attr), None);

        // A new tag gets assigned lazily and differs from the old one.
        assert!(assign_version_tag(cls));
        assert_ne!(unsafe { (*cls).tp_version_tag }, old_version);
    }

    #[test]
    fn subclass_invalidation_propagates() {
        let base = create_user_class("McBase", &[]);
        let child = create_user_class("McChild", &[base]);
        let attr = intern_string("mc_meth");
        let val = intern_string("mc_meth_val") as *mut PyObject;

        assign_version_tag(child);
        cache_store(child, attr, val);
        let child_version = unsafe { (*child).tp_version_tag };

        type_modified(base);
        assert!(!cache_has_version(child_version));
        assert!(unsafe { !(*child).has_feature(TypeFlags::VALID_VERSION_TAG) });
    }

    #[test]
    fn clear_cache_empties_everything() {
        let cls = create_user_class("McClear", &[]);
        let attr = intern_string("mc_clear_attr");
        cache_store(cls, attr, attr as *mut PyObject);
        assert!(clear_cache() > 0);
        assert_eq!(cached_lookup(cls, attr), None);
    }
}
