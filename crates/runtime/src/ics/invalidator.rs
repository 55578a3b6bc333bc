//! Invalidation conditions.
//!
//! An `ICInvalidator` stands for an observable assumption ("class C's
//! attribute map has not changed"). Slots that embed the assumption
//! register as dependents; when the assumption breaks, every dependent
//! slot is cleared and the invalidator's version is bumped so rewrites
//! that recorded the old version are discarded at commit.
//!
//! Invalidators and slots reference each other bidirectionally through raw
//! pointers. Neither side owns the other: on destruction of either end the
//! other side's back-pointers are scrubbed.

use crate::ics::icinfo::ICSlot;

pub struct ICInvalidator {
    cur_version: u64,
    dependents: Vec<*mut ICSlot>,
}

impl ICInvalidator {
    pub const fn new() -> ICInvalidator {
        ICInvalidator {
            cur_version: 0,
            dependents: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.cur_version
    }

    pub fn num_dependents(&self) -> usize {
        self.dependents.len()
    }

    /// Record `slot` as depending on this assumption. Idempotent per slot.
    ///
    /// # Safety
    /// `slot` must stay valid until it deregisters itself (slot clearing
    /// and `ICInfo` teardown both scrub these links).
    pub unsafe fn add_dependent(&mut self, slot: *mut ICSlot) {
        if self.dependents.contains(&slot) {
            return;
        }
        self.dependents.push(slot);
        (*slot).invalidators.push(self as *mut ICInvalidator);
    }

    /// Remove `slot` without clearing it (used from slot/IC teardown).
    pub fn remove_dependent(&mut self, slot: *mut ICSlot) {
        self.dependents.retain(|&s| s != slot);
    }

    /// The assumption broke: bump the version and clear every dependent
    /// slot. Cross-links from the cleared slots to *other* invalidators
    /// are scrubbed too, since the slots no longer hold any compiled code.
    pub fn invalidate_all(&mut self) {
        self.cur_version += 1;

        let self_ptr = self as *mut ICInvalidator;
        let dependents = std::mem::take(&mut self.dependents);
        for slot in dependents {
            unsafe {
                let mut found_self = false;
                for &inv in (*slot).invalidators.iter() {
                    if inv == self_ptr {
                        debug_assert!(!found_self);
                        found_self = true;
                    } else {
                        (*inv).remove_dependent(slot);
                    }
                }
                debug_assert!(found_self);
                (*slot).invalidators.clear();
                (*slot).clear();
            }
        }
    }
}

impl Drop for ICInvalidator {
    fn drop(&mut self) {
        let self_ptr = self as *mut ICInvalidator;
        for &slot in &self.dependents {
            unsafe {
                (*slot).invalidators.retain(|&inv| inv != self_ptr);
            }
        }
    }
}
