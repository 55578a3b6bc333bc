//! Per-patchpoint bookkeeping: slots, rewrites, commits, invalidation.
//!
//! One `ICInfo` owns the patchable region reachable from a slow-path call
//! site. The region starts life as a single slot holding `nop; jmp
//! <slowpath>`; committed rewrites fill a slot with a guarded fast path,
//! may split off the unused tail as a fresh slot, and register the
//! invalidators the new code depends on.
//!
//! Nothing here is thread-safe beyond the registry locks: the runtime
//! executes Python on one thread at a time, and re-entry (a slow path
//! invoking user code that lands back in the same IC) is handled by the
//! `num_inside` counters, not by locking.

use std::collections::BTreeMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::asm::{self, Assembler, ConditionCode, JumpDestination, Register};
use crate::ics::invalidator::ICInvalidator;
use crate::mem::flush_instruction_cache;
use crate::objects::{decref, PyObject};
use crate::options;
use crate::rewriter::Location;
use crate::stats::StatCounter;

pub const IC_INVALIDATION_HEADER_SIZE: usize = 6;
pub const IC_MEGAMORPHIC_THRESHOLD: u32 = 100;
const MAX_RETRY_BACKOFF: u32 = 1024;

static MEGAMORPHIC_ICS: StatCounter = StatCounter::new("megamorphic_ics");

/// Calling convention of the patched call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConv {
    C,
    PreserveAll,
}

/// Scratch-region geometry the compiler reserved for this patchpoint.
#[derive(Debug, Clone, Copy)]
pub struct StackInfo {
    pub scratch_size: usize,
    pub scratch_rsp_offset: i32,
}

// Registry of decref locations keyed by instruction address, consulted by
// the unwinder when an exception crosses emitted code.
lazy_static! {
    static ref DECREF_INFOS: Mutex<BTreeMap<u64, Vec<Location>>> = Mutex::new(BTreeMap::new());
}

/// Registration handle for "if unwinding through `ip`, decref these
/// locations". Deregisters on drop.
#[derive(Debug)]
pub struct DecrefInfo {
    ip: u64,
}

impl DecrefInfo {
    pub fn new(ip: u64, locations: Vec<Location>) -> DecrefInfo {
        let prev = DECREF_INFOS.lock().unwrap().insert(ip, locations);
        debug_assert!(prev.is_none(), "duplicate decref info for ip {:#x}", ip);
        DecrefInfo { ip }
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }
}

impl Drop for DecrefInfo {
    fn drop(&mut self) {
        DECREF_INFOS.lock().unwrap().remove(&self.ip);
    }
}

/// Look up the registered decref locations covering `ip` (for tests and
/// the unwinder glue).
pub fn decref_locations_at(ip: u64) -> Option<Vec<Location>> {
    DECREF_INFOS.lock().unwrap().get(&ip).cloned()
}

/// One specialized variant within an IC's patchable region.
pub struct ICSlot {
    pub ic: *mut ICInfo,
    pub start_addr: *mut u8,
    pub size: usize,
    /// Stack frames currently executing inside this slot. Incremented
    /// either by a rewrite in progress or by the emitted `incl`/`decl`
    /// bracket of a side-effecting fast path.
    pub num_inside: i32,
    pub used: bool,
    /// Owned references embedded in the slot's code.
    pub gc_references: Vec<*mut PyObject>,
    pub decref_infos: Vec<DecrefInfo>,
    pub invalidators: Vec<*mut ICInvalidator>,
}

impl ICSlot {
    fn new(ic: *mut ICInfo, start_addr: *mut u8, size: usize) -> Box<ICSlot> {
        Box::new(ICSlot {
            ic,
            start_addr,
            size,
            num_inside: 0,
            used: false,
            gc_references: Vec::new(),
            decref_infos: Vec::new(),
            invalidators: Vec::new(),
        })
    }

    /// Overwrite with the invalidation header and release what can be
    /// released. Called both from invalidators and from slot reuse.
    pub unsafe fn clear(&mut self) {
        (*self.ic).clear_slot(self as *mut ICSlot);
    }

    /// Drop embedded references if no frame is inside; keeps them
    /// otherwise (the frame still runs code that mentions them).
    pub fn release_refs_if_quiescent(&mut self) {
        if self.num_inside > 0 {
            return;
        }
        for p in self.gc_references.drain(..) {
            unsafe { decref(p) };
        }
        self.decref_infos.clear();
    }
}

/// Conditional jumps to the end of the slot, recorded during emission so
/// they can be re-targeted if the slot shrinks on commit:
/// `(jmp_inst_offset, jmp_inst_end, condition)`.
pub type NextSlotJumpInfo = (usize, usize, ConditionCode);

/// Outcome of an attempted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A dependency changed between recording and commit; bytes dropped.
    DependencyInvalidated,
}

/// An in-progress rewrite of one slot: a scratch buffer the size of the
/// slot plus the assembler over it. Holds `num_inside` on the slot so no
/// second rewriter (or invalidation-time release) touches it.
pub struct ICSlotRewrite {
    ic: *mut ICInfo,
    entry: *mut ICSlot,
    debug_name: &'static str,
    buf: Vec<u8>,
    asm: Assembler,
    dependencies: Vec<(*mut ICInvalidator, u64)>,
}

impl ICSlotRewrite {
    fn new(ic: *mut ICInfo, entry: *mut ICSlot, debug_name: &'static str) -> ICSlotRewrite {
        let size = unsafe { (*entry).size };
        let mut buf = vec![0u8; size];
        let mut asm = unsafe { Assembler::new(buf.as_mut_ptr(), size) };
        unsafe {
            assert_eq!((*entry).num_inside, 0);
            (*entry).num_inside += 1;
        }
        // Every fast path leads with a nop, same as the invalidation
        // header, so the first byte is always patchable.
        asm.nop();
        log::trace!("starting {} icentry", debug_name);
        ICSlotRewrite {
            ic,
            entry,
            debug_name,
            buf,
            asm,
            dependencies: Vec::new(),
        }
    }

    pub fn assembler(&mut self) -> &mut Assembler {
        &mut self.asm
    }

    pub fn debug_name(&self) -> &'static str {
        self.debug_name
    }

    pub fn ic(&self) -> *mut ICInfo {
        self.ic
    }

    pub fn picked_slot(&self) -> *mut ICSlot {
        self.entry
    }

    pub fn slot_size(&self) -> usize {
        unsafe { (*self.entry).size }
    }

    pub fn slot_start(&self) -> *mut u8 {
        unsafe { (*self.entry).start_addr }
    }

    pub fn scratch_size(&self) -> usize {
        unsafe { (*self.ic).stack_info.scratch_size }
    }

    pub fn scratch_rsp_offset(&self) -> i32 {
        unsafe { (*self.ic).stack_info.scratch_rsp_offset }
    }

    pub fn return_register(&self) -> Option<Register> {
        unsafe { (*self.ic).return_register }
    }

    /// Record that the new code assumes `invalidator` stays at its current
    /// version.
    pub fn add_dependence_on(&mut self, invalidator: &mut ICInvalidator) {
        self.dependencies
            .push((invalidator as *mut ICInvalidator, invalidator.version()));
    }

    /// Back off: the rewrite could not be completed.
    pub fn abort(&mut self) {
        let ic = unsafe { &mut *self.ic };
        ic.retry_backoff = (2 * ic.retry_backoff).min(MAX_RETRY_BACKOFF);
        ic.retry_in = ic.retry_backoff;
    }

    /// Install the assembled bytes. `fastpath_size` is the number of bytes
    /// written before NOP padding; the assembler must have been filled to
    /// exactly the slot size.
    pub fn commit(
        &mut self,
        fastpath_size: usize,
        gc_references: Vec<*mut PyObject>,
        decref_infos: Vec<(u64, Vec<Location>)>,
        next_slot_jumps: &[NextSlotJumpInfo],
    ) -> CommitOutcome {
        let mut still_valid = true;
        for &(invalidator, version) in &self.dependencies {
            if unsafe { (*invalidator).version() } != version {
                still_valid = false;
                break;
            }
        }
        if !still_valid {
            log::debug!(
                "not committing {} icentry since a dependency got updated before commit",
                self.debug_name
            );
            for p in gc_references {
                unsafe { decref(p) };
            }
            return CommitOutcome::DependencyInvalidated;
        }

        let entry = unsafe { &mut *self.entry };
        assert_eq!(entry.num_inside, 1, "picked IC slot is somehow used again");

        assert!(!self.asm.has_failed());
        assert!(self.asm.is_exactly_full());
        let original_size = entry.size;
        let actual_size = fastpath_size;
        assert!(actual_size <= original_size);
        let empty_space = original_size - actual_size;

        for &(invalidator, _) in &self.dependencies {
            unsafe { (*invalidator).add_dependent(self.entry) };
        }

        let ic = unsafe { &mut *self.ic };
        ic.next_slot_to_try += 1;

        // A new slot can be split off if this is the last slot of the IC
        // and the leftover tail is at least as big as what we used.
        let is_last_slot = ic.slots.last().map(|s| s.as_ref() as *const ICSlot)
            == Some(self.entry as *const ICSlot);
        let should_create_new_slot = is_last_slot && empty_space >= actual_size && actual_size > 0;
        if should_create_new_slot {
            entry.size = actual_size;

            // The jumps to "end of slot" were encoded against the old
            // boundary; re-aim them at the new one (inside the scratch
            // buffer, before the copy below).
            for &(jmp_inst_offset, jmp_inst_end, condition) in next_slot_jumps {
                let mut patcher = unsafe { Assembler::new(self.buf.as_mut_ptr(), original_size) };
                patcher.set_cur_inst_pointer(unsafe { self.buf.as_mut_ptr().add(jmp_inst_offset) });
                patcher.jmp_cond(JumpDestination::from_start(actual_size as i64), condition);
                // Shorter encodings leave a gap up to the old instruction end.
                while (patcher.cur_inst_pointer() as usize - self.buf.as_ptr() as usize) < jmp_inst_end {
                    patcher.nop();
                }
                assert!(!patcher.has_failed());
            }

            // The new slot opens with a jump straight to the slow path.
            {
                let mut next_slot_asm = unsafe {
                    Assembler::new(self.buf.as_mut_ptr().add(actual_size), empty_space)
                };
                next_slot_asm.jmp(JumpDestination::from_start(empty_space as i64));
                assert!(!next_slot_asm.has_failed());
            }

            let new_start = unsafe { entry.start_addr.add(actual_size) };
            ic.slots.push(ICSlot::new(self.ic, new_start, empty_space));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.buf.as_ptr(), entry.start_addr, original_size);
        }

        for p in entry.gc_references.drain(..) {
            unsafe { decref(p) };
        }
        entry.gc_references = gc_references;
        entry.used = true;
        ic.times_rewritten += 1;

        if ic.times_rewritten == IC_MEGAMORPHIC_THRESHOLD {
            MEGAMORPHIC_ICS.log();
        }

        entry.decref_infos.clear();
        for (ip, mut locations) in decref_infos {
            locations.extend(ic.ic_global_decref_locations.iter().copied());
            if locations.is_empty() {
                continue;
            }
            entry.decref_infos.push(DecrefInfo::new(ip, locations));
        }

        flush_instruction_cache(entry.start_addr, original_size);
        CommitOutcome::Committed
    }
}

impl Drop for ICSlotRewrite {
    fn drop(&mut self) {
        unsafe {
            (*self.entry).num_inside -= 1;
        }
    }
}

pub struct ICInfo {
    pub start_addr: *mut u8,
    pub slowpath_start_addr: *mut u8,
    pub continue_addr: *mut u8,
    pub slowpath_rtn_addr: *mut u8,
    slots: Vec<Box<ICSlot>>,
    // Round-robin eviction cursor. Round-robin is probably a bunch worse
    // than LRU, but also a bunch better than always evicting slot 0.
    next_slot_to_try: usize,
    pub stack_info: StackInfo,
    pub calling_conv: CallingConv,
    pub live_outs: Vec<u8>,
    pub return_register: Option<Register>,
    retry_in: u32,
    retry_backoff: u32,
    times_rewritten: u32,
    ic_global_decref_locations: Vec<Location>,
    slowpath_decref_info: Option<DecrefInfo>,
}

impl ICInfo {
    pub fn times_rewritten(&self) -> u32 {
        self.times_rewritten
    }

    pub fn is_megamorphic(&self) -> bool {
        self.times_rewritten >= IC_MEGAMORPHIC_THRESHOLD
    }

    pub fn percent_megamorphic(&self) -> u32 {
        self.times_rewritten * 100 / IC_MEGAMORPHIC_THRESHOLD
    }

    pub fn percent_backedoff(&self) -> u32 {
        self.retry_backoff
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&mut self, idx: usize) -> *mut ICSlot {
        self.slots[idx].as_mut() as *mut ICSlot
    }

    /// Whether a rewrite should even be attempted right now. Decrements
    /// the back-off counter as a side effect.
    pub fn should_attempt(&mut self) -> bool {
        if self.retry_in > 0 {
            self.retry_in -= 1;
            return false;
        }
        !self.is_megamorphic() && options::ics_enabled()
    }

    pub fn start_rewrite(&mut self, debug_name: &'static str) -> Option<ICSlotRewrite> {
        let self_ptr = self as *mut ICInfo;
        let entry = self.pick_entry_for_rewrite(debug_name)?;
        Some(ICSlotRewrite::new(self_ptr, entry, debug_name))
    }

    /// Round-robin slot selection: prefer a never-used slot, fall back to
    /// a used one nobody is inside, give up if everything is occupied.
    fn pick_entry_for_rewrite(&mut self, debug_name: &'static str) -> Option<*mut ICSlot> {
        let num_slots = self.slots.len();
        let mut fallback_to_in_use_slot = None;

        for i in 0..num_slots {
            let idx = (i + self.next_slot_to_try) % num_slots;
            let sinfo = &mut self.slots[idx];
            debug_assert!(sinfo.num_inside >= 0);

            if sinfo.num_inside > 0 || sinfo.size == 0 {
                continue;
            }

            // An invalidated slot may still be carrying references that
            // could not be dropped while a frame was inside.
            sinfo.release_refs_if_quiescent();

            if sinfo.used {
                if fallback_to_in_use_slot.is_none() {
                    fallback_to_in_use_slot = Some(idx);
                }
                continue;
            }

            log::trace!("picking {} icentry to unused slot {}", debug_name, idx);
            self.next_slot_to_try = idx;
            return Some(self.slots[idx].as_mut() as *mut ICSlot);
        }

        if let Some(idx) = fallback_to_in_use_slot {
            log::trace!("picking {} icentry to in-use slot {}", debug_name, idx);
            self.next_slot_to_try = idx;
            return Some(self.slots[idx].as_mut() as *mut ICSlot);
        }

        log::trace!("no slot available for {} icentry", debug_name);
        None
    }

    /// Overwrite `slot` with the invalidation header (`nop; jmp <end>`)
    /// and mark it reusable. Embedded references are released only once no
    /// frame is inside.
    pub fn clear_slot(&mut self, slot: *mut ICSlot) {
        let slot_ref = unsafe { &mut *slot };
        log::trace!(
            "clearing patchpoint {:p}, slot at {:p}",
            self.start_addr,
            slot_ref.start_addr
        );

        let mut writer = unsafe { Assembler::new(slot_ref.start_addr, slot_ref.size) };
        writer.nop();
        writer.jmp(JumpDestination::from_start(slot_ref.size as i64));
        assert!(writer.bytes_written() <= IC_INVALIDATION_HEADER_SIZE);

        slot_ref.release_refs_if_quiescent();

        flush_instruction_cache(slot_ref.start_addr, slot_ref.size);

        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.as_ref() as *const ICSlot == slot as *const ICSlot)
        {
            self.next_slot_to_try = idx;
        }

        slot_ref.used = false;
    }

    pub fn clear_all(&mut self) {
        for i in 0..self.slots.len() {
            let slot = self.slots[i].as_mut() as *mut ICSlot;
            self.clear_slot(slot);
        }
    }

    /// How big the compiler should make the next version of this
    /// patchpoint, based on how the current one has been used.
    pub fn calculate_suggested_size(&self) -> usize {
        const ADDITIONAL_SPACE_PER_SLOT: usize = 30;
        const MAX_SIZE: usize = 4096;

        // Never rewritten: keep whatever we have.
        if self.times_rewritten == 0 {
            return self.slots[0].size;
        }

        // Fewer rewrites than slots: the used prefix is an accurate bound.
        if (self.times_rewritten as usize) < self.slots.len() {
            let mut size = 0;
            for slot in self.slots.iter().take(self.times_rewritten as usize) {
                size += slot.size + ADDITIONAL_SPACE_PER_SLOT;
            }
            return size;
        }

        let total: usize = self.slots.iter().map(|s| s.size).sum();
        let scaled = if self.is_megamorphic() { total * 4 } else { total * 2 };
        scaled.min(MAX_SIZE)
    }

    pub fn append_decref_infos_to(&mut self, dest: &mut Vec<DecrefInfo>) {
        if let Some(info) = self.slowpath_decref_info.take() {
            dest.push(info);
        }
        for slot in &mut self.slots {
            dest.append(&mut slot.decref_infos);
        }
    }
}

impl Drop for ICInfo {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let slot_ptr = slot.as_mut() as *mut ICSlot;
            for &inv in slot.invalidators.iter() {
                unsafe { (*inv).remove_dependent(slot_ptr) };
            }
            slot.invalidators.clear();
            slot.num_inside = 0;
            slot.release_refs_if_quiescent();
        }
    }
}

// Process-wide registry: slow-path return address -> IC.
lazy_static! {
    static ref ICS_BY_RETURN_ADDR: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());
}

/// Owning handle for a registered patchpoint's IC. Deregisters and frees
/// on drop.
pub struct ICHandle {
    ic: *mut ICInfo,
}

impl ICHandle {
    pub fn get(&self) -> *mut ICInfo {
        self.ic
    }
}

impl Drop for ICHandle {
    fn drop(&mut self) {
        unsafe {
            let ic = &mut *self.ic;
            ic.clear_all();
            ICS_BY_RETURN_ADDR
                .lock()
                .unwrap()
                .remove(&(ic.slowpath_rtn_addr as usize));
            drop(Box::from_raw(self.ic));
        }
    }
}

/// Install the initial stub into a compiler-reserved patchable region and
/// register the IC under the slow path's return address.
///
/// # Safety
/// The address range must be valid, writable and executable, and laid out
/// as described: `patchable_size` bytes of patchable region at
/// `start_addr`, followed by the slow-path call sequence ending at
/// `slowpath_rtn_addr`.
pub unsafe fn register_compiled_patchpoint(
    start_addr: *mut u8,
    slowpath_start_addr: *mut u8,
    continue_addr: *mut u8,
    slowpath_rtn_addr: *mut u8,
    patchable_size: usize,
    calling_conv: CallingConv,
    stack_info: StackInfo,
    mut live_outs: Vec<u8>,
    has_return_value: bool,
    ic_global_decref_locations: Vec<Location>,
) -> ICHandle {
    assert!(slowpath_start_addr as usize - start_addr as usize >= patchable_size);
    assert!(slowpath_rtn_addr > slowpath_start_addr);

    let mut return_register = None;
    if has_return_value {
        const DWARF_RAX: u8 = 0;
        // The return value may go unused, in which case the caller did not
        // list RAX as a live-out; either way it is ours to produce.
        live_outs.retain(|&r| r != DWARF_RAX);
        return_register = Some(asm::RAX);
    }

    // Initial contents: a nop and an unconditional jump to the slow path.
    let mut writer = Assembler::new(start_addr, patchable_size);
    writer.nop();
    writer.jmp(JumpDestination::from_start(
        slowpath_start_addr as i64 - start_addr as i64,
    ));
    assert!(!writer.has_failed());
    flush_instruction_cache(start_addr, patchable_size);

    let slowpath_decref_info = if !ic_global_decref_locations.is_empty() {
        Some(DecrefInfo::new(
            slowpath_rtn_addr as u64,
            ic_global_decref_locations.clone(),
        ))
    } else {
        None
    };

    let mut ic = Box::new(ICInfo {
        start_addr,
        slowpath_start_addr,
        continue_addr,
        slowpath_rtn_addr,
        slots: Vec::new(),
        next_slot_to_try: 0,
        stack_info,
        calling_conv,
        live_outs,
        return_register,
        retry_in: 0,
        retry_backoff: 1,
        times_rewritten: 0,
        ic_global_decref_locations,
        slowpath_decref_info,
    });
    let ic_ptr = ic.as_mut() as *mut ICInfo;
    ic.slots.push(ICSlot::new(ic_ptr, start_addr, patchable_size));

    let ic_ptr = Box::into_raw(ic);
    let prev = ICS_BY_RETURN_ADDR
        .lock()
        .unwrap()
        .insert(slowpath_rtn_addr as usize, ic_ptr as usize);
    assert!(prev.is_none(), "patchpoint registered twice");

    ICHandle { ic: ic_ptr }
}

/// IC lookup by the return address a slow path will return to.
pub fn get_ic_info(rtn_addr: *const u8) -> Option<*mut ICInfo> {
    ICS_BY_RETURN_ADDR
        .lock()
        .unwrap()
        .get(&(rtn_addr as usize))
        .map(|&p| p as *mut ICInfo)
}

/// Clear every registered IC (refcount debugging aid).
pub fn clear_all_ics() {
    let ics: Vec<usize> = ICS_BY_RETURN_ADDR.lock().unwrap().values().copied().collect();
    for ic in ics {
        unsafe { (*(ic as *mut ICInfo)).clear_all() };
    }
}
