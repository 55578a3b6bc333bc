//! Patchpoint initialization: carving a compiler-reserved byte range into
//! the patchable region plus the slow-path call sequence.
//!
//! The slow-path call sequence also publishes its own return address into
//! a thread-local handoff slot right before the call. Generic entry
//! points `take()` the slot on entry and use it to find their IC; a call
//! that did not come through a patchpoint finds the slot empty and simply
//! never rewrites.

use std::cell::Cell;

use crate::asm::{self, Assembler, GenericRegister, Immediate, JumpDestination};
use crate::error::RuntimeError;
use crate::mem::flush_instruction_cache;

/// Bytes of the publish-return-address + load-target + call sequence:
/// two `movabs` (10 each), one reg->mem store (3), one `movabs` (10) and
/// an indirect call (3).
pub const INITIAL_CALL_SIZE: usize = 36;

thread_local! {
    static IC_RETURN_ADDR: Cell<usize> = const { Cell::new(0) };
}

/// Consume the published call-site return address, if any. Every dispatch
/// entry point calls this exactly once, first thing.
pub fn take_ic_return_addr() -> *const u8 {
    IC_RETURN_ADDR.with(|slot| slot.replace(0)) as *const u8
}

fn ic_return_addr_slot() -> usize {
    IC_RETURN_ADDR.with(|slot| slot as *const Cell<usize> as usize)
}

/// Result of initializing one patchpoint.
pub struct PatchpointInitializationInfo {
    pub slowpath_start: *mut u8,
    pub slowpath_rtn_addr: *mut u8,
    pub continue_addr: *mut u8,
    pub live_outs: Vec<u8>,
}

/// Metadata the tiered compiler records per patchpoint for the stackmap
/// consumer.
#[derive(Debug, Clone)]
pub struct PatchpointInfo {
    pub scratch_rsp_offset: i32,
    pub scratch_size: usize,
    pub num_frame_vars: usize,
    pub is_deopt: bool,
}

/// Emit the slow-path call sequence at the assembler's cursor. Returns
/// the call's return address (in final memory).
fn emit_slowpath_call(assem: &mut Assembler, slowpath_func: usize) -> *mut u8 {
    let seq_start = assem.cur_inst_pointer() as usize;
    let rtn_addr = seq_start + INITIAL_CALL_SIZE;

    assem.mov_imm(Immediate(ic_return_addr_slot() as u64), asm::R10, true);
    assem.mov_imm(Immediate(rtn_addr as u64), asm::R11, true);
    assem.mov_reg_mem(asm::R11, asm::Indirect::new(asm::R10, 0));
    assem.mov_imm(Immediate(slowpath_func as u64), asm::R11, true);
    assem.callq(asm::R11);

    debug_assert!(assem.has_failed() || assem.cur_inst_pointer() as usize == rtn_addr);
    rtn_addr as *mut u8
}

/// Initialize the byte range `[start_addr, end_addr)`: a patchable region
/// that jumps straight to the slow-path call sequence at the end, with
/// caller-saved live-out registers spilled around the call.
///
/// # Safety
/// The range must be writable and executable and reserved for this
/// patchpoint.
pub unsafe fn initialize_patchpoint(
    slowpath_func: usize,
    start_addr: *mut u8,
    end_addr: *mut u8,
    scratch_offset: i32,
    scratch_size: usize,
    live_outs: Vec<u8>,
) -> Result<PatchpointInitializationInfo, RuntimeError> {
    assert!(start_addr < end_addr);

    let mut est_slowpath_size = INITIAL_CALL_SIZE;
    let mut regs_to_spill: Vec<GenericRegister> = Vec::new();
    let mut kept_live_outs: Vec<u8> = Vec::new();

    for &dwarf_regnum in &live_outs {
        let ru = GenericRegister::from_dwarf(dwarf_regnum);

        if let GenericRegister::Gp(r) = ru {
            assert!(r != asm::R10 && r != asm::R11, "r10/r11 are assumed free");
            if r == asm::RSP || r.is_callee_save() {
                kept_live_outs.push(dwarf_regnum);
                continue;
            }
        }

        kept_live_outs.push(dwarf_regnum);
        regs_to_spill.push(ru);
        est_slowpath_size += match ru {
            GenericRegister::Gp(_) => 14,  // mov to/from a disp8/32 slot, twice
            GenericRegister::Xmm(_) => 18, // movsd to/from, twice
        };
    }

    if regs_to_spill.len() * 8 > scratch_size {
        return Err(RuntimeError::BadPatchpoint(
            "not enough scratch space to spill live-outs",
        ));
    }

    let total = end_addr as usize - start_addr as usize;
    if total < est_slowpath_size {
        return Err(RuntimeError::PatchpointTooSmall {
            needed: est_slowpath_size,
            have: total,
        });
    }
    let slowpath_start = end_addr.sub(est_slowpath_size);

    // The patchable region starts life as a jump over itself.
    let patchable_size = slowpath_start as usize - start_addr as usize;
    let mut header = Assembler::new(start_addr, patchable_size);
    if patchable_size > 20 {
        header.jmp(JumpDestination::from_start(patchable_size as i64));
    }
    header.fill_with_nops();
    assert!(!header.has_failed());

    let mut assem = Assembler::new(slowpath_start, est_slowpath_size);
    assem.emit_batch_push(asm::RSP, scratch_offset, scratch_size.max(1), &regs_to_spill);
    let slowpath_rtn_addr = emit_slowpath_call(&mut assem, slowpath_func);
    assem.emit_batch_pop(asm::RSP, scratch_offset, scratch_size.max(1), &regs_to_spill);
    assem.fill_with_nops();
    assert!(!assem.has_failed());

    flush_instruction_cache(start_addr, total);

    Ok(PatchpointInitializationInfo {
        slowpath_start,
        slowpath_rtn_addr,
        continue_addr: end_addr,
        live_outs: kept_live_outs,
    })
}

/// Re-point an already-initialized patchpoint's slow-path call at a
/// different function (used to switch exception styles).
///
/// # Safety
/// `seq_addr` must be the start of a sequence produced by
/// `emit_slowpath_call`.
pub unsafe fn set_slowpath_func(seq_addr: *mut u8, func: usize) {
    // movabs r11, imm64 at the target-load position:
    debug_assert_eq!(seq_addr.add(23).read(), 0x49);
    debug_assert_eq!(seq_addr.add(24).read(), 0xbb);
    // callq *%r11 at the tail:
    debug_assert_eq!(seq_addr.add(33).read(), 0x41);
    debug_assert_eq!(seq_addr.add(34).read(), 0xff);
    debug_assert_eq!(seq_addr.add(35).read(), 0xd3);

    (seq_addr.add(25) as *mut u64).write_unaligned(func as u64);
    flush_instruction_cache(seq_addr, INITIAL_CALL_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_addr_slot_starts_empty() {
        assert!(take_ic_return_addr().is_null());
    }

    #[test]
    fn slowpath_call_sequence_is_exactly_sized() {
        let mut buf = vec![0u8; INITIAL_CALL_SIZE];
        let mut assem = unsafe { Assembler::new(buf.as_mut_ptr(), buf.len()) };
        emit_slowpath_call(&mut assem, 0x1122334455667788);
        assert!(!assem.has_failed());
        assert!(assem.is_exactly_full());
        // movabs r10 / movabs r11 / mov [r10], r11 / movabs r11 / call r11
        assert_eq!(buf[0], 0x49);
        assert_eq!(buf[1], 0xba);
        assert_eq!(&buf[20..23], &[0x4d, 0x89, 0x1a]);
        assert_eq!(buf[23], 0x49);
        assert_eq!(buf[24], 0xbb);
        assert_eq!(&buf[33..36], &[0x41, 0xff, 0xd3]);
    }
}
