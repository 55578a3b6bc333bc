//! Bounded x86-64 instruction emitter.
//!
//! One method per instruction form the rewriter needs, nothing more. Every
//! write is bounds-checked against the buffer: running out of room sets the
//! `failed` flag and turns the remaining emits into no-ops, so callers can
//! batch a whole fast path and check for failure once at the end.

use super::types::*;

const REX_B: u8 = 1;
const REX_X: u8 = 2;
const REX_R: u8 = 4;
const REX_W: u8 = 8;

const OPCODE_ADD: u8 = 0b000;
const OPCODE_SUB: u8 = 0b101;
const OPCODE_CMP: u8 = 0b111;

pub struct Assembler {
    start: *mut u8,
    end: *mut u8,
    addr: *mut u8,
    failed: bool,
}

/// Token for a not-yet-patched short forward conditional jump.
#[must_use]
pub struct ForwardJump {
    jmp_inst_offset: usize,
}

impl Assembler {
    /// Wrap `[start, start + size)` as the output buffer. The caller keeps
    /// ownership of the memory.
    ///
    /// # Safety
    /// `start` must be valid for writes of `size` bytes for the lifetime of
    /// the assembler.
    pub unsafe fn new(start: *mut u8, size: usize) -> Assembler {
        Assembler {
            start,
            end: start.add(size),
            addr: start,
            failed: false,
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn start_addr(&self) -> *mut u8 {
        self.start
    }

    pub fn size(&self) -> usize {
        self.end as usize - self.start as usize
    }

    pub fn bytes_written(&self) -> usize {
        self.addr as usize - self.start as usize
    }

    pub fn bytes_left(&self) -> usize {
        self.end as usize - self.addr as usize
    }

    pub fn cur_inst_pointer(&self) -> *mut u8 {
        self.addr
    }

    /// Reposition the write cursor (used when re-patching jump sites inside
    /// an already-committed slot).
    pub fn set_cur_inst_pointer(&mut self, ptr: *mut u8) {
        debug_assert!(ptr >= self.start && ptr <= self.end);
        self.addr = ptr;
    }

    pub fn is_exactly_full(&self) -> bool {
        self.addr == self.end
    }

    /// Assembly-time annotation; shows up in trace logs only.
    pub fn comment(&mut self, msg: &str) {
        log::trace!("asm @{:#x}+{}: {}", self.start as usize, self.bytes_written(), msg);
    }

    // Byte-level primitives.

    fn emit_byte(&mut self, b: u8) {
        if self.failed {
            return;
        }
        if self.addr >= self.end {
            self.failed = true;
            return;
        }
        unsafe {
            self.addr.write(b);
            self.addr = self.addr.add(1);
        }
    }

    fn emit_int(&mut self, n: i64, bytes: usize) {
        let mut v = n as u64;
        for _ in 0..bytes {
            self.emit_byte((v & 0xff) as u8);
            v >>= 8;
        }
    }

    fn emit_rex(&mut self, rex: u8) {
        self.emit_byte(0x40 | rex);
    }

    fn emit_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        debug_assert!(mode < 4 && reg < 8 && rm < 8);
        self.emit_byte((mode << 6) | (reg << 3) | rm);
    }

    fn emit_sib(&mut self, scalebits: u8, index: u8, base: u8) {
        debug_assert!(scalebits < 4 && index < 8 && base < 8);
        self.emit_byte((scalebits << 6) | (index << 3) | base);
    }

    /// ModRM + optional SIB + displacement for a `[base + offset]` operand.
    fn emit_mem_operand(&mut self, reg_field: u8, mem: Indirect) {
        let base_low = mem.base.regnum() & 7;
        let need_sib = base_low == 0b100; // RSP/R12 as base always take a SIB
        // RBP/R13 as base cannot use mod=00, which means [rip+disp] instead.
        let mode = if mem.offset == 0 && base_low != 0b101 {
            0
        } else if (-128..128).contains(&mem.offset) {
            1
        } else {
            2
        };

        self.emit_modrm(mode, reg_field, if need_sib { 0b100 } else { base_low });
        if need_sib {
            self.emit_sib(0, 0b100, base_low);
        }
        match mode {
            0 => {}
            1 => self.emit_int(mem.offset as i64, 1),
            _ => self.emit_int(mem.offset as i64, 4),
        }
    }

    fn rex_for(&self, w: bool, reg_field: u8, rm_or_base: u8) -> u8 {
        let mut rex = 0;
        if w {
            rex |= REX_W;
        }
        if reg_field >= 8 {
            rex |= REX_R;
        }
        if rm_or_base >= 8 {
            rex |= REX_B;
        }
        rex
    }

    // Simple instructions.

    pub fn nop(&mut self) {
        self.emit_byte(0x90);
    }

    pub fn trap(&mut self) {
        self.emit_byte(0xcc);
    }

    pub fn ret(&mut self) {
        self.emit_byte(0xc3);
    }

    pub fn leave(&mut self) {
        self.emit_byte(0xc9);
    }

    // Data movement.

    /// Move an immediate into a register. Uses the 4-byte zero-extending
    /// form when the value permits, unless `force_64bit_load`.
    pub fn mov_imm(&mut self, imm: Immediate, dest: Register, force_64bit_load: bool) {
        let use_64 = force_64bit_load || !imm.fits_u32();
        let b = dest.regnum();
        if use_64 {
            self.emit_rex(self.rex_for(true, 0, b));
            self.emit_byte(0xb8 + (b & 7));
            self.emit_int(imm.0 as i64, 8);
        } else {
            if b >= 8 {
                self.emit_rex(REX_B);
            }
            self.emit_byte(0xb8 + (b & 7));
            self.emit_int(imm.0 as i64, 4);
        }
    }

    /// 64-bit store of a sign-extended 32-bit immediate.
    pub fn movq_imm_mem(&mut self, imm: Immediate, dest: Indirect) {
        assert!(imm.fits_i32());
        self.emit_rex(self.rex_for(true, 0, dest.base.regnum()));
        self.emit_byte(0xc7);
        self.emit_mem_operand(0, dest);
        self.emit_int(imm.0 as i64, 4);
    }

    pub fn mov_reg_reg(&mut self, src: Register, dest: Register) {
        self.emit_rex(self.rex_for(true, src.regnum(), dest.regnum()));
        self.emit_byte(0x89);
        self.emit_modrm(0b11, src.regnum() & 7, dest.regnum() & 7);
    }

    pub fn mov_reg_mem(&mut self, src: Register, dest: Indirect) {
        self.emit_rex(self.rex_for(true, src.regnum(), dest.base.regnum()));
        self.emit_byte(0x89);
        self.emit_mem_operand(src.regnum() & 7, dest);
    }

    pub fn mov_mem_reg(&mut self, src: Indirect, dest: Register) {
        self.mov_generic(src, dest, MovType::Q);
    }

    /// Memory-to-register move with explicit width/extension.
    pub fn mov_generic(&mut self, src: Indirect, dest: Register, ty: MovType) {
        let r = dest.regnum();
        let b = src.base.regnum();
        let (w, opcode): (bool, &[u8]) = match ty {
            MovType::Q => (true, &[0x8b]),
            MovType::L => (false, &[0x8b]),
            MovType::B => (false, &[0x8a]),
            MovType::Zbl => (false, &[0x0f, 0xb6]),
            MovType::Sbl => (false, &[0x0f, 0xbe]),
            MovType::Zwl => (false, &[0x0f, 0xb7]),
            MovType::Swl => (false, &[0x0f, 0xbf]),
            MovType::Zbq => (true, &[0x0f, 0xb6]),
            MovType::Sbq => (true, &[0x0f, 0xbe]),
            MovType::Zwq => (true, &[0x0f, 0xb7]),
            MovType::Swq => (true, &[0x0f, 0xbf]),
            MovType::Slq => (true, &[0x63]),
        };
        let rex = self.rex_for(w, r, b);
        if rex != 0 {
            self.emit_rex(rex);
        }
        for &op in opcode {
            self.emit_byte(op);
        }
        self.emit_mem_operand(r & 7, src);
    }

    pub fn movsd_xmm_xmm(&mut self, src: XMMRegister, dest: XMMRegister) {
        // movsd dest, src: F2 0F 10 /r with reg=dest, rm=src
        self.emit_byte(0xf2);
        let rex = self.rex_for(false, dest.regnum(), src.regnum());
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x10);
        self.emit_modrm(0b11, dest.regnum() & 7, src.regnum() & 7);
    }

    pub fn movsd_xmm_mem(&mut self, src: XMMRegister, dest: Indirect) {
        self.emit_byte(0xf2);
        let rex = self.rex_for(false, src.regnum(), dest.base.regnum());
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x11);
        self.emit_mem_operand(src.regnum() & 7, dest);
    }

    pub fn movsd_mem_xmm(&mut self, src: Indirect, dest: XMMRegister) {
        self.emit_byte(0xf2);
        let rex = self.rex_for(false, dest.regnum(), src.base.regnum());
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x10);
        self.emit_mem_operand(dest.regnum() & 7, src);
    }

    pub fn movss_mem_xmm(&mut self, src: Indirect, dest: XMMRegister) {
        self.emit_byte(0xf3);
        let rex = self.rex_for(false, dest.regnum(), src.base.regnum());
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x10);
        self.emit_mem_operand(dest.regnum() & 7, src);
    }

    pub fn cvtss2sd(&mut self, src: XMMRegister, dest: XMMRegister) {
        self.emit_byte(0xf3);
        let rex = self.rex_for(false, dest.regnum(), src.regnum());
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x5a);
        self.emit_modrm(0b11, dest.regnum() & 7, src.regnum() & 7);
    }

    /// `xor r32, r32` — the canonical register clear; zero-extends.
    pub fn clear_reg(&mut self, reg: Register) {
        let r = reg.regnum();
        let rex = self.rex_for(false, r, r);
        if rex != 0 {
            self.emit_rex(rex);
        }
        self.emit_byte(0x31);
        self.emit_modrm(0b11, r & 7, r & 7);
    }

    pub fn push(&mut self, reg: Register) {
        if reg.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0x50 + (reg.regnum() & 7));
    }

    pub fn pop(&mut self, reg: Register) {
        if reg.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0x58 + (reg.regnum() & 7));
    }

    // Arithmetic.

    fn emit_arith_imm(&mut self, imm: Immediate, reg: Register, opcode: u8) {
        assert!(imm.fits_i32(), "large immediates go through a scratch register");
        self.emit_rex(self.rex_for(true, 0, reg.regnum()));
        if imm.fits_i8() {
            self.emit_byte(0x83);
            self.emit_modrm(0b11, opcode, reg.regnum() & 7);
            self.emit_int(imm.0 as i64, 1);
        } else {
            self.emit_byte(0x81);
            self.emit_modrm(0b11, opcode, reg.regnum() & 7);
            self.emit_int(imm.0 as i64, 4);
        }
    }

    pub fn add_imm(&mut self, imm: Immediate, reg: Register) {
        self.emit_arith_imm(imm, reg, OPCODE_ADD);
    }

    pub fn sub_imm(&mut self, imm: Immediate, reg: Register) {
        self.emit_arith_imm(imm, reg, OPCODE_SUB);
    }

    pub fn cmp_reg_imm(&mut self, reg: Register, imm: Immediate) {
        self.emit_arith_imm(imm, reg, OPCODE_CMP);
    }

    /// Flags of `reg1 - reg2`.
    pub fn cmp_reg_reg(&mut self, reg1: Register, reg2: Register) {
        // CMP r/m64, r64 with rm=reg1, reg=reg2
        self.emit_rex(self.rex_for(true, reg2.regnum(), reg1.regnum()));
        self.emit_byte(0x39);
        self.emit_modrm(0b11, reg2.regnum() & 7, reg1.regnum() & 7);
    }

    /// Flags of `[mem] - imm` (64-bit compare).
    pub fn cmp_mem_imm(&mut self, mem: Indirect, imm: Immediate) {
        assert!(imm.fits_i32());
        self.emit_rex(self.rex_for(true, 0, mem.base.regnum()));
        if imm.fits_i8() {
            self.emit_byte(0x83);
            self.emit_mem_operand(OPCODE_CMP, mem);
            self.emit_int(imm.0 as i64, 1);
        } else {
            self.emit_byte(0x81);
            self.emit_mem_operand(OPCODE_CMP, mem);
            self.emit_int(imm.0 as i64, 4);
        }
    }

    /// Flags of `[mem] - reg`.
    pub fn cmp_mem_reg(&mut self, mem: Indirect, reg: Register) {
        self.emit_rex(self.rex_for(true, reg.regnum(), mem.base.regnum()));
        self.emit_byte(0x39);
        self.emit_mem_operand(reg.regnum() & 7, mem);
    }

    /// 32-bit increment of a memory location.
    pub fn incl(&mut self, mem: Indirect) {
        if mem.base.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0xff);
        self.emit_mem_operand(0, mem);
    }

    /// 32-bit decrement of a memory location.
    pub fn decl(&mut self, mem: Indirect) {
        if mem.base.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0xff);
        self.emit_mem_operand(1, mem);
    }

    /// 32-bit increment of an absolute (low 4 GiB) address.
    pub fn incl_addr(&mut self, addr: Immediate) {
        assert!(addr.fits_i32());
        self.emit_byte(0xff);
        // mod=00 rm=100 with SIB base=101: [disp32] absolute
        self.emit_modrm(0, 0, 0b100);
        self.emit_sib(0, 0b100, 0b101);
        self.emit_int(addr.0 as i64, 4);
    }

    /// 32-bit decrement of an absolute (low 4 GiB) address.
    pub fn decl_addr(&mut self, addr: Immediate) {
        assert!(addr.fits_i32());
        self.emit_byte(0xff);
        self.emit_modrm(0, 1, 0b100);
        self.emit_sib(0, 0b100, 0b101);
        self.emit_int(addr.0 as i64, 4);
    }

    pub fn lea(&mut self, mem: Indirect, reg: Register) {
        self.emit_rex(self.rex_for(true, reg.regnum(), mem.base.regnum()));
        self.emit_byte(0x8d);
        self.emit_mem_operand(reg.regnum() & 7, mem);
    }

    pub fn test(&mut self, reg1: Register, reg2: Register) {
        // TEST r/m64, r64 with rm=reg1, reg=reg2
        self.emit_rex(self.rex_for(true, reg2.regnum(), reg1.regnum()));
        self.emit_byte(0x85);
        self.emit_modrm(0b11, reg2.regnum() & 7, reg1.regnum() & 7);
    }

    // Control flow.

    /// `call` with a rel32 displacement, relative to the next instruction
    /// as the hardware counts it. The caller computes the displacement
    /// against the address the code will run at.
    pub fn call_rel32(&mut self, rel: i32) {
        self.emit_byte(0xe8);
        self.emit_int(rel as i64, 4);
    }

    pub fn callq(&mut self, reg: Register) {
        if reg.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0xff);
        self.emit_modrm(0b11, 2, reg.regnum() & 7);
    }

    pub fn jmp(&mut self, dest: JumpDestination) {
        let source = self.bytes_written() as i64;
        let offset = dest.offset_from_start - (source + 2);
        if (-0x80..0x80).contains(&offset) {
            self.emit_byte(0xeb);
            self.emit_int(offset, 1);
        } else {
            let offset = dest.offset_from_start - (source + 5);
            assert!((i32::MIN as i64..=i32::MAX as i64).contains(&offset));
            self.emit_byte(0xe9);
            self.emit_int(offset, 4);
        }
    }

    pub fn jmp_mem(&mut self, dest: Indirect) {
        if dest.base.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0xff);
        self.emit_mem_operand(4, dest);
    }

    pub fn jmpq(&mut self, dest: Register) {
        if dest.regnum() >= 8 {
            self.emit_rex(REX_B);
        }
        self.emit_byte(0xff);
        self.emit_modrm(0b11, 4, dest.regnum() & 7);
    }

    pub fn jmp_cond(&mut self, dest: JumpDestination, condition: ConditionCode) {
        let cc = condition as u8;
        let source = self.bytes_written() as i64;
        let offset = dest.offset_from_start - (source + 2);
        if (-0x80..0x80).contains(&offset) {
            self.emit_byte(0x70 | cc);
            self.emit_int(offset, 1);
        } else {
            let offset = dest.offset_from_start - (source + 6);
            assert!((i32::MIN as i64..=i32::MAX as i64).contains(&offset));
            self.emit_byte(0x0f);
            self.emit_byte(0x80 | cc);
            self.emit_int(offset, 4);
        }
    }

    pub fn je(&mut self, dest: JumpDestination) {
        self.jmp_cond(dest, ConditionCode::Equal);
    }

    pub fn jne(&mut self, dest: JumpDestination) {
        self.jmp_cond(dest, ConditionCode::NotEqual);
    }

    /// Set an 8-bit register to 0/1 from a condition. Callers are expected
    /// to have cleared the full register beforehand.
    pub fn set_cond(&mut self, reg: Register, condition: ConditionCode) {
        let r = reg.regnum();
        if r >= 8 {
            self.emit_rex(REX_B);
        } else if r >= 4 {
            // Plain REX selects SPL/BPL/SIL/DIL instead of AH..BH.
            self.emit_rex(0);
        }
        self.emit_byte(0x0f);
        self.emit_byte(0x90 | condition as u8);
        self.emit_modrm(0b11, 0, r & 7);
    }

    pub fn sete(&mut self, reg: Register) {
        self.set_cond(reg, ConditionCode::Equal);
    }

    pub fn setne(&mut self, reg: Register) {
        self.set_cond(reg, ConditionCode::NotEqual);
    }

    pub fn setnz(&mut self, reg: Register) {
        self.setne(reg);
    }

    // Short forward jumps patched after the fact.

    pub fn begin_forward_jump(&mut self, condition: ConditionCode) -> ForwardJump {
        let jmp_inst_offset = self.bytes_written();
        self.emit_byte(0x70 | condition as u8);
        self.emit_byte(0); // patched by end_forward_jump
        ForwardJump { jmp_inst_offset }
    }

    pub fn end_forward_jump(&mut self, jump: ForwardJump) {
        if self.failed {
            return;
        }
        let distance = self.bytes_written() - (jump.jmp_inst_offset + 2);
        if distance >= 0x80 {
            // rel8 can't reach; treat like running out of space.
            self.failed = true;
            return;
        }
        unsafe {
            self.start.add(jump.jmp_inst_offset + 1).write(distance as u8);
        }
    }

    // Macros.

    /// Load a 64-bit target into `scratch` and call it. Returns the address
    /// following the call (the call's return address).
    pub fn emit_call(&mut self, func_addr: usize, scratch: Register) -> *mut u8 {
        self.mov_imm(Immediate(func_addr as u64), scratch, true);
        self.callq(scratch);
        self.cur_inst_pointer()
    }

    /// Spill a group of registers to consecutive scratch slots at
    /// `[base + scratch_offset ..]`.
    pub fn emit_batch_push(
        &mut self,
        base: Register,
        scratch_offset: i32,
        scratch_size: usize,
        regs: &[GenericRegister],
    ) {
        let mut offset = 0i32;
        for &reg in regs {
            let dest = Indirect::new(base, scratch_offset + offset);
            assert!((offset as usize) < scratch_size);
            match reg {
                GenericRegister::Gp(r) => self.mov_reg_mem(r, dest),
                GenericRegister::Xmm(x) => self.movsd_xmm_mem(x, dest),
            }
            offset += 8;
        }
    }

    /// Reload a group of registers spilled by `emit_batch_push`.
    pub fn emit_batch_pop(
        &mut self,
        base: Register,
        scratch_offset: i32,
        scratch_size: usize,
        regs: &[GenericRegister],
    ) {
        let mut offset = 0i32;
        for &reg in regs {
            let src = Indirect::new(base, scratch_offset + offset);
            assert!((offset as usize) < scratch_size);
            match reg {
                GenericRegister::Gp(r) => self.mov_mem_reg(src, r),
                GenericRegister::Xmm(x) => self.movsd_mem_xmm(src, x),
            }
            offset += 8;
        }
    }

    /// Pad to the end of the buffer exactly.
    pub fn fill_with_nops(&mut self) {
        while !self.failed && self.addr < self.end {
            self.nop();
        }
    }

    /// Pad until exactly `bytes` remain.
    pub fn fill_with_nops_except(&mut self, bytes: usize) {
        while !self.failed && self.bytes_left() > bytes {
            self.nop();
        }
    }

    pub fn skip_bytes(&mut self, num: usize) {
        if self.failed {
            return;
        }
        if self.bytes_left() < num {
            self.failed = true;
            self.addr = self.end;
            return;
        }
        self.addr = unsafe { self.addr.add(num) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut asm = unsafe { Assembler::new(buf.as_mut_ptr(), buf.len()) };
        f(&mut asm);
        assert!(!asm.has_failed());
        let n = asm.bytes_written();
        buf.truncate(n);
        buf
    }

    #[test]
    fn mov_reg_reg_encoding() {
        assert_eq!(assemble(|a| a.mov_reg_reg(RAX, RDI)), [0x48, 0x89, 0xc7]);
        assert_eq!(assemble(|a| a.mov_reg_reg(R11, RAX)), [0x4c, 0x89, 0xd8]);
    }

    #[test]
    fn mov_mem_encodings() {
        // mov r8, [rdi+0x10]
        assert_eq!(
            assemble(|a| a.mov_generic(Indirect::new(RDI, 0x10), R8, MovType::Q)),
            [0x4c, 0x8b, 0x47, 0x10]
        );
        // mov [rsp+8], rax (SIB required)
        assert_eq!(
            assemble(|a| a.mov_reg_mem(RAX, Indirect::new(RSP, 8))),
            [0x48, 0x89, 0x44, 0x24, 0x08]
        );
        // mov rax, [rbp] needs an explicit disp8 of 0
        assert_eq!(
            assemble(|a| a.mov_mem_reg(Indirect::new(RBP, 0), RAX)),
            [0x48, 0x8b, 0x45, 0x00]
        );
        // movzx eax, byte [rdi]
        assert_eq!(
            assemble(|a| a.mov_generic(Indirect::new(RDI, 0), RAX, MovType::Zbl)),
            [0x0f, 0xb6, 0x07]
        );
        // movsxd rax, dword [rdi]
        assert_eq!(
            assemble(|a| a.mov_generic(Indirect::new(RDI, 0), RAX, MovType::Slq)),
            [0x48, 0x63, 0x07]
        );
    }

    #[test]
    fn mov_imm_width_selection() {
        // 32-bit form zero-extends
        assert_eq!(assemble(|a| a.mov_imm(Immediate(42), RAX, false)), [0xb8, 42, 0, 0, 0]);
        // values with high bits force movabs
        assert_eq!(
            assemble(|a| a.mov_imm(Immediate(0x1122334455667788), R11, false)),
            [0x49, 0xbb, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // forced 64-bit of a small value
        assert_eq!(
            assemble(|a| a.mov_imm(Immediate(1), RAX, true)),
            [0x48, 0xb8, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn arith_encodings() {
        assert_eq!(assemble(|a| a.sub_imm(Immediate(0x28), RSP)), [0x48, 0x83, 0xec, 0x28]);
        assert_eq!(assemble(|a| a.add_imm(Immediate(0x28), RSP)), [0x48, 0x83, 0xc4, 0x28]);
        assert_eq!(assemble(|a| a.cmp_reg_imm(RDI, Immediate(0x10))), [0x48, 0x83, 0xff, 0x10]);
        // cmp [rdi+8], rax
        assert_eq!(
            assemble(|a| a.cmp_mem_reg(Indirect::new(RDI, 8), RAX)),
            [0x48, 0x39, 0x47, 0x08]
        );
        // test rax, rax
        assert_eq!(assemble(|a| a.test(RAX, RAX)), [0x48, 0x85, 0xc0]);
        // xor ecx, ecx
        assert_eq!(assemble(|a| a.clear_reg(RCX)), [0x31, 0xc9]);
    }

    #[test]
    fn control_flow_encodings() {
        assert_eq!(assemble(|a| a.callq(R11)), [0x41, 0xff, 0xd3]);
        assert_eq!(assemble(|a| a.ret()), [0xc3]);
        // jmp forward by 0x10 from offset 0: short form, rel = 0x10 - 2
        assert_eq!(assemble(|a| a.jmp(JumpDestination::from_start(0x10))), [0xeb, 0x0e]);
        // jne to offset 0x20 from offset 0
        assert_eq!(assemble(|a| a.jne(JumpDestination::from_start(0x20))), [0x75, 0x1e]);
        // long jump
        assert_eq!(
            assemble(|a| a.jmp(JumpDestination::from_start(0x1000))),
            [0xe9, 0xfb, 0x0f, 0x00, 0x00]
        );
        assert_eq!(assemble(|a| a.sete(RAX)), [0x0f, 0x94, 0xc0]);
        // setne dil needs a bare REX
        assert_eq!(assemble(|a| a.setne(RDI)), [0x40, 0x0f, 0x95, 0xc7]);
    }

    #[test]
    fn incdec_encodings() {
        assert_eq!(assemble(|a| a.incl(Indirect::new(RAX, 0))), [0xff, 0x00]);
        assert_eq!(assemble(|a| a.decl(Indirect::new(RAX, 0))), [0xff, 0x08]);
        assert_eq!(
            assemble(|a| a.incl_addr(Immediate(0x1000))),
            [0xff, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn lea_encoding() {
        assert_eq!(
            assemble(|a| a.lea(Indirect::new(RSP, 0x20), RDI)),
            [0x48, 0x8d, 0x7c, 0x24, 0x20]
        );
    }

    #[test]
    fn movsd_encodings() {
        // movsd xmm0, [rdi+8]
        assert_eq!(
            assemble(|a| a.movsd_mem_xmm(Indirect::new(RDI, 8), XMM0)),
            [0xf2, 0x0f, 0x10, 0x47, 0x08]
        );
        // movsd [rsp], xmm1
        assert_eq!(
            assemble(|a| a.movsd_xmm_mem(XMM1, Indirect::new(RSP, 0))),
            [0xf2, 0x0f, 0x11, 0x0c, 0x24]
        );
    }

    #[test]
    fn overflow_sets_failed_without_writing() {
        let mut buf = [0u8; 2];
        let mut asm = unsafe { Assembler::new(buf.as_mut_ptr(), buf.len()) };
        asm.nop();
        asm.nop();
        assert!(!asm.has_failed());
        asm.nop();
        assert!(asm.has_failed());
        assert_eq!(asm.bytes_written(), 2);
        assert_eq!(buf, [0x90, 0x90]);
    }

    #[test]
    fn fill_with_nops_is_exact() {
        let mut buf = [0u8; 16];
        let mut asm = unsafe { Assembler::new(buf.as_mut_ptr(), buf.len()) };
        asm.ret();
        asm.fill_with_nops();
        assert!(asm.is_exactly_full());
        assert_eq!(asm.bytes_written(), 16);
    }

    #[test]
    fn forward_jump_patches_distance() {
        let bytes = assemble(|a| {
            let j = a.begin_forward_jump(ConditionCode::NotEqual);
            a.nop();
            a.nop();
            a.end_forward_jump(j);
        });
        assert_eq!(bytes, [0x75, 0x02, 0x90, 0x90]);
    }

    #[test]
    fn emit_call_shape() {
        let bytes = assemble(|a| {
            a.emit_call(0x11223344, R11);
        });
        assert_eq!(
            bytes,
            [0x49, 0xbb, 0x44, 0x33, 0x22, 0x11, 0, 0, 0, 0, 0x41, 0xff, 0xd3]
        );
    }
}
