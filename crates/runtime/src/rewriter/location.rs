//! Abstract value locations used by the rewriter.

use crate::asm;
use crate::asm::{GenericRegister, Register, XMMRegister};

/// Where a rewriter variable currently lives.
///
/// `Scratch` offsets index the patchpoint's rsp-relative scratch area;
/// `Stack` offsets index the caller's stack-argument area. `AnyReg`,
/// `None` and `Uninitialized` are request/placeholder values, never stored
/// in a variable's location set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Register(Register),
    Xmm(XMMRegister),
    Scratch(i32),
    Stack(i32),
    AnyReg,
    None,
    Uninitialized,
}

impl Location {
    pub fn any() -> Location {
        Location::AnyReg
    }

    /// Location of the i-th argument under the SysV calling convention.
    pub fn for_arg(argnum: usize) -> Location {
        match argnum {
            0 => Location::Register(asm::RDI),
            1 => Location::Register(asm::RSI),
            2 => Location::Register(asm::RDX),
            3 => Location::Register(asm::RCX),
            4 => Location::Register(asm::R8),
            5 => Location::Register(asm::R9),
            n => Location::Stack(((n - 6) * 8) as i32),
        }
    }

    pub fn as_register(self) -> Register {
        match self {
            Location::Register(r) => r,
            other => panic!("not a GP register location: {:?}", other),
        }
    }

    pub fn as_xmm_register(self) -> XMMRegister {
        match self {
            Location::Xmm(r) => r,
            other => panic!("not an XMM register location: {:?}", other),
        }
    }

    pub fn is_clobbered_by_call(self) -> bool {
        match self {
            Location::Register(r) => !r.is_callee_save(),
            Location::Xmm(_) => true,
            Location::Scratch(_) | Location::Stack(_) => false,
            other => panic!("no call-clobber class for {:?}", other),
        }
    }
}

impl From<GenericRegister> for Location {
    fn from(gr: GenericRegister) -> Location {
        match gr {
            GenericRegister::Gp(r) => Location::Register(r),
            GenericRegister::Xmm(r) => Location::Xmm(r),
        }
    }
}

impl From<Register> for Location {
    fn from(r: Register) -> Location {
        Location::Register(r)
    }
}

impl From<XMMRegister> for Location {
    fn from(r: XMMRegister) -> Location {
        Location::Xmm(r)
    }
}

pub const N_SCRATCH_SLOTS: usize = 32;
pub const N_STACK_SLOTS: usize = 16;

/// Dense map from concrete locations to values; the transpose of every
/// variable's location set.
pub struct LocMap<T> {
    regs: [Option<T>; Register::num_regs()],
    xmms: [Option<T>; XMMRegister::num_regs()],
    scratch: [Option<T>; N_SCRATCH_SLOTS],
    stack: [Option<T>; N_STACK_SLOTS],
}

impl<T: Copy + PartialEq> LocMap<T> {
    pub fn new() -> LocMap<T> {
        LocMap {
            regs: [None; Register::num_regs()],
            xmms: [None; XMMRegister::num_regs()],
            scratch: [None; N_SCRATCH_SLOTS],
            stack: [None; N_STACK_SLOTS],
        }
    }

    fn slot(&self, l: Location) -> &Option<T> {
        match l {
            Location::Register(r) => &self.regs[r.regnum() as usize],
            Location::Xmm(r) => &self.xmms[r.regnum() as usize],
            Location::Scratch(off) => {
                assert!(off >= 0 && (off as usize / 8) < N_SCRATCH_SLOTS, "scratch offset {}", off);
                &self.scratch[off as usize / 8]
            }
            Location::Stack(off) => {
                assert!(off >= 0 && (off as usize / 8) < N_STACK_SLOTS, "stack offset {}", off);
                &self.stack[off as usize / 8]
            }
            other => panic!("not a concrete location: {:?}", other),
        }
    }

    fn slot_mut(&mut self, l: Location) -> &mut Option<T> {
        match l {
            Location::Register(r) => &mut self.regs[r.regnum() as usize],
            Location::Xmm(r) => &mut self.xmms[r.regnum() as usize],
            Location::Scratch(off) => {
                assert!(off >= 0 && (off as usize / 8) < N_SCRATCH_SLOTS, "scratch offset {}", off);
                &mut self.scratch[off as usize / 8]
            }
            Location::Stack(off) => {
                assert!(off >= 0 && (off as usize / 8) < N_STACK_SLOTS, "stack offset {}", off);
                &mut self.stack[off as usize / 8]
            }
            other => panic!("not a concrete location: {:?}", other),
        }
    }

    pub fn get(&self, l: Location) -> Option<T> {
        *self.slot(l)
    }

    pub fn contains(&self, l: Location) -> bool {
        self.slot(l).is_some()
    }

    pub fn insert(&mut self, l: Location, v: T) {
        let slot = self.slot_mut(l);
        assert!(slot.is_none(), "location {:?} already occupied", l);
        *slot = Some(v);
    }

    pub fn erase(&mut self, l: Location) {
        *self.slot_mut(l) = None;
    }

    /// All `(location, value)` pairs; slow, for invariant checks.
    pub fn entries(&self) -> Vec<(Location, T)> {
        let mut out = Vec::new();
        for (i, v) in self.regs.iter().enumerate() {
            if let Some(v) = v {
                out.push((Location::Register(Register(i as u8)), *v));
            }
        }
        for (i, v) in self.xmms.iter().enumerate() {
            if let Some(v) = v {
                out.push((Location::Xmm(XMMRegister(i as u8)), *v));
            }
        }
        for (i, v) in self.scratch.iter().enumerate() {
            if let Some(v) = v {
                out.push((Location::Scratch((i * 8) as i32), *v));
            }
        }
        for (i, v) in self.stack.iter().enumerate() {
            if let Some(v) = v {
                out.push((Location::Stack((i * 8) as i32), *v));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_locations_follow_sysv() {
        assert_eq!(Location::for_arg(0), Location::Register(asm::RDI));
        assert_eq!(Location::for_arg(3), Location::Register(asm::RCX));
        assert_eq!(Location::for_arg(6), Location::Stack(0));
        assert_eq!(Location::for_arg(8), Location::Stack(16));
    }

    #[test]
    fn locmap_round_trip() {
        let mut m: LocMap<u32> = LocMap::new();
        m.insert(Location::Register(asm::RAX), 1);
        m.insert(Location::Scratch(16), 2);
        assert_eq!(m.get(Location::Register(asm::RAX)), Some(1));
        assert!(m.contains(Location::Scratch(16)));
        m.erase(Location::Register(asm::RAX));
        assert!(!m.contains(Location::Register(asm::RAX)));
        assert_eq!(m.entries().len(), 1);
    }
}
