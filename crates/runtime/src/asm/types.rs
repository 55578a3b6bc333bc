//! Register and operand model for the x86-64 emitter.

/// General-purpose register, numbered by x86 encoding (RAX=0 .. R15=15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(pub u8);

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

impl Register {
    pub const fn num_regs() -> usize {
        16
    }

    pub fn regnum(self) -> u8 {
        self.0
    }

    /// Callee-saved under the SysV AMD64 ABI.
    pub fn is_callee_save(self) -> bool {
        matches!(self, RBX | RBP | RSP | R12 | R13 | R14 | R15)
    }

    /// x86-64 DWARF register number (used in live-out sets).
    pub fn to_dwarf(self) -> u8 {
        const TO_DWARF: [u8; 16] = [0, 2, 1, 3, 7, 6, 4, 5, 8, 9, 10, 11, 12, 13, 14, 15];
        TO_DWARF[self.0 as usize]
    }

    pub fn from_dwarf(dwarf: u8) -> Register {
        const FROM_DWARF: [u8; 16] = [0, 2, 1, 3, 6, 7, 5, 4, 8, 9, 10, 11, 12, 13, 14, 15];
        assert!(dwarf < 16, "not a GP dwarf register: {}", dwarf);
        Register(FROM_DWARF[dwarf as usize])
    }
}

/// SSE register XMM0..XMM15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XMMRegister(pub u8);

pub const XMM0: XMMRegister = XMMRegister(0);
pub const XMM1: XMMRegister = XMMRegister(1);
pub const XMM2: XMMRegister = XMMRegister(2);

impl XMMRegister {
    pub const fn num_regs() -> usize {
        16
    }

    pub fn regnum(self) -> u8 {
        self.0
    }

    /// DWARF numbers XMM0..XMM15 as 17..32.
    pub fn to_dwarf(self) -> u8 {
        self.0 + 17
    }

    pub fn from_dwarf(dwarf: u8) -> XMMRegister {
        assert!((17..=32).contains(&dwarf), "not an XMM dwarf register: {}", dwarf);
        XMMRegister(dwarf - 17)
    }
}

/// Either kind of machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericRegister {
    Gp(Register),
    Xmm(XMMRegister),
}

impl GenericRegister {
    pub fn from_dwarf(dwarf: u8) -> GenericRegister {
        if dwarf < 16 {
            GenericRegister::Gp(Register::from_dwarf(dwarf))
        } else {
            GenericRegister::Xmm(XMMRegister::from_dwarf(dwarf))
        }
    }

    pub fn to_dwarf(self) -> u8 {
        match self {
            GenericRegister::Gp(r) => r.to_dwarf(),
            GenericRegister::Xmm(r) => r.to_dwarf(),
        }
    }
}

/// Immediate operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Immediate(pub u64);

impl Immediate {
    pub fn fits_i8(self) -> bool {
        (self.0 as i64) >= i8::MIN as i64 && (self.0 as i64) <= i8::MAX as i64
    }

    pub fn fits_i32(self) -> bool {
        (self.0 as i64) >= i32::MIN as i64 && (self.0 as i64) <= i32::MAX as i64
    }

    /// Whether a plain 32-bit `mov` (which zero-extends) reproduces the value.
    pub fn fits_u32(self) -> bool {
        self.0 >> 32 == 0
    }
}

/// `[base + offset]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indirect {
    pub base: Register,
    pub offset: i32,
}

impl Indirect {
    pub fn new(base: Register, offset: i32) -> Indirect {
        Indirect { base, offset }
    }
}

/// A jump target expressed as an offset from the start of the assembler's
/// buffer. Relative displacements are computed at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpDestination {
    pub offset_from_start: i64,
}

impl JumpDestination {
    pub fn from_start(offset: i64) -> JumpDestination {
        JumpDestination {
            offset_from_start: offset,
        }
    }
}

/// x86 condition codes, numbered by their encoding in `Jcc`/`SETcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    Overflow = 0,
    NotOverflow = 1,
    Below = 2,
    NotBelow = 3,
    Equal = 4,
    NotEqual = 5,
    NotAbove = 6,
    Above = 7,
    Sign = 8,
    NotSign = 9,
    ParityEven = 0xa,
    ParityOdd = 0xb,
    Less = 0xc,
    NotLess = 0xd,
    NotGreater = 0xe,
    Greater = 0xf,
}

/// Width/extension selector for memory-to-register moves.
///
/// `ZLQ` is the same operation as `L`: a 32-bit load already zero-extends
/// into the full register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovType {
    Q,
    L,
    B,
    Zbl,
    Sbl,
    Zwl,
    Swl,
    Zbq,
    Sbq,
    Zwq,
    Swq,
    Slq,
}

impl MovType {
    pub const ZLQ: MovType = MovType::L;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dwarf_round_trip() {
        for n in 0..16u8 {
            let r = Register(n);
            assert_eq!(Register::from_dwarf(r.to_dwarf()), r);
            let x = XMMRegister(n);
            assert_eq!(XMMRegister::from_dwarf(x.to_dwarf()), x);
        }
        assert_eq!(Register::from_dwarf(6), RBP);
        assert_eq!(Register::from_dwarf(7), RSP);
        assert_eq!(Register::from_dwarf(5), RDI);
        assert_eq!(Register::from_dwarf(4), RSI);
    }

    #[test]
    fn callee_saves() {
        assert!(RBX.is_callee_save());
        assert!(R12.is_callee_save());
        assert!(!RAX.is_callee_save());
        assert!(!RDI.is_callee_save());
        assert!(!R11.is_callee_save());
    }
}
