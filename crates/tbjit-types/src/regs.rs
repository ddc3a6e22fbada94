//! Virtual register bank layout and the helper calling convention.
//!
//! The bank is a flat array of 32-bit slots in shared linear memory. Register `i` lives at
//! `bank_base + i * REG_BYTES`. The interpreter, every compiled block, and the runtime bridge all
//! address registers through [`reg_offset`].

use std::fmt;

pub const NUM_REGS: usize = 16;

/// Size of one register slot in bytes.
pub const REG_BYTES: u32 = 4;

pub const BANK_SIZE: u32 = NUM_REGS as u32 * REG_BYTES;

/// A virtual register index, always `< NUM_REGS`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const R0: Reg = Reg(0);
    pub const R1: Reg = Reg(1);
    pub const R2: Reg = Reg(2);
    pub const R3: Reg = Reg(3);
    pub const R4: Reg = Reg(4);
    pub const R5: Reg = Reg(5);

    pub const fn new(index: u8) -> Option<Reg> {
        if (index as usize) < NUM_REGS {
            Some(Reg(index))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn bit(self) -> u16 {
        1 << self.0
    }

    pub fn all() -> impl Iterator<Item = Reg> {
        (0..NUM_REGS as u8).map(Reg)
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Holds the shared context (`env`) pointer. Compiled blocks write it on entry.
pub const REG_ENV: Reg = Reg(14);

/// Holds the temp-stack pointer. Compiled blocks write it on entry.
pub const REG_CALL_STACK: Reg = Reg(15);

/// Registers passed to a helper call, in argument order.
///
/// Argument slot [`CALL_RESERVED_SLOT`] sits between `r3` and `r5`. It is always passed as zero
/// and never carries a live value.
pub const CALL_ARG_REGS: [Reg; 10] = [
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(5),
    Reg(6),
    Reg(7),
    Reg(8),
    Reg(9),
    Reg(10),
];

/// Position of the reserved argument slot in the full 11-slot helper argument list.
pub const CALL_RESERVED_SLOT: usize = 4;

/// Low half of a helper's 64-bit result.
pub const CALL_RET_LO: Reg = Reg(0);
/// High half of a helper's 64-bit result.
pub const CALL_RET_HI: Reg = Reg(1);

/// Byte offset of `reg` from the bank base.
#[inline]
pub const fn reg_offset(reg: Reg) -> u32 {
    reg.0 as u32 * REG_BYTES
}

/// In-memory image of the register bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterBank {
    pub regs: [u32; NUM_REGS],
}

impl RegisterBank {
    pub fn get(&self, reg: Reg) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set(&mut self, reg: Reg, value: u32) {
        self.regs[reg.index()] = value;
    }
}

const _: () = {
    assert!(NUM_REGS <= 16, "register masks are u16");
    assert!(std::mem::size_of::<RegisterBank>() == BANK_SIZE as usize);
    assert!(REG_ENV.index() < NUM_REGS && REG_CALL_STACK.index() < NUM_REGS);
};
