//! Shared vocabulary for the tbjit translator.
//!
//! Everything in here is part of the contract between the IR producer, the reference interpreter,
//! the wasm compiler, and the runtime bridge. Changing a value here changes the wire format or the
//! register-bank layout for all of them at once.

mod cond;
mod memop;
pub mod regs;

pub use cond::Cond;
pub use memop::{Endian, MemFlags, MemOp, MemSize};
pub use regs::{Reg, RegisterBank, NUM_REGS};

/// Guest IR address. Addresses are byte offsets into guest memory.
pub type Address = u32;
