//! Machine state seen by the interpreter and the compiler front-end.
//!
//! The register bank, guest memory, and the helper table are owned by whoever implements
//! [`Machine`]. In a full system that is the wasm backend, so interpreted and compiled code share
//! one bank. [`FlatMachine`] is a plain in-memory implementation.

use tbjit_types::{Address, Endian, MemOp, MemSize, Reg, RegisterBank};
use thiserror::Error;

/// Byte-level read access to IR held in guest memory.
pub trait CodeBus {
    /// Returns `None` when `addr` is outside readable memory.
    fn read_u8(&self, addr: Address) -> Option<u8>;

    #[must_use]
    fn fetch(&self, addr: Address, len: u32) -> Option<Vec<u8>> {
        (0..len)
            .map(|i| self.read_u8(addr.checked_add(i)?))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest access of {len} bytes at {addr:#x} is out of bounds")]
pub struct MemFault {
    pub addr: Address,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HelperFault {
    #[error("no helper registered at index {0}")]
    Unknown(u32),
    #[error("helper {index} raised: {message}")]
    Raised { index: u32, message: String },
}

/// A helper callable from IR via `call`.
///
/// Receives the full shared memory and the ten call-convention argument words.
pub type HelperFn = Box<dyn FnMut(&mut [u8], [u32; 10]) -> Result<u64, HelperFault>>;

pub trait Machine: CodeBus {
    fn reg(&self, reg: Reg) -> u32;
    fn set_reg(&mut self, reg: Reg, value: u32);

    /// Context-relative access used by `ld*`/`st*`. Never routed through the bridge.
    fn host_load(&self, addr: Address, size: MemSize) -> Result<u32, MemFault>;
    fn host_store(&mut self, addr: Address, size: MemSize, value: u32) -> Result<(), MemFault>;

    /// Raw guest load. The result is zero-extended; callers apply `op.extend` afterwards.
    fn guest_load(&mut self, addr: Address, op: MemOp, retaddr: Address) -> Result<u64, MemFault>;
    fn guest_store(
        &mut self,
        addr: Address,
        op: MemOp,
        value: u64,
        retaddr: Address,
    ) -> Result<(), MemFault>;

    fn call_helper(&mut self, func: u32, args: [u32; 10]) -> Result<u64, HelperFault>;
}

/// Read `size` bytes at `addr` in the given byte order.
pub fn read_sized(mem: &[u8], addr: Address, size: MemSize, endian: Endian) -> Result<u64, MemFault> {
    let len = size.bytes();
    let bytes = slice(mem, addr, len)?;
    let mut v = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        let shift = match endian {
            Endian::Little => i,
            Endian::Big => len as usize - 1 - i,
        };
        v |= (*b as u64) << (shift * 8);
    }
    Ok(v)
}

/// Write the low `size` bytes of `value` at `addr` in the given byte order.
pub fn write_sized(
    mem: &mut [u8],
    addr: Address,
    size: MemSize,
    endian: Endian,
    value: u64,
) -> Result<(), MemFault> {
    let len = size.bytes();
    let bytes = slice_mut(mem, addr, len)?;
    for (i, b) in bytes.iter_mut().enumerate() {
        let shift = match endian {
            Endian::Little => i,
            Endian::Big => len as usize - 1 - i,
        };
        *b = (value >> (shift * 8)) as u8;
    }
    Ok(())
}

fn slice(mem: &[u8], addr: Address, len: u32) -> Result<&[u8], MemFault> {
    let start = addr as usize;
    start
        .checked_add(len as usize)
        .and_then(|end| mem.get(start..end))
        .ok_or(MemFault { addr, len })
}

fn slice_mut(mem: &mut [u8], addr: Address, len: u32) -> Result<&mut [u8], MemFault> {
    let start = addr as usize;
    start
        .checked_add(len as usize)
        .and_then(|end| mem.get_mut(start..end))
        .ok_or(MemFault { addr, len })
}

/// Flat byte-array machine: one memory for code, context, and guest data, plus a separate bank.
pub struct FlatMachine {
    pub mem: Vec<u8>,
    pub bank: RegisterBank,
    helpers: Vec<HelperFn>,
}

impl FlatMachine {
    pub fn new(mem_size: usize) -> Self {
        Self {
            mem: vec![0; mem_size],
            bank: RegisterBank::default(),
            helpers: Vec::new(),
        }
    }

    pub fn load_code(&mut self, addr: Address, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn register_helper(
        &mut self,
        f: impl FnMut(&mut [u8], [u32; 10]) -> Result<u64, HelperFault> + 'static,
    ) -> u32 {
        self.helpers.push(Box::new(f));
        (self.helpers.len() - 1) as u32
    }
}

impl CodeBus for FlatMachine {
    fn read_u8(&self, addr: Address) -> Option<u8> {
        self.mem.get(addr as usize).copied()
    }
}

impl Machine for FlatMachine {
    fn reg(&self, reg: Reg) -> u32 {
        self.bank.get(reg)
    }

    fn set_reg(&mut self, reg: Reg, value: u32) {
        self.bank.set(reg, value);
    }

    fn host_load(&self, addr: Address, size: MemSize) -> Result<u32, MemFault> {
        read_sized(&self.mem, addr, size, Endian::Little).map(|v| v as u32)
    }

    fn host_store(&mut self, addr: Address, size: MemSize, value: u32) -> Result<(), MemFault> {
        write_sized(&mut self.mem, addr, size, Endian::Little, value as u64)
    }

    fn guest_load(&mut self, addr: Address, op: MemOp, _retaddr: Address) -> Result<u64, MemFault> {
        read_sized(&self.mem, addr, op.size, op.endian())
    }

    fn guest_store(
        &mut self,
        addr: Address,
        op: MemOp,
        value: u64,
        _retaddr: Address,
    ) -> Result<(), MemFault> {
        write_sized(&mut self.mem, addr, op.size, op.endian(), value)
    }

    fn call_helper(&mut self, func: u32, args: [u32; 10]) -> Result<u64, HelperFault> {
        let helper = self
            .helpers
            .get_mut(func as usize)
            .ok_or(HelperFault::Unknown(func))?;
        helper(&mut self.mem, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_access_honors_endianness() {
        let mut mem = vec![0u8; 16];
        write_sized(&mut mem, 4, MemSize::U32, Endian::Big, 0x1122_3344).unwrap();
        assert_eq!(&mem[4..8], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(
            read_sized(&mem, 4, MemSize::U32, Endian::Little).unwrap(),
            0x4433_2211
        );
        assert_eq!(read_sized(&mem, 4, MemSize::U16, Endian::Big).unwrap(), 0x1122);
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let mem = vec![0u8; 8];
        assert_eq!(
            read_sized(&mem, 6, MemSize::U32, Endian::Little),
            Err(MemFault { addr: 6, len: 4 })
        );
        assert!(read_sized(&mem, u32::MAX, MemSize::U64, Endian::Little).is_err());
    }

    #[test]
    fn flat_machine_reports_unknown_helpers() {
        let mut m = FlatMachine::new(64);
        let idx = m.register_helper(|_, args| Ok(u64::from(args[0]) + 1));
        assert_eq!(m.call_helper(idx, [41; 10]), Ok(42));
        assert_eq!(m.call_helper(idx + 1, [0; 10]), Err(HelperFault::Unknown(idx + 1)));
    }
}
