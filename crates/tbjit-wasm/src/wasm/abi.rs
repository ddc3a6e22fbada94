use tbjit_types::{Address, Endian, MemSize};

/// Module name for all imports required by compiled blocks.
pub const IMPORT_MODULE: &str = "env";

/// Imported linear memory holding guest RAM, the register bank, the context area and the temp
/// stack.
pub const IMPORT_MEMORY: &str = "memory";

/// Export name of the single function in every compiled module.
///
/// Signature: `block(entry: i32, env: i32, sp: i32, depth: i32) -> i64`.
pub const EXPORT_BLOCK_FN: &str = "block";

pub const WASM_PAGE_SIZE: u32 = 65_536;

/// Maximum number of 64KiB pages in a wasm32 linear memory (4GiB).
pub const WASM32_MAX_PAGES: u32 = 65_536;

/// Set in a block result to mark a tail-dispatch; the low 32 bits carry the target.
pub const TAIL_DISPATCH_FLAG: i64 = 1 << 32;

/// Block result meaning "the exception flag was raised; abort this block".
pub const ABORT_SENTINEL_I64: i64 = -1;

/// Decoded return value of a compiled block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReturn {
    Exit(u32),
    TailDispatch(Address),
    Abort,
}

impl BlockReturn {
    pub fn encode(self) -> i64 {
        match self {
            BlockReturn::Exit(code) => i64::from(code),
            BlockReturn::TailDispatch(target) => TAIL_DISPATCH_FLAG | i64::from(target),
            BlockReturn::Abort => ABORT_SENTINEL_I64,
        }
    }

    /// Returns `None` for values no compiled block can produce.
    pub fn decode(raw: i64) -> Option<Self> {
        if raw == ABORT_SENTINEL_I64 {
            return Some(BlockReturn::Abort);
        }
        match raw >> 32 {
            0 => Some(BlockReturn::Exit(raw as u32)),
            1 => Some(BlockReturn::TailDispatch(raw as u32)),
            _ => None,
        }
    }
}

/// A function imported from `env`.
///
/// Guest loads take `(env, addr, memop, retaddr)` and return the raw value zero-extended. Guest
/// stores take `(env, addr, value, memop, retaddr)`. Sign extension happens in compiled code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeImport {
    LdU8,
    LdLeU16,
    LdBeU16,
    LdLeU32,
    LdBeU32,
    LdLeU64,
    LdBeU64,
    StU8,
    StLeU16,
    StBeU16,
    StLeU32,
    StBeU32,
    StLeU64,
    StBeU64,
    /// `(al, ah, bl, bh) -> i64`, carry-propagating.
    I64Add,
    /// `(al, ah, bl, bh) -> i64`, borrow-propagating.
    I64Sub,
    /// `(al, ah, bl, bh) -> i64`, low 64 bits of the product.
    I64Mul,
    /// `(func, a0, a1, a2, a3, a4_reserved, a5..a10) -> i64`.
    CallHelper,
    /// `() -> i32`, nonzero when the last bridge call raised.
    ExceptionPending,
}

impl BridgeImport {
    pub const ALL: [BridgeImport; 19] = [
        BridgeImport::LdU8,
        BridgeImport::LdLeU16,
        BridgeImport::LdBeU16,
        BridgeImport::LdLeU32,
        BridgeImport::LdBeU32,
        BridgeImport::LdLeU64,
        BridgeImport::LdBeU64,
        BridgeImport::StU8,
        BridgeImport::StLeU16,
        BridgeImport::StBeU16,
        BridgeImport::StLeU32,
        BridgeImport::StBeU32,
        BridgeImport::StLeU64,
        BridgeImport::StBeU64,
        BridgeImport::I64Add,
        BridgeImport::I64Sub,
        BridgeImport::I64Mul,
        BridgeImport::CallHelper,
        BridgeImport::ExceptionPending,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BridgeImport::LdU8 => "ld_u8",
            BridgeImport::LdLeU16 => "ld_le_u16",
            BridgeImport::LdBeU16 => "ld_be_u16",
            BridgeImport::LdLeU32 => "ld_le_u32",
            BridgeImport::LdBeU32 => "ld_be_u32",
            BridgeImport::LdLeU64 => "ld_le_u64",
            BridgeImport::LdBeU64 => "ld_be_u64",
            BridgeImport::StU8 => "st_u8",
            BridgeImport::StLeU16 => "st_le_u16",
            BridgeImport::StBeU16 => "st_be_u16",
            BridgeImport::StLeU32 => "st_le_u32",
            BridgeImport::StBeU32 => "st_be_u32",
            BridgeImport::StLeU64 => "st_le_u64",
            BridgeImport::StBeU64 => "st_be_u64",
            BridgeImport::I64Add => "i64_add",
            BridgeImport::I64Sub => "i64_sub",
            BridgeImport::I64Mul => "i64_mul",
            BridgeImport::CallHelper => "call_helper",
            BridgeImport::ExceptionPending => "exception_pending",
        }
    }

    pub fn load(size: MemSize, endian: Endian) -> Self {
        match (size, endian) {
            (MemSize::U8, _) => BridgeImport::LdU8,
            (MemSize::U16, Endian::Little) => BridgeImport::LdLeU16,
            (MemSize::U16, Endian::Big) => BridgeImport::LdBeU16,
            (MemSize::U32, Endian::Little) => BridgeImport::LdLeU32,
            (MemSize::U32, Endian::Big) => BridgeImport::LdBeU32,
            (MemSize::U64, Endian::Little) => BridgeImport::LdLeU64,
            (MemSize::U64, Endian::Big) => BridgeImport::LdBeU64,
        }
    }

    pub fn store(size: MemSize, endian: Endian) -> Self {
        match (size, endian) {
            (MemSize::U8, _) => BridgeImport::StU8,
            (MemSize::U16, Endian::Little) => BridgeImport::StLeU16,
            (MemSize::U16, Endian::Big) => BridgeImport::StBeU16,
            (MemSize::U32, Endian::Little) => BridgeImport::StLeU32,
            (MemSize::U32, Endian::Big) => BridgeImport::StBeU32,
            (MemSize::U64, Endian::Little) => BridgeImport::StLeU64,
            (MemSize::U64, Endian::Big) => BridgeImport::StBeU64,
        }
    }

    pub fn is_load(self) -> bool {
        matches!(
            self,
            BridgeImport::LdU8
                | BridgeImport::LdLeU16
                | BridgeImport::LdBeU16
                | BridgeImport::LdLeU32
                | BridgeImport::LdBeU32
                | BridgeImport::LdLeU64
                | BridgeImport::LdBeU64
        )
    }

    /// Access width and byte order of a guest load/store import.
    pub fn access(self) -> Option<(MemSize, Endian)> {
        Some(match self {
            BridgeImport::LdU8 | BridgeImport::StU8 => (MemSize::U8, Endian::Little),
            BridgeImport::LdLeU16 | BridgeImport::StLeU16 => (MemSize::U16, Endian::Little),
            BridgeImport::LdBeU16 | BridgeImport::StBeU16 => (MemSize::U16, Endian::Big),
            BridgeImport::LdLeU32 | BridgeImport::StLeU32 => (MemSize::U32, Endian::Little),
            BridgeImport::LdBeU32 | BridgeImport::StBeU32 => (MemSize::U32, Endian::Big),
            BridgeImport::LdLeU64 | BridgeImport::StLeU64 => (MemSize::U64, Endian::Little),
            BridgeImport::LdBeU64 | BridgeImport::StBeU64 => (MemSize::U64, Endian::Big),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_return_encoding_is_unambiguous() {
        for ret in [
            BlockReturn::Exit(0),
            BlockReturn::Exit(u32::MAX),
            BlockReturn::TailDispatch(0),
            BlockReturn::TailDispatch(0xdead_beef),
            BlockReturn::Abort,
        ] {
            assert_eq!(BlockReturn::decode(ret.encode()), Some(ret));
        }
        assert_eq!(BlockReturn::Exit(0x200).encode(), 0x200);
        assert_eq!(BlockReturn::decode(2 << 32), None);
        assert_eq!(BlockReturn::decode(-2), None);
    }

    #[test]
    fn import_names_are_unique() {
        let mut names: Vec<_> = BridgeImport::ALL.iter().map(|i| i.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BridgeImport::ALL.len());
    }

    #[test]
    fn load_and_store_imports_agree_on_access() {
        for size in [MemSize::U8, MemSize::U16, MemSize::U32, MemSize::U64] {
            for endian in [Endian::Little, Endian::Big] {
                let ld = BridgeImport::load(size, endian).access().unwrap();
                let st = BridgeImport::store(size, endian).access().unwrap();
                assert_eq!(ld, st);
                assert_eq!(ld.0, size);
            }
        }
    }
}
