use bitflags::bitflags;

/// Access width of a guest memory operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemSize {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
}

impl MemSize {
    #[inline]
    pub fn bytes(self) -> u32 {
        1 << (self as u32)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Sign-extend the loaded value to the destination width.
        const SIGN = 1 << 2;
        /// Big-endian byte order.
        const BIG_ENDIAN = 1 << 3;
    }
}

/// Decoded `memop` operand of the guest load/store family.
///
/// Encoding: bits 0-1 size, bit 2 sign, bit 3 big-endian, bits 8..16 MMU index. All other bits
/// must be zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemOp {
    pub size: MemSize,
    pub flags: MemFlags,
    pub mmu_idx: u8,
}

const SIZE_MASK: u32 = 0b11;
const MMU_SHIFT: u32 = 8;

impl MemOp {
    pub const fn new(size: MemSize) -> Self {
        Self {
            size,
            flags: MemFlags::empty(),
            mmu_idx: 0,
        }
    }

    pub fn signed(mut self) -> Self {
        self.flags |= MemFlags::SIGN;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.flags |= MemFlags::BIG_ENDIAN;
        self
    }

    pub fn with_mmu_idx(mut self, mmu_idx: u8) -> Self {
        self.mmu_idx = mmu_idx;
        self
    }

    #[inline]
    pub fn is_signed(self) -> bool {
        self.flags.contains(MemFlags::SIGN)
    }

    #[inline]
    pub fn endian(self) -> Endian {
        if self.flags.contains(MemFlags::BIG_ENDIAN) {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn encode(self) -> u32 {
        (self.size as u32) | self.flags.bits() | (u32::from(self.mmu_idx) << MMU_SHIFT)
    }

    pub fn decode(raw: u32) -> Option<Self> {
        let size = match raw & SIZE_MASK {
            0 => MemSize::U8,
            1 => MemSize::U16,
            2 => MemSize::U32,
            _ => MemSize::U64,
        };
        let flag_bits = raw & !SIZE_MASK & ((1 << MMU_SHIFT) - 1);
        let flags = MemFlags::from_bits(flag_bits)?;
        if raw >> 16 != 0 {
            return None;
        }
        Some(Self {
            size,
            flags,
            mmu_idx: (raw >> MMU_SHIFT) as u8,
        })
    }

    /// Sign- or zero-extend a raw loaded value according to this op.
    pub fn extend(self, raw: u64) -> u64 {
        let bits = self.size.bits();
        if bits == 64 {
            return raw;
        }
        let mask = (1u64 << bits) - 1;
        let v = raw & mask;
        if self.is_signed() {
            let shift = 64 - bits;
            (((v << shift) as i64) >> shift) as u64
        } else {
            v
        }
    }
}
