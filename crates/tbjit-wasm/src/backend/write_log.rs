//! Guest writes that hit the code region, pending invalidation.
//!
//! Bridge stores (from compiled code and from the interpreter alike) record here. The dispatcher
//! drains the log into `TbRegistry::invalidate_range` before every lookup, so a rewritten block is
//! never entered through its old compiled artifact.

use std::ops::Range;

use tbjit_types::Address;

/// Distinct ranges kept before the log gives up and reports the whole code region.
const WRITE_LOG_CAP: usize = 256;

/// Half-open `[start, end)` write range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CodeWrite {
    start: u64,
    end: u64,
}

#[derive(Debug)]
pub(crate) struct GuestWriteLog {
    entries: Vec<CodeWrite>,
    overflowed: bool,
}

impl GuestWriteLog {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(WRITE_LOG_CAP),
            overflowed: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.overflowed && self.entries.is_empty()
    }

    /// Record a write of `len` bytes at `addr`.
    pub(crate) fn record(&mut self, addr: Address, len: u32) {
        if len == 0 || self.overflowed {
            return;
        }

        let mut start = u64::from(addr);
        let mut end = start + u64::from(len);

        // Merge with every existing range that overlaps or touches this one, in any order.
        let mut i = 0usize;
        while i < self.entries.len() {
            let entry = self.entries[i];
            if start <= entry.end && end >= entry.start {
                start = start.min(entry.start);
                end = end.max(entry.end);
                self.entries.swap_remove(i);
                continue;
            }
            i += 1;
        }

        if self.entries.len() >= WRITE_LOG_CAP {
            self.entries.clear();
            self.overflowed = true;
            return;
        }
        self.entries.push(CodeWrite { start, end });
    }

    /// Drain the log into `f` as `(begin, end)` pairs.
    ///
    /// After an overflow, reports the whole `code_region` once instead.
    pub(crate) fn drain_to(&mut self, code_region: &Range<Address>, mut f: impl FnMut(Address, u64)) {
        if self.overflowed {
            self.overflowed = false;
            self.entries.clear();
            f(code_region.start, u64::from(code_region.end));
            return;
        }
        for entry in self.entries.drain(..) {
            f(entry.start as Address, entry.end);
        }
    }
}
