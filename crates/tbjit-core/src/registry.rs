//! Translation-block registry: an ordered interval index from guest address to block bounds.

use std::collections::BTreeMap;
use std::ops::Bound;

use tbjit_types::Address;
use tracing::debug;

use crate::dispatch::CallableHandle;

/// Bounds of a translation block: `[start, start + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TbBounds {
    pub start: Address,
    pub length: u32,
}

impl TbBounds {
    /// Exclusive end, widened so blocks ending at the top of the address space don't wrap.
    #[inline]
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.length)
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && u64::from(addr) < self.end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationBlock {
    pub start: Address,
    pub length: u32,
    /// Installed compiled artifact. Cleared by invalidation.
    pub compiled: Option<CallableHandle>,
    /// Cold executions observed. Retained across invalidation.
    pub hit_count: u32,
    /// Set by invalidation; the next cold execution interprets without consulting the threshold.
    pub stale: bool,
    /// The compiler rejected this block; it always runs in the interpreter.
    pub interpret_only: bool,
}

impl TranslationBlock {
    fn new(start: Address, length: u32) -> Self {
        Self {
            start,
            length,
            compiled: None,
            hit_count: 0,
            stale: false,
            interpret_only: false,
        }
    }

    pub fn bounds(&self) -> TbBounds {
        TbBounds {
            start: self.start,
            length: self.length,
        }
    }
}

#[derive(Debug, Default)]
pub struct TbRegistry {
    blocks: BTreeMap<Address, TranslationBlock>,
}

impl TbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insert a block, or replace the block already registered at `start`.
    ///
    /// Replacement resets all per-block state. Overlapping a block that starts elsewhere is a
    /// caller contract violation and panics.
    pub fn register(&mut self, start: Address, length: u32) {
        assert!(length > 0, "translation block at {start:#x} has zero length");
        let bounds = TbBounds { start, length };

        if let Some((_, prev)) = self.blocks.range(..start).next_back() {
            assert!(
                prev.bounds().end() <= u64::from(start),
                "translation block {:#x}+{:#x} overlaps {:#x}+{:#x}",
                start,
                length,
                prev.start,
                prev.length
            );
        }
        if let Some((_, next)) = self
            .blocks
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
        {
            assert!(
                u64::from(next.start) >= bounds.end(),
                "translation block {:#x}+{:#x} overlaps {:#x}+{:#x}",
                start,
                length,
                next.start,
                next.length
            );
        }

        if let Some(old) = self.blocks.insert(start, TranslationBlock::new(start, length)) {
            debug!(
                start = format_args!("{start:#x}"),
                old_length = old.length,
                length,
                "replaced translation block"
            );
        }
    }

    /// The block whose interval covers `addr`.
    pub fn lookup(&self, addr: Address) -> Option<TbBounds> {
        self.covering(addr).map(|tb| tb.bounds())
    }

    pub fn get(&self, start: Address) -> Option<&TranslationBlock> {
        self.blocks.get(&start)
    }

    pub(crate) fn get_mut(&mut self, start: Address) -> Option<&mut TranslationBlock> {
        self.blocks.get_mut(&start)
    }

    fn covering(&self, addr: Address) -> Option<&TranslationBlock> {
        let (_, tb) = self.blocks.range(..=addr).next_back()?;
        tb.bounds().contains(addr).then_some(tb)
    }

    /// Clear the compiled artifact of every block that may contain code in `[begin, end)`.
    ///
    /// Covers every block whose start lies in the range, plus the block just before `begin` when
    /// it extends past `begin`. Block metadata and hit counts are kept. Returns the number of
    /// blocks touched.
    pub fn invalidate_range(&mut self, begin: Address, end: u64) -> usize {
        if u64::from(begin) >= end {
            return 0;
        }
        let mut touched = 0;

        if let Some((_, prev)) = self.blocks.range_mut(..begin).next_back() {
            if prev.bounds().end() > u64::from(begin) {
                invalidate(prev);
                touched += 1;
            }
        }

        let upper = match Address::try_from(end) {
            Ok(end) => Bound::Excluded(end),
            Err(_) => Bound::Unbounded,
        };
        for (_, tb) in self.blocks.range_mut((Bound::Included(begin), upper)) {
            invalidate(tb);
            touched += 1;
        }

        if touched > 0 {
            debug!(
                begin = format_args!("{begin:#x}"),
                end = format_args!("{end:#x}"),
                touched,
                "invalidated translation blocks"
            );
        }
        touched
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationBlock> {
        self.blocks.values()
    }
}

fn invalidate(tb: &mut TranslationBlock) {
    tb.compiled = None;
    tb.stale = true;
}
