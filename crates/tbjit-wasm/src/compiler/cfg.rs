//! Partition of one translation block into basic blocks.
//!
//! Leaders are the block start, every in-range branch target, and every instruction that follows
//! a block-ending instruction. Transfers that leave `[start, end)` go to synthetic escape blocks,
//! one per distinct target address.

use std::collections::{BTreeMap, BTreeSet};

use tbjit_core::ir::{Decoded, IrInst, Operand};
use tbjit_types::{Address, Cond};

use super::CompileError;

pub(crate) type BlockId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BranchTest {
    Word {
        cond: Cond,
        a: Operand,
        b: Operand,
    },
    Pair {
        cond: Cond,
        al: Operand,
        ah: Operand,
        bl: Operand,
        bh: Operand,
    },
}

impl BranchTest {
    pub(crate) fn operands(&self) -> Vec<Operand> {
        match *self {
            BranchTest::Word { a, b, .. } => vec![a, b],
            BranchTest::Pair { al, ah, bl, bh, .. } => vec![al, ah, bl, bh],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Exit {
    /// `exit_tb`.
    Return { code: u32 },
    Branch {
        test: BranchTest,
        taken: BlockId,
        not_taken: BlockId,
    },
    /// `br`, an in-range `goto_tb`, or falling into the next leader.
    Jump { target: BlockId },
    /// Leave the translation block and tail-dispatch to `target`.
    Escape { target: Address },
}

#[derive(Clone, Debug)]
pub(crate) struct BasicBlock {
    /// Value the reconstructor's label variable holds when control enters this block.
    pub(crate) label: Address,
    /// Straight-line body; the block-ending instruction is folded into `exit`.
    pub(crate) insts: Vec<Decoded>,
    pub(crate) exit: Exit,
}

impl BasicBlock {
    pub(crate) fn successors(&self) -> Vec<BlockId> {
        match self.exit {
            Exit::Branch {
                taken, not_taken, ..
            } => vec![taken, not_taken],
            Exit::Jump { target } => vec![target],
            Exit::Return { .. } | Exit::Escape { .. } => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Cfg {
    pub(crate) blocks: Vec<BasicBlock>,
}

impl Cfg {
    /// The function entry is always block 0, the one starting at the TB start.
    pub(crate) const ENTRY: BlockId = 0;

    pub(crate) fn build(start: Address, end: u64, insts: &[Decoded]) -> Result<Self, CompileError> {
        if insts.is_empty() {
            return Err(CompileError::EmptyBlock { start });
        }
        let in_range = |addr: Address| u64::from(addr) >= u64::from(start) && u64::from(addr) < end;
        let boundaries: BTreeSet<Address> = insts.iter().map(|d| d.address).collect();

        let mut leaders = BTreeSet::from([start]);
        for d in insts {
            if let Some(target) = d.branch_target() {
                if in_range(target) {
                    if !boundaries.contains(&target) {
                        return Err(CompileError::MisalignedTarget {
                            address: d.address,
                            target,
                        });
                    }
                    leaders.insert(target);
                }
            }
            if d.inst.ends_block() && in_range(d.next_address()) {
                leaders.insert(d.next_address());
            }
        }

        let ids: BTreeMap<Address, BlockId> = leaders
            .iter()
            .enumerate()
            .map(|(id, &addr)| (addr, id))
            .collect();
        let mut builder = Builder {
            ids,
            escapes: BTreeMap::new(),
            escape_blocks: Vec::new(),
            in_range: &in_range,
        };

        let mut blocks = Vec::with_capacity(leaders.len());
        let mut rest = insts;
        for &leader in &leaders {
            let len = rest
                .iter()
                .enumerate()
                .position(|(i, d)| i > 0 && leaders.contains(&d.address))
                .unwrap_or(rest.len());
            let body = &rest[..len];
            rest = &rest[len..];

            let (last, init) = body
                .split_last()
                .ok_or(CompileError::EmptyBlock { start: leader })?;
            let (insts, exit) = if last.inst.ends_block() {
                (init.to_vec(), builder.exit_of(last))
            } else {
                let next = last.next_address();
                let exit = Exit::Jump {
                    target: builder.target(next),
                };
                (body.to_vec(), exit)
            };
            blocks.push(BasicBlock {
                label: leader,
                insts,
                exit,
            });
        }

        blocks.extend(builder.escape_blocks.into_iter().map(|target| BasicBlock {
            label: target,
            insts: Vec::new(),
            exit: Exit::Escape { target },
        }));

        Ok(Self { blocks })
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (id, block) in self.blocks.iter().enumerate() {
            for succ in block.successors() {
                if !preds[succ].contains(&id) {
                    preds[succ].push(id);
                }
            }
        }
        preds
    }

    /// Blocks reachable from [`Cfg::ENTRY`] along block edges.
    pub(crate) fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut work = vec![Self::ENTRY];
        while let Some(id) = work.pop() {
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            work.extend(self.blocks[id].successors().into_iter().filter(|&s| !seen[s]));
        }
        seen
    }
}

struct Builder<'a, F: Fn(Address) -> bool> {
    ids: BTreeMap<Address, BlockId>,
    escapes: BTreeMap<Address, BlockId>,
    escape_blocks: Vec<Address>,
    in_range: &'a F,
}

impl<F: Fn(Address) -> bool> Builder<'_, F> {
    fn target(&mut self, addr: Address) -> BlockId {
        if (self.in_range)(addr) {
            return self.ids[&addr];
        }
        let next_id = self.ids.len() + self.escape_blocks.len();
        *self.escapes.entry(addr).or_insert_with(|| {
            self.escape_blocks.push(addr);
            next_id
        })
    }

    fn exit_of(&mut self, last: &Decoded) -> Exit {
        let next = last.next_address();
        match last.inst {
            IrInst::ExitTb { code } => Exit::Return { code },
            IrInst::Br { target } => Exit::Jump {
                target: self.target(target),
            },
            IrInst::GotoTb { .. } => {
                let target = last.branch_target().unwrap_or(next);
                Exit::Jump {
                    target: self.target(target),
                }
            }
            IrInst::Brcond { cond, a, b, target } => Exit::Branch {
                test: BranchTest::Word { cond, a, b },
                taken: self.target(target),
                not_taken: self.target(next),
            },
            IrInst::Brcond2 {
                cond,
                al,
                ah,
                bl,
                bh,
                target,
            } => Exit::Branch {
                test: BranchTest::Pair {
                    cond,
                    al,
                    ah,
                    bl,
                    bh,
                },
                taken: self.target(target),
                not_taken: self.target(next),
            },
            _ => unreachable!("{:?} does not end a basic block", last.inst),
        }
    }
}

#[cfg(test)]
mod tests {
    use tbjit_core::ir::{BinOp, Cursor, IrAssembler};
    use tbjit_types::Reg;

    use super::*;

    fn build(asm: IrAssembler) -> Result<Cfg, CompileError> {
        let base = asm.base();
        let code = asm.finish();
        let insts: Vec<_> = Cursor::new(base, &code).map(Result::unwrap).collect();
        Cfg::build(base, u64::from(base) + code.len() as u64, &insts)
    }

    #[test]
    fn conditional_branch_splits_into_leaders() {
        let r0 = Reg::R0;
        let mut asm = IrAssembler::new(0x40);
        let done = asm.new_label();
        asm.brcond(Cond::Eq, r0, 0u32, done);
        let mid = asm.binary(BinOp::Add, r0, r0, 1u32);
        asm.bind(done);
        let tail = asm.exit_tb(3);
        let cfg = build(asm).unwrap();

        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.blocks[0].label, 0x40);
        assert!(cfg.blocks[0].insts.is_empty());
        assert_eq!(
            cfg.blocks[0].exit,
            Exit::Branch {
                test: BranchTest::Word {
                    cond: Cond::Eq,
                    a: Operand::Reg(r0),
                    b: Operand::Const(0)
                },
                taken: 2,
                not_taken: 1,
            }
        );
        assert_eq!(cfg.blocks[1].label, mid);
        assert_eq!(cfg.blocks[1].exit, Exit::Jump { target: 2 });
        assert_eq!(cfg.blocks[2].label, tail);
        assert_eq!(cfg.blocks[2].exit, Exit::Return { code: 3 });
        assert_eq!(cfg.predecessors()[2], vec![0, 1]);
    }

    #[test]
    fn out_of_range_targets_share_one_escape_block() {
        let mut asm = IrAssembler::new(0x100);
        asm.brcond_addr(Cond::Ne, Reg::R1, 0u32, 0x900);
        asm.br_addr(0x900);
        let cfg = build(asm).unwrap();

        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.blocks[2].exit, Exit::Escape { target: 0x900 });
        assert!(matches!(
            cfg.blocks[0].exit,
            Exit::Branch { taken: 2, not_taken: 1, .. }
        ));
        assert_eq!(cfg.blocks[1].exit, Exit::Jump { target: 2 });
    }

    #[test]
    fn fallthrough_off_the_end_escapes_to_next_address() {
        let mut asm = IrAssembler::new(0x10);
        asm.movi(Reg::R0, 1);
        asm.movi(Reg::R1, 2);
        let end = asm.here();
        let cfg = build(asm).unwrap();

        assert_eq!(cfg.blocks[0].insts.len(), 2);
        assert_eq!(cfg.blocks[0].exit, Exit::Jump { target: 1 });
        assert_eq!(cfg.blocks[1].exit, Exit::Escape { target: end });
    }

    #[test]
    fn target_inside_an_instruction_is_rejected() {
        let mut asm = IrAssembler::new(0);
        asm.movi(Reg::R0, 1);
        asm.br_addr(1);
        assert!(matches!(
            build(asm),
            Err(CompileError::MisalignedTarget { target: 1, .. })
        ));
    }

    #[test]
    fn empty_stream_is_rejected() {
        assert!(matches!(
            Cfg::build(0x20, 0x20, &[]),
            Err(CompileError::EmptyBlock { start: 0x20 })
        ));
    }
}
