//! IR-to-wasm compiler for one translation block.
//!
//! Pipeline: fetch and decode `[start, start + length)`, partition into basic blocks, run the
//! loaded/dirty register dataflow, reconstruct structured control flow, then lower every basic
//! block with `wasm-encoder`.

mod cfg;
mod codegen;
mod regstate;

use std::collections::BTreeMap;

use tbjit_core::ir::{Cursor, DecodeError, IrInst};
use tbjit_core::{CodeBus, TbBounds};
use tbjit_types::Address;
use thiserror::Error;

use crate::relooper;

pub use codegen::CodegenOptions;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("translation block {start:#x}+{length} is not readable")]
    CodeUnavailable { start: Address, length: u32 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// No compiled lowering exists; the block has to stay interpreted.
    #[error("opcode {opcode:#04x} at {address:#x} has no compiled lowering")]
    UnsupportedOpcode { address: Address, opcode: u8 },
    #[error("branch at {address:#x} targets {target:#x}, which is not an instruction boundary")]
    MisalignedTarget { address: Address, target: Address },
    #[error("translation block at {start:#x} holds no instructions")]
    EmptyBlock { start: Address },
}

/// A compiled module and a few facts about it.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub wasm: Vec<u8>,
    pub basic_blocks: usize,
}

/// Compile the block at `bounds`, reading its IR from `bus`.
pub fn compile_block<B: CodeBus + ?Sized>(
    bus: &B,
    bounds: TbBounds,
    options: &CodegenOptions,
) -> Result<CompiledBlock, CompileError> {
    let bytes = bus
        .fetch(bounds.start, bounds.length)
        .ok_or(CompileError::CodeUnavailable {
            start: bounds.start,
            length: bounds.length,
        })?;
    let insts = Cursor::new(bounds.start, &bytes).collect::<Result<Vec<_>, _>>()?;

    if let Some(d) = insts
        .iter()
        .find(|d| matches!(d.inst, IrInst::Binary { op, .. } if op.is_division()))
    {
        return Err(CompileError::UnsupportedOpcode {
            address: d.address,
            opcode: d.inst.opcode(),
        });
    }

    let cfg = cfg::Cfg::build(bounds.start, bounds.end(), &insts)?;
    let dataflow = regstate::analyze(&cfg);
    let succs: BTreeMap<cfg::BlockId, Vec<cfg::BlockId>> = cfg
        .blocks
        .iter()
        .enumerate()
        .map(|(id, block)| (id, block.successors()))
        .collect();
    let structured = relooper::reloop(cfg::Cfg::ENTRY, &succs);

    let wasm = codegen::emit_module(&cfg, &dataflow, &structured, options);
    Ok(CompiledBlock {
        wasm,
        basic_blocks: cfg.len(),
    })
}
