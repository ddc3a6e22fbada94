use std::collections::BTreeMap;

use tbjit_core::ir::{BinOp, Decoded, HostLoad, IrInst, Operand, PairOp, UnOp};
use tbjit_types::regs::{
    reg_offset, CALL_ARG_REGS, CALL_RESERVED_SLOT, CALL_RET_HI, CALL_RET_LO, REG_CALL_STACK,
    REG_ENV,
};
use tbjit_types::{Cond, MemOp, MemSize, Reg, NUM_REGS};
use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, MemArg, MemoryType, Module, TypeSection, ValType,
};

use super::cfg::{BlockId, BranchTest, Cfg, Exit};
use super::regstate::{effect, exit_reads, Dataflow, RegSet, RegState};
use crate::relooper::{Flow, Node, ShapeId, Structured};
use crate::wasm::abi::{
    BlockReturn, BridgeImport, EXPORT_BLOCK_FN, IMPORT_MEMORY, IMPORT_MODULE, WASM32_MAX_PAGES,
};

/// Default location of the register bank inside the imported memory.
pub const DEFAULT_BANK_BASE: u32 = 0x1_0000;

#[derive(Debug, Clone, Copy)]
pub struct CodegenOptions {
    /// Byte offset of register 0 in the imported memory.
    pub bank_base: u32,
    /// Minimum size (in 64KiB pages) of the imported `env.memory`.
    pub memory_min_pages: u32,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            bank_base: DEFAULT_BANK_BASE,
            memory_min_pages: 1,
        }
    }
}

fn signature(import: BridgeImport) -> (Vec<ValType>, Vec<ValType>) {
    use ValType::{I32, I64};
    match import {
        BridgeImport::LdLeU64 | BridgeImport::LdBeU64 => (vec![I32; 4], vec![I64]),
        BridgeImport::StLeU64 | BridgeImport::StBeU64 => (vec![I32, I32, I64, I32, I32], vec![]),
        BridgeImport::I64Add | BridgeImport::I64Sub | BridgeImport::I64Mul => {
            (vec![I32; 4], vec![I64])
        }
        BridgeImport::CallHelper => (vec![I32; 12], vec![I64]),
        BridgeImport::ExceptionPending => (vec![], vec![I32]),
        BridgeImport::LdU8
        | BridgeImport::LdLeU16
        | BridgeImport::LdBeU16
        | BridgeImport::LdLeU32
        | BridgeImport::LdBeU32 => (vec![I32; 4], vec![I32]),
        BridgeImport::StU8
        | BridgeImport::StLeU16
        | BridgeImport::StBeU16
        | BridgeImport::StLeU32
        | BridgeImport::StBeU32 => (vec![I32; 5], vec![]),
    }
}

/// Bridge imports `inst` calls, besides `exception_pending`.
fn bridge_use(inst: &IrInst) -> Option<BridgeImport> {
    Some(match *inst {
        IrInst::Pair {
            op: PairOp::Add, ..
        } => BridgeImport::I64Add,
        IrInst::Pair {
            op: PairOp::Sub, ..
        } => BridgeImport::I64Sub,
        IrInst::Mulu2 { .. } => BridgeImport::I64Mul,
        IrInst::Call { .. } => BridgeImport::CallHelper,
        IrInst::GuestLd { op, .. } | IrInst::GuestLd64 { op, .. } => {
            BridgeImport::load(op.size, op.endian())
        }
        IrInst::GuestSt { op, .. } | IrInst::GuestSt64 { op, .. } => {
            BridgeImport::store(op.size, op.endian())
        }
        _ => return None,
    })
}

/// Function index of every import the module declares.
type ImportedFuncs = BTreeMap<BridgeImport, u32>;

pub(crate) fn emit_module(
    cfg: &Cfg,
    dataflow: &Dataflow,
    structured: &Structured<BlockId>,
    options: &CodegenOptions,
) -> Vec<u8> {
    assert!(
        options.memory_min_pages <= WASM32_MAX_PAGES,
        "invalid env.memory import type: min_pages ({}) exceeds wasm32 max pages ({})",
        options.memory_min_pages,
        WASM32_MAX_PAGES
    );

    let mut used: Vec<BridgeImport> = cfg
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter_map(|d| bridge_use(&d.inst))
        .collect();
    if !used.is_empty() {
        used.push(BridgeImport::ExceptionPending);
    }
    used.sort_unstable();
    used.dedup();

    let mut module = Module::new();

    let mut types = TypeSection::new();
    let mut import_types = Vec::with_capacity(used.len());
    for &import in &used {
        import_types.push(types.len());
        let (params, results) = signature(import);
        types.ty().function(params, results);
    }
    let ty_block = types.len();
    types
        .ty()
        .function([ValType::I32; 4], [ValType::I64]);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(
        IMPORT_MODULE,
        IMPORT_MEMORY,
        MemoryType {
            minimum: u64::from(options.memory_min_pages),
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        },
    );
    let mut next_func = 0u32;
    let mut imported = ImportedFuncs::new();
    for (&import, &ty) in used.iter().zip(&import_types) {
        imports.import(IMPORT_MODULE, import.name(), EntityType::Function(ty));
        imported.insert(import, next(&mut next_func));
    }
    module.section(&imports);

    let mut funcs = FunctionSection::new();
    funcs.function(ty_block);
    module.section(&funcs);

    let mut exports = ExportSection::new();
    exports.export(EXPORT_BLOCK_FN, ExportKind::Func, next_func);
    module.section(&exports);

    let layout = LocalsLayout;
    let mut func = Function::new(vec![
        (layout.i32_locals(), ValType::I32),
        (layout.i64_locals(), ValType::I64),
    ]);

    // `env` and `sp` arrive as parameters and are written back like any other dirty register.
    func.instruction(&Instruction::LocalGet(layout.env_param()));
    func.instruction(&Instruction::LocalSet(layout.reg_local(REG_ENV)));
    func.instruction(&Instruction::LocalGet(layout.sp_param()));
    func.instruction(&Instruction::LocalSet(layout.reg_local(REG_CALL_STACK)));
    func.instruction(&Instruction::LocalGet(layout.entry_param()));
    func.instruction(&Instruction::LocalSet(layout.label_local()));

    let mut emitter = Emitter {
        func: &mut func,
        cfg,
        dataflow,
        structured,
        imported: &imported,
        layout,
        bank_base: options.bank_base,
        control: Vec::new(),
        state: RegState::prologue(),
    };
    emitter.emit_nodes(&structured.body);
    debug_assert!(emitter.control.is_empty());

    // Every path returns explicitly.
    func.instruction(&Instruction::Unreachable);
    func.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&func);
    module.section(&code);

    module.finish()
}

#[derive(Clone, Copy)]
struct LocalsLayout;

impl LocalsLayout {
    const PARAMS: u32 = 4;

    fn entry_param(self) -> u32 {
        0
    }

    fn env_param(self) -> u32 {
        1
    }

    fn sp_param(self) -> u32 {
        2
    }

    fn reg_local(self, reg: Reg) -> u32 {
        Self::PARAMS + reg.as_u8() as u32
    }

    fn label_local(self) -> u32 {
        Self::PARAMS + NUM_REGS as u32
    }

    fn scratch_local(self) -> u32 {
        self.label_local() + 1
    }

    fn cond_local(self) -> u32 {
        self.scratch_local() + 1
    }

    fn i32_locals(self) -> u32 {
        self.cond_local() + 1 - Self::PARAMS
    }

    fn scratch_i64_local(self) -> u32 {
        self.cond_local() + 1
    }

    fn i64_locals(self) -> u32 {
        1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ctl {
    Break(ShapeId),
    Continue(ShapeId),
    If,
}

struct Emitter<'a> {
    func: &'a mut Function,
    cfg: &'a Cfg,
    dataflow: &'a Dataflow,
    structured: &'a Structured<BlockId>,
    imported: &'a ImportedFuncs,
    layout: LocalsLayout,
    bank_base: u32,
    /// Enclosing wasm control frames, innermost last.
    control: Vec<Ctl>,
    /// Loaded/dirty state at the current emission point.
    state: RegState,
}

impl Emitter<'_> {
    fn ins(&mut self, inst: Instruction<'_>) {
        self.func.instruction(&inst);
    }

    fn emit_nodes(&mut self, nodes: &[Node<BlockId>]) {
        for node in nodes {
            match node {
                Node::Basic(id) => self.emit_block(*id),
                Node::Block { id, body } => {
                    self.ins(Instruction::Block(BlockType::Empty));
                    self.control.push(Ctl::Break(*id));
                    self.emit_nodes(body);
                    self.control.pop();
                    self.ins(Instruction::End);
                }
                Node::Loop { id, body } => {
                    self.ins(Instruction::Loop(BlockType::Empty));
                    self.control.push(Ctl::Continue(*id));
                    self.emit_nodes(body);
                    self.control.pop();
                    self.ins(Instruction::End);
                }
                Node::Dispatch { arms } => {
                    // if label == a { .. } else { if label == b { .. } else { .. } }
                    for (i, (entry, body)) in arms.iter().enumerate() {
                        if i > 0 {
                            self.ins(Instruction::Else);
                        }
                        self.ins(Instruction::LocalGet(self.layout.label_local()));
                        self.ins(Instruction::I32Const(self.cfg.blocks[*entry].label as i32));
                        self.ins(Instruction::I32Eq);
                        self.ins(Instruction::If(BlockType::Empty));
                        self.control.push(Ctl::If);
                        self.emit_nodes(body);
                    }
                    for _ in arms {
                        self.control.pop();
                        self.ins(Instruction::End);
                    }
                }
            }
        }
    }

    /// Relative depth of the frame a `br` for `target` must name.
    fn depth_of(&self, target: Ctl) -> u32 {
        let pos = self
            .control
            .iter()
            .rposition(|&c| c == target)
            .unwrap_or_else(|| panic!("branch to {target:?} outside its frame"));
        (self.control.len() - 1 - pos) as u32
    }

    fn emit_block(&mut self, id: BlockId) {
        let cfg = self.cfg;
        let block = &cfg.blocks[id];
        self.state = self.dataflow.entry[id];
        for d in &block.insts {
            self.emit_inst(d);
        }
        self.ensure_loaded(exit_reads(&block.exit));
        debug_assert_eq!(self.state, self.dataflow.exit[id], "block {id} state diverged");

        match block.exit {
            Exit::Return { code } => self.emit_return(BlockReturn::Exit(code)),
            Exit::Escape { target } => self.emit_return(BlockReturn::TailDispatch(target)),
            Exit::Jump { target } => self.emit_edge(id, target),
            Exit::Branch {
                test,
                taken,
                not_taken,
            } => {
                self.emit_test(&test);
                self.ins(Instruction::LocalSet(self.layout.cond_local()));
                self.ins(Instruction::LocalGet(self.layout.cond_local()));
                self.ins(Instruction::If(BlockType::Empty));
                self.control.push(Ctl::If);
                self.emit_edge(id, taken);
                self.ins(Instruction::Else);
                self.emit_edge(id, not_taken);
                self.control.pop();
                self.ins(Instruction::End);
            }
        }
    }

    fn emit_return(&mut self, ret: BlockReturn) {
        self.flush(self.state.dirty);
        self.ins(Instruction::I64Const(ret.encode()));
        self.ins(Instruction::Return);
    }

    fn emit_edge(&mut self, from: BlockId, to: BlockId) {
        self.flush(self.dataflow.edge_flush(from, to));
        self.ins(Instruction::I32Const(self.cfg.blocks[to].label as i32));
        self.ins(Instruction::LocalSet(self.layout.label_local()));
        match self.structured.flow(from, to) {
            Some(Flow::Direct) => {}
            Some(Flow::Break(shape)) => {
                let depth = self.depth_of(Ctl::Break(shape));
                self.ins(Instruction::Br(depth));
            }
            Some(Flow::Continue(shape)) => {
                let depth = self.depth_of(Ctl::Continue(shape));
                self.ins(Instruction::Br(depth));
            }
            None => panic!("edge {from} -> {to} was never classified"),
        }
    }

    fn bank_memarg(&self, reg: Reg) -> MemArg {
        memarg(self.bank_base + reg_offset(reg), 2)
    }

    fn ensure_loaded(&mut self, regs: RegSet) {
        for reg in regs.minus(self.state.loaded).iter() {
            self.ins(Instruction::I32Const(0));
            self.ins(Instruction::I32Load(self.bank_memarg(reg)));
            self.ins(Instruction::LocalSet(self.layout.reg_local(reg)));
        }
        self.state.loaded = self.state.loaded.union(regs);
    }

    /// Write `regs` back to the bank. They stay loaded.
    fn flush(&mut self, regs: RegSet) {
        for reg in regs.iter() {
            self.ins(Instruction::I32Const(0));
            self.ins(Instruction::LocalGet(self.layout.reg_local(reg)));
            self.ins(Instruction::I32Store(self.bank_memarg(reg)));
        }
        self.state.dirty = self.state.dirty.minus(regs);
    }

    fn push(&mut self, op: Operand) {
        match op {
            Operand::Reg(r) => self.ins(Instruction::LocalGet(self.layout.reg_local(r))),
            Operand::Const(c) => self.ins(Instruction::I32Const(c as i32)),
        }
    }

    fn set(&mut self, dst: Reg) {
        self.ins(Instruction::LocalSet(self.layout.reg_local(dst)));
    }

    /// Push `(hi << 32) | lo` as an i64.
    fn push_pair(&mut self, lo: Operand, hi: Operand) {
        self.push(hi);
        self.ins(Instruction::I64ExtendI32U);
        self.ins(Instruction::I64Const(32));
        self.ins(Instruction::I64Shl);
        self.push(lo);
        self.ins(Instruction::I64ExtendI32U);
        self.ins(Instruction::I64Or);
    }

    fn emit_test(&mut self, test: &BranchTest) {
        match *test {
            BranchTest::Word { cond, a, b } => {
                self.push(a);
                self.push(b);
                self.ins(cmp32(cond));
            }
            BranchTest::Pair {
                cond,
                al,
                ah,
                bl,
                bh,
            } => {
                self.push_pair(al, ah);
                self.push_pair(bl, bh);
                self.ins(cmp64(cond));
            }
        }
    }

    fn call(&mut self, import: BridgeImport) {
        let idx = self.imported[&import];
        self.ins(Instruction::Call(idx));
    }

    /// Abort the block if the last bridge call raised.
    fn check_exception(&mut self) {
        self.call(BridgeImport::ExceptionPending);
        self.ins(Instruction::If(BlockType::Empty));
        self.ins(Instruction::I64Const(BlockReturn::Abort.encode()));
        self.ins(Instruction::Return);
        self.ins(Instruction::End);
    }

    /// Store the i64 on the stack's top into `(hi:lo)`, after the exception check.
    fn split_i64(&mut self, lo: Reg, hi: Reg) {
        let tmp = self.layout.scratch_i64_local();
        self.ins(Instruction::LocalSet(tmp));
        self.check_exception();
        self.ins(Instruction::LocalGet(tmp));
        self.ins(Instruction::I32WrapI64);
        self.set(lo);
        self.ins(Instruction::LocalGet(tmp));
        self.ins(Instruction::I64Const(32));
        self.ins(Instruction::I64ShrU);
        self.ins(Instruction::I32WrapI64);
        self.set(hi);
    }

    /// Sign-extend the i32 on the stack's top to 32 bits from the width of `op`, if signed.
    fn extend_loaded(&mut self, op: MemOp) {
        if !op.is_signed() {
            return;
        }
        match op.size {
            MemSize::U8 => self.ins(Instruction::I32Extend8S),
            MemSize::U16 => self.ins(Instruction::I32Extend16S),
            MemSize::U32 | MemSize::U64 => {}
        }
    }

    fn guest_args(&mut self, addr: Operand) {
        self.ins(Instruction::LocalGet(self.layout.env_param()));
        self.push(addr);
    }

    fn memop_args(&mut self, op: MemOp, retaddr: u32) {
        self.ins(Instruction::I32Const(op.encode() as i32));
        self.ins(Instruction::I32Const(retaddr as i32));
    }

    fn emit_inst(&mut self, d: &Decoded) {
        let fx = effect(&d.inst);
        self.ensure_loaded(fx.reads);
        if fx.calls_out {
            self.flush(self.state.dirty);
        }

        match d.inst {
            IrInst::Mov { dst, src } => {
                self.push(src);
                self.set(dst);
            }
            IrInst::Movi { dst, imm } => {
                self.push(Operand::Const(imm));
                self.set(dst);
            }
            IrInst::Setcond { dst, cond, a, b } => {
                self.emit_test(&BranchTest::Word { cond, a, b });
                self.set(dst);
            }
            IrInst::Setcond2 {
                dst,
                cond,
                al,
                ah,
                bl,
                bh,
            } => {
                self.emit_test(&BranchTest::Pair {
                    cond,
                    al,
                    ah,
                    bl,
                    bh,
                });
                self.set(dst);
            }
            IrInst::Ld {
                kind,
                dst,
                base,
                offset,
            } => {
                self.push(base);
                self.ins(Instruction::I32Const(offset));
                self.ins(Instruction::I32Add);
                self.ins(match kind {
                    HostLoad::U8 => Instruction::I32Load8U(memarg(0, 0)),
                    HostLoad::S8 => Instruction::I32Load8S(memarg(0, 0)),
                    HostLoad::U16 => Instruction::I32Load16U(memarg(0, 1)),
                    HostLoad::S16 => Instruction::I32Load16S(memarg(0, 1)),
                    HostLoad::U32 => Instruction::I32Load(memarg(0, 2)),
                });
                self.set(dst);
            }
            IrInst::St {
                size,
                src,
                base,
                offset,
            } => {
                self.push(base);
                self.ins(Instruction::I32Const(offset));
                self.ins(Instruction::I32Add);
                self.push(src);
                self.ins(match size {
                    MemSize::U8 => Instruction::I32Store8(memarg(0, 0)),
                    MemSize::U16 => Instruction::I32Store16(memarg(0, 1)),
                    MemSize::U32 => Instruction::I32Store(memarg(0, 2)),
                    MemSize::U64 => unreachable!("st has no 64-bit form"),
                });
            }
            IrInst::Binary { op, dst, a, b } => {
                self.push(a);
                self.push(b);
                self.ins(match op {
                    BinOp::Add => Instruction::I32Add,
                    BinOp::Sub => Instruction::I32Sub,
                    BinOp::Mul => Instruction::I32Mul,
                    BinOp::And => Instruction::I32And,
                    BinOp::Or => Instruction::I32Or,
                    BinOp::Xor => Instruction::I32Xor,
                    BinOp::Shl => Instruction::I32Shl,
                    BinOp::Shr => Instruction::I32ShrU,
                    BinOp::Sar => Instruction::I32ShrS,
                    BinOp::Rotl => Instruction::I32Rotl,
                    BinOp::Rotr => Instruction::I32Rotr,
                    BinOp::Div | BinOp::Divu | BinOp::Rem | BinOp::Remu => {
                        unreachable!("division is rejected before lowering")
                    }
                });
                self.set(dst);
            }
            IrInst::Unary { op, dst, src } => {
                match op {
                    UnOp::Not => {
                        self.push(src);
                        self.ins(Instruction::I32Const(-1));
                        self.ins(Instruction::I32Xor);
                    }
                    UnOp::Neg => {
                        self.ins(Instruction::I32Const(0));
                        self.push(src);
                        self.ins(Instruction::I32Sub);
                    }
                    UnOp::Ext8s => {
                        self.push(src);
                        self.ins(Instruction::I32Extend8S);
                    }
                    UnOp::Ext16s => {
                        self.push(src);
                        self.ins(Instruction::I32Extend16S);
                    }
                    UnOp::Ext8u => {
                        self.push(src);
                        self.ins(Instruction::I32Const(0xff));
                        self.ins(Instruction::I32And);
                    }
                    UnOp::Ext16u => {
                        self.push(src);
                        self.ins(Instruction::I32Const(0xffff));
                        self.ins(Instruction::I32And);
                    }
                }
                self.set(dst);
            }
            IrInst::Pair {
                op,
                lo,
                hi,
                al,
                ah,
                bl,
                bh,
            } => {
                for operand in [al, ah, bl, bh] {
                    self.push(operand);
                }
                self.call(match op {
                    PairOp::Add => BridgeImport::I64Add,
                    PairOp::Sub => BridgeImport::I64Sub,
                });
                self.split_i64(lo, hi);
            }
            IrInst::Mulu2 { lo, hi, a, b } => {
                for operand in [a, Operand::Const(0), b, Operand::Const(0)] {
                    self.push(operand);
                }
                self.call(BridgeImport::I64Mul);
                self.split_i64(lo, hi);
            }
            IrInst::Call { func } => {
                self.push(func);
                for (slot, &reg) in CALL_ARG_REGS.iter().enumerate() {
                    if slot == CALL_RESERVED_SLOT {
                        self.push(Operand::Const(0));
                    }
                    self.push(Operand::Reg(reg));
                }
                self.call(BridgeImport::CallHelper);
                self.split_i64(CALL_RET_LO, CALL_RET_HI);
            }
            IrInst::GuestLd { dst, addr, op } => {
                self.guest_args(addr);
                self.memop_args(op, d.address);
                self.call(BridgeImport::load(op.size, op.endian()));
                let tmp = self.layout.scratch_local();
                self.ins(Instruction::LocalSet(tmp));
                self.check_exception();
                self.ins(Instruction::LocalGet(tmp));
                self.extend_loaded(op);
                self.set(dst);
            }
            IrInst::GuestLd64 { lo, hi, addr, op } => {
                self.guest_args(addr);
                self.memop_args(op, d.address);
                self.call(BridgeImport::load(op.size, op.endian()));
                if op.size == MemSize::U64 {
                    self.split_i64(lo, hi);
                } else {
                    let tmp = self.layout.scratch_local();
                    self.ins(Instruction::LocalSet(tmp));
                    self.check_exception();
                    self.ins(Instruction::LocalGet(tmp));
                    self.extend_loaded(op);
                    self.set(lo);
                    if op.is_signed() {
                        self.ins(Instruction::LocalGet(tmp));
                        self.extend_loaded(op);
                        self.ins(Instruction::I32Const(31));
                        self.ins(Instruction::I32ShrS);
                    } else {
                        self.ins(Instruction::I32Const(0));
                    }
                    self.set(hi);
                }
            }
            IrInst::GuestSt { src, addr, op } => {
                self.guest_args(addr);
                self.push(src);
                self.memop_args(op, d.address);
                self.call(BridgeImport::store(op.size, op.endian()));
                self.check_exception();
            }
            IrInst::GuestSt64 { lo, hi, addr, op } => {
                self.guest_args(addr);
                if op.size == MemSize::U64 {
                    self.push_pair(lo, hi);
                } else {
                    self.push(lo);
                }
                self.memop_args(op, d.address);
                self.call(BridgeImport::store(op.size, op.endian()));
                self.check_exception();
            }
            IrInst::Mb => {}
            IrInst::Br { .. }
            | IrInst::Brcond { .. }
            | IrInst::Brcond2 { .. }
            | IrInst::GotoTb { .. }
            | IrInst::ExitTb { .. } => unreachable!("{:?} is folded into the block exit", d.inst),
        }

        self.state.apply(&fx);
    }
}

fn cmp32(cond: Cond) -> Instruction<'static> {
    match cond {
        Cond::Eq => Instruction::I32Eq,
        Cond::Ne => Instruction::I32Ne,
        Cond::Lt => Instruction::I32LtS,
        Cond::Ge => Instruction::I32GeS,
        Cond::Le => Instruction::I32LeS,
        Cond::Gt => Instruction::I32GtS,
        Cond::Ltu => Instruction::I32LtU,
        Cond::Geu => Instruction::I32GeU,
        Cond::Leu => Instruction::I32LeU,
        Cond::Gtu => Instruction::I32GtU,
    }
}

fn cmp64(cond: Cond) -> Instruction<'static> {
    match cond {
        Cond::Eq => Instruction::I64Eq,
        Cond::Ne => Instruction::I64Ne,
        Cond::Lt => Instruction::I64LtS,
        Cond::Ge => Instruction::I64GeS,
        Cond::Le => Instruction::I64LeS,
        Cond::Gt => Instruction::I64GtS,
        Cond::Ltu => Instruction::I64LtU,
        Cond::Geu => Instruction::I64GeU,
        Cond::Leu => Instruction::I64LeU,
        Cond::Gtu => Instruction::I64GtU,
    }
}

fn next(idx: &mut u32) -> u32 {
    let cur = *idx;
    *idx += 1;
    cur
}

fn memarg(offset: u32, align: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align,
        memory_index: 0,
    }
}
