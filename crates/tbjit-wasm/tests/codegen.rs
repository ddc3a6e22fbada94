use std::collections::BTreeSet;

use proptest::prelude::*;
use tbjit_core::ir::{opcode, BinOp, IrAssembler, IrInst, Operand, UnOp};
use tbjit_core::{FlatMachine, TbBounds};
use tbjit_types::regs::{reg_offset, BANK_SIZE};
use tbjit_types::{Cond, MemOp, MemSize, Reg};
use tbjit_wasm::compiler::{compile_block, CodegenOptions, CompileError};
use tbjit_wasm::wasm::{BridgeImport, EXPORT_BLOCK_FN, IMPORT_MEMORY, IMPORT_MODULE};
use wasmparser::{Operator, Parser, Payload, TypeRef, Validator};

fn r(i: u8) -> Reg {
    Reg::new(i).unwrap()
}

fn compile(asm: IrAssembler) -> Result<Vec<u8>, CompileError> {
    let start = asm.base();
    let code = asm.finish();
    let mut m = FlatMachine::new(0x1000);
    m.load_code(start, &code);
    let bounds = TbBounds {
        start,
        length: code.len() as u32,
    };
    compile_block(&m, bounds, &CodegenOptions::default()).map(|c| c.wasm)
}

fn validate(wasm: &[u8]) {
    Validator::new().validate_all(wasm).expect("generated module validates");
}

fn import_names(wasm: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        if let Payload::ImportSection(imports) = payload.expect("parse wasm") {
            for group in imports {
                let group = group.expect("parse import group");
                for import in group {
                    let (_offset, import) = import.expect("parse import");
                    match import.ty {
                        TypeRef::Func(_) | TypeRef::Memory(_) => {
                            out.push((import.module.to_string(), import.name.to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    out
}

fn export_names(wasm: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        if let Payload::ExportSection(exports) = payload.expect("parse wasm") {
            for export in exports {
                out.push(export.expect("parse export").name.to_string());
            }
        }
    }
    out
}

fn operators(wasm: &[u8]) -> Vec<Operator<'_>> {
    let mut out = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        if let Payload::CodeSectionEntry(body) = payload.expect("parse wasm") {
            let mut reader = body.get_operators_reader().expect("operators reader");
            while !reader.eof() {
                out.push(reader.read().expect("read operator"));
            }
        }
    }
    out
}

/// Bank offsets touched by `i32.load`/`i32.store`, as register indices.
fn bank_traffic(wasm: &[u8]) -> (BTreeSet<u8>, BTreeSet<u8>) {
    let base = u64::from(CodegenOptions::default().bank_base);
    let bank = base..base + u64::from(BANK_SIZE);
    let reg_of = |offset: u64| ((offset - base) / 4) as u8;
    let mut loads = BTreeSet::new();
    let mut stores = BTreeSet::new();
    for op in operators(wasm) {
        match op {
            Operator::I32Load { memarg } if bank.contains(&memarg.offset) => {
                loads.insert(reg_of(memarg.offset));
            }
            Operator::I32Store { memarg } if bank.contains(&memarg.offset) => {
                stores.insert(reg_of(memarg.offset));
            }
            _ => {}
        }
    }
    (loads, stores)
}

fn memory_import() -> (String, String) {
    (IMPORT_MODULE.to_string(), IMPORT_MEMORY.to_string())
}

fn func_import(import: BridgeImport) -> (String, String) {
    (IMPORT_MODULE.to_string(), import.name().to_string())
}

#[test]
fn pure_block_imports_only_memory() {
    let mut asm = IrAssembler::new(0x100);
    asm.movi(r(0), 5);
    asm.binary(BinOp::Add, r(1), r(0), r(0));
    asm.exit_tb(0x200);
    let wasm = compile(asm).unwrap();

    validate(&wasm);
    assert_eq!(import_names(&wasm), vec![memory_import()]);
    assert_eq!(export_names(&wasm), vec![EXPORT_BLOCK_FN.to_string()]);
}

#[test]
fn only_used_bridge_imports_are_declared() {
    let mut asm = IrAssembler::new(0);
    asm.guest_ld(r(0), r(1), MemOp::new(MemSize::U16).signed().big_endian());
    asm.guest_st64(r(2), r(3), 0x80u32, MemOp::new(MemSize::U64));
    asm.exit_tb(0);
    let wasm = compile(asm).unwrap();

    validate(&wasm);
    assert_eq!(
        import_names(&wasm),
        vec![
            memory_import(),
            func_import(BridgeImport::LdBeU16),
            func_import(BridgeImport::StLeU64),
            func_import(BridgeImport::ExceptionPending),
        ]
    );
}

#[test]
fn helper_call_and_pair_ops_use_runtime_imports() {
    let mut asm = IrAssembler::new(0);
    asm.call(3u32);
    asm.pair(tbjit_core::ir::PairOp::Sub, r(2), r(3), r(0), r(1), 1u32, 0u32);
    asm.mulu2(r(4), r(5), r(2), r(3));
    asm.exit_tb(0);
    let wasm = compile(asm).unwrap();

    validate(&wasm);
    let names: Vec<_> = import_names(&wasm).into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        names,
        vec!["memory", "i64_sub", "i64_mul", "call_helper", "exception_pending"]
    );
}

#[test]
fn only_read_registers_are_loaded_and_only_written_ones_spilled() {
    let mut asm = IrAssembler::new(0);
    asm.binary(BinOp::Add, r(3), r(1), r(2));
    asm.exit_tb(0);
    let wasm = compile(asm).unwrap();

    let (loads, stores) = bank_traffic(&wasm);
    assert_eq!(loads, BTreeSet::from([1, 2]));
    // env and sp are written by every block's prologue.
    assert_eq!(stores, BTreeSet::from([3, 14, 15]));
}

#[test]
fn bridge_call_spills_before_calling() {
    let mut asm = IrAssembler::new(0);
    asm.movi(r(7), 1);
    asm.guest_st(r(7), 0x40u32, MemOp::new(MemSize::U32));
    asm.exit_tb(0);
    let wasm = compile(asm).unwrap();

    let ops = operators(&wasm);
    let first_call = ops
        .iter()
        .position(|op| matches!(op, Operator::Call { .. }))
        .unwrap();
    let r7 = u64::from(CodegenOptions::default().bank_base + reg_offset(r(7)));
    let spill = ops
        .iter()
        .position(|op| matches!(op, Operator::I32Store { memarg } if memarg.offset == r7))
        .unwrap();
    assert!(spill < first_call, "r7 must be in the bank before the bridge call");
}

#[test]
fn backward_branch_becomes_a_wasm_loop() {
    let mut asm = IrAssembler::new(0x200);
    let top = asm.new_label();
    asm.bind(top);
    asm.binary(BinOp::Sub, r(0), r(0), 1u32);
    asm.brcond(Cond::Ne, r(0), 0u32, top);
    asm.exit_tb(1);
    let wasm = compile(asm).unwrap();

    validate(&wasm);
    assert!(operators(&wasm)
        .iter()
        .any(|op| matches!(op, Operator::Loop { .. })));
}

#[test]
fn division_is_rejected() {
    let mut asm = IrAssembler::new(0x10);
    asm.movi(r(1), 3);
    let at = asm.binary(BinOp::Divu, r(0), r(0), r(1));
    asm.exit_tb(0);
    assert_eq!(
        compile(asm).unwrap_err(),
        CompileError::UnsupportedOpcode {
            address: at,
            opcode: opcode::DIVU,
        }
    );
}

#[test]
fn unreadable_block_is_reported() {
    let m = FlatMachine::new(0x100);
    let bounds = TbBounds {
        start: 0xf0,
        length: 0x20,
    };
    assert!(matches!(
        compile_block(&m, bounds, &CodegenOptions::default()),
        Err(CompileError::CodeUnavailable { start: 0xf0, .. })
    ));
}

#[test]
fn undecodable_block_is_reported() {
    let mut m = FlatMachine::new(0x100);
    m.load_code(0, &[0xee, 2]);
    let bounds = TbBounds { start: 0, length: 2 };
    assert!(matches!(
        compile_block(&m, bounds, &CodegenOptions::default()),
        Err(CompileError::Decode(_))
    ));
}

fn arb_reg() -> impl Strategy<Value = Reg> {
    (0u8..14).prop_map(r)
}

fn arb_operand() -> impl Strategy<Value = Operand> {
    prop_oneof![
        arb_reg().prop_map(Operand::Reg),
        any::<u32>().prop_map(Operand::Const),
    ]
}

fn arb_inst() -> impl Strategy<Value = IrInst> {
    let binop = prop::sample::select(vec![
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::Shr,
        BinOp::Sar,
        BinOp::Rotl,
        BinOp::Rotr,
    ]);
    let unop = prop::sample::select(vec![
        UnOp::Not,
        UnOp::Neg,
        UnOp::Ext8s,
        UnOp::Ext16s,
        UnOp::Ext8u,
        UnOp::Ext16u,
    ]);
    let cond = prop::sample::select(Cond::ALL.to_vec());
    let size = prop::sample::select(vec![MemSize::U8, MemSize::U16, MemSize::U32]);
    prop_oneof![
        (arb_reg(), any::<u32>()).prop_map(|(dst, imm)| IrInst::Movi { dst, imm }),
        (binop, arb_reg(), arb_operand(), arb_operand())
            .prop_map(|(op, dst, a, b)| IrInst::Binary { op, dst, a, b }),
        (unop, arb_reg(), arb_operand()).prop_map(|(op, dst, src)| IrInst::Unary { op, dst, src }),
        (cond, arb_reg(), arb_operand(), arb_operand())
            .prop_map(|(cond, dst, a, b)| IrInst::Setcond { dst, cond, a, b }),
        (arb_reg(), arb_reg(), arb_operand(), arb_operand())
            .prop_map(|(lo, hi, a, b)| IrInst::Mulu2 { lo, hi, a, b }),
        (arb_reg(), arb_operand(), size, any::<bool>()).prop_map(|(dst, addr, size, signed)| {
            let op = MemOp::new(size);
            IrInst::GuestLd {
                dst,
                addr,
                op: if signed { op.signed() } else { op },
            }
        }),
        (arb_operand(), arb_operand())
            .prop_map(|(src, addr)| IrInst::GuestSt { src, addr, op: MemOp::new(MemSize::U32) }),
        Just(IrInst::Mb),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_straight_line_blocks_validate(
        insts in prop::collection::vec(arb_inst(), 1..40),
        code in any::<u32>(),
    ) {
        let mut asm = IrAssembler::new(0x400);
        for inst in insts {
            asm.emit(inst);
        }
        asm.exit_tb(code);
        let wasm = compile(asm).unwrap();
        prop_assert!(Validator::new().validate_all(&wasm).is_ok());
    }
}
