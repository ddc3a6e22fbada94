#![cfg(not(target_arch = "wasm32"))]

use tbjit_core::ir::{BinOp, IrAssembler};
use tbjit_core::{
    BlockCompiler, DispatchOutcome, Engine, ExceptionKind, ExecResult, GuestException,
    HelperFault, Interpreter, JitConfig, Machine, MemFault, RefInterpreter, StepOutcome, TbBounds,
};
use tbjit_types::regs::{CALL_RET_HI, CALL_RET_LO};
use tbjit_types::{Address, Cond, MemOp, MemSize, Reg};
use tbjit_wasm::{new_driver, BackendConfig, WasmCompiler, WasmtimeBackend};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn backend_with(blocks: &[(Address, &[u8])]) -> WasmtimeBackend {
    let mut backend = WasmtimeBackend::new(BackendConfig::default()).unwrap();
    for &(addr, code) in blocks {
        backend.load_code(addr, code).unwrap();
    }
    backend
}

/// Compile the block registered at `start` and install it.
fn compile_now(engine: &mut Engine, backend: &mut WasmtimeBackend, start: Address) {
    let bounds = engine.lookup(start).unwrap();
    let handle = WasmCompiler.compile(backend, bounds).unwrap();
    engine.install(start, handle);
}

fn hot_after(threshold: u32) -> JitConfig {
    JitConfig {
        hot_threshold: threshold,
        ..JitConfig::default()
    }
}

/// `r0 = 5; r1 = r0 + r0; exit_tb 0x200`
fn doubling_block() -> Vec<u8> {
    let mut asm = IrAssembler::new(0x100);
    asm.movi(Reg::R0, 5);
    asm.binary(BinOp::Add, Reg::R1, Reg::R0, Reg::R0);
    asm.exit_tb(0x200);
    asm.finish()
}

/// `r0 += 1; if r0 == limit exit 9; goto_tb self`
fn counting_loop(limit: u32) -> Vec<u8> {
    let mut asm = IrAssembler::new(0x100);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.bind(top);
    asm.binary(BinOp::Add, Reg::R0, Reg::R0, 1u32);
    asm.brcond(Cond::Eq, Reg::R0, limit, done);
    asm.goto_tb(top);
    asm.bind(done);
    asm.exit_tb(9);
    asm.finish()
}

#[test]
fn block_tiers_up_after_threshold_and_back_down_on_invalidation() {
    init_tracing();
    let code = doubling_block();
    assert_eq!(code.len(), 18);
    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(JitConfig::default());
    engine.register(0x100, 18);
    let bounds = TbBounds {
        start: 0x100,
        length: 18,
    };

    for _ in 0..99 {
        assert_eq!(
            engine.execute(0x100, &mut backend).unwrap(),
            DispatchOutcome::InterpretRequired(0x100)
        );
    }
    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::CompilePending(bounds)
    );

    compile_now(&mut engine, &mut backend, 0x100);
    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exit(0x200)
    );
    assert_eq!(backend.reg(Reg::R1), 10);
    assert_eq!(backend.compiled_blocks(), 1);

    // Only the block start is a compiled entry point.
    assert_eq!(
        engine.execute(0x107, &mut backend).unwrap(),
        DispatchOutcome::InterpretRequired(0x107)
    );

    engine.invalidate_range(0x100, 0x112);
    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::InterpretRequired(0x100)
    );
    assert_eq!(engine.lookup(0x100), Some(bounds));
    // Hit count survived, so the next cold run asks for a recompile right away.
    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::CompilePending(bounds)
    );
}

#[test]
fn hot_loop_finishes_inside_one_compiled_call() {
    let code = counting_loop(150);
    let mut driver = new_driver(JitConfig::default(), BackendConfig::default()).unwrap();
    driver.backend_mut().load_code(0x100, &code).unwrap();
    driver.engine_mut().register(0x100, code.len() as u32);

    assert_eq!(driver.run(0x100, 1_000).unwrap(), StepOutcome::Exit(9));
    assert_eq!(driver.backend().reg(Reg::R0), 150);

    let stats = driver.engine().stats();
    assert_eq!(stats.blocks_compiled, 1);
    // The in-block goto_tb is a wasm loop, so the last 51 iterations are a single call.
    assert_eq!(stats.compiled_blocks_executed, 1);
    assert_eq!(driver.backend().compiled_blocks(), 1);
}

#[test]
fn compiled_store_into_code_invalidates_the_written_block() {
    init_tracing();
    // Block A at 0x100 exits with 1; block B at 0x200 patches the low byte of A's exit code.
    let mut a = IrAssembler::new(0x100);
    a.exit_tb(1);
    let a = a.finish();
    let mut b = IrAssembler::new(0x200);
    b.guest_st(0x55u32, 0x102u32, MemOp::new(MemSize::U8));
    b.exit_tb(2);
    let b = b.finish();

    let mut driver = new_driver(hot_after(1), BackendConfig::default()).unwrap();
    driver.backend_mut().load_code(0x100, &a).unwrap();
    driver.backend_mut().load_code(0x200, &b).unwrap();
    driver.engine_mut().register(0x100, a.len() as u32);
    driver.engine_mut().register(0x200, b.len() as u32);

    assert_eq!(driver.step(0x100).unwrap(), StepOutcome::Exit(1));
    assert_eq!(driver.step(0x200).unwrap(), StepOutcome::Exit(2));
    assert_eq!(driver.backend().compiled_blocks(), 2);
    assert_eq!(driver.backend().guest_ram()[0x102], 0x55);

    // Stale block: interpreted once, from the patched bytes.
    assert_eq!(driver.step(0x100).unwrap(), StepOutcome::Exit(0x55));
    assert!(driver.engine().registry().get(0x100).unwrap().compiled.is_none());
    // Then recompiled.
    assert_eq!(driver.step(0x100).unwrap(), StepOutcome::Exit(0x55));
    assert_eq!(driver.backend().compiled_blocks(), 3);
    assert_eq!(driver.engine().stats().invalidations, 1);
}

#[test]
fn loading_code_is_not_a_guest_write() {
    let code = doubling_block();
    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    backend.load_code(0x100, &code).unwrap();
    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exit(0x200)
    );
    assert_eq!(engine.stats().invalidations, 0);
}

#[test]
fn helper_receives_call_registers_and_returns_a_pair() {
    let mut asm = IrAssembler::new(0x100);
    asm.movi(Reg::R0, 20);
    asm.movi(Reg::R1, 22);
    asm.movi(Reg::R4, 0xdead);
    asm.movi(Reg::new(10).unwrap(), 3);
    asm.call(0u32);
    asm.exit_tb(0);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    let helper = backend.register_helper(|_mem, args| {
        // Slot 4 is r5, not the reserved r4.
        assert_eq!(args[4], 0);
        Ok(u64::from(args[0] + args[1]) | (u64::from(args[9]) << 32))
    });
    assert_eq!(helper, 0);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exit(0)
    );
    assert_eq!(backend.reg(CALL_RET_LO), 42);
    assert_eq!(backend.reg(CALL_RET_HI), 3);
}

#[test]
fn helper_fault_aborts_the_block() {
    let mut asm = IrAssembler::new(0x100);
    asm.call(7u32);
    asm.exit_tb(0);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exception(GuestException {
            address: 0x100,
            kind: ExceptionKind::Helper(HelperFault::Unknown(7)),
        })
    );
}

#[test]
fn faulting_guest_load_aborts_after_flushing_earlier_writes() {
    let mut asm = IrAssembler::new(0x100);
    asm.movi(Reg::R3, 0x77);
    asm.guest_ld(Reg::R0, 0xffff_0000u32, MemOp::new(MemSize::U32));
    asm.movi(Reg::R3, 0x88);
    asm.exit_tb(0);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exception(GuestException {
            address: 0x100,
            kind: ExceptionKind::Memory(MemFault {
                addr: 0xffff_0000,
                len: 4,
            }),
        })
    );
    assert_eq!(backend.reg(Reg::R3), 0x77);
}

#[test]
fn guest_access_outside_ram_faults_even_inside_linear_memory() {
    let bank = BackendConfig::default().bank_base;
    let mut asm = IrAssembler::new(0x100);
    asm.guest_st(1u32, bank, MemOp::new(MemSize::U32));
    asm.exit_tb(0);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert!(matches!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exception(GuestException {
            kind: ExceptionKind::Memory(_),
            ..
        })
    ));
    assert_eq!(backend.reg(Reg::R0), 0);
}

/// Byte loads and a byte store, all carrying the big-endian flag.
fn big_endian_byte_block() -> Vec<u8> {
    let be8 = MemOp::new(MemSize::U8).big_endian();
    let mut asm = IrAssembler::new(0x100);
    asm.guest_ld(Reg::R0, 0x800u32, be8.signed());
    asm.guest_ld(Reg::R1, 0x800u32, be8);
    asm.guest_st(0x55u32, 0x181u32, be8);
    asm.guest_ld(Reg::R2, 0x181u32, be8);
    asm.exit_tb(7);
    asm.finish()
}

#[test]
fn big_endian_byte_accesses_match_the_interpreter() {
    let code = big_endian_byte_block();
    let mut victim = IrAssembler::new(0x180);
    victim.exit_tb(1);
    let victim = victim.finish();
    let fresh = || {
        let mut backend = backend_with(&[(0x100, &code), (0x180, &victim)]);
        backend.load_code(0x800, &[0x82]).unwrap();
        backend
    };

    let mut interpreted = fresh();
    assert_eq!(
        RefInterpreter::new(1_000).interpret(&mut interpreted, 0x100),
        ExecResult::Exit(7)
    );

    let mut compiled = fresh();
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    engine.register(0x180, victim.len() as u32);
    compile_now(&mut engine, &mut compiled, 0x100);
    compile_now(&mut engine, &mut compiled, 0x180);
    assert_eq!(
        engine.execute(0x100, &mut compiled).unwrap(),
        DispatchOutcome::Exit(7)
    );

    for (reg, want) in [(Reg::R0, 0xffff_ff82), (Reg::R1, 0x82), (Reg::R2, 0x55)] {
        assert_eq!(interpreted.reg(reg), want, "{reg:?} interpreted");
        assert_eq!(compiled.reg(reg), want, "{reg:?} compiled");
    }
    assert_eq!(interpreted.guest_ram(), compiled.guest_ram());

    // The byte store landed in the block at 0x180 and was logged as a code write.
    assert!(engine.registry().get(0x180).unwrap().compiled.is_some());
    engine.sync_code_writes(&mut compiled);
    assert_eq!(engine.stats().invalidations, 1);
    let tb = engine.registry().get(0x180).unwrap();
    assert!(tb.compiled.is_none());
    assert!(tb.stale);
}

fn chained_blocks() -> (Vec<u8>, Vec<u8>) {
    let mut a = IrAssembler::new(0x100);
    a.binary(BinOp::Add, Reg::R0, Reg::R0, 1u32);
    a.br_addr(0x200);
    let a = a.finish();
    let mut b = IrAssembler::new(0x200);
    b.binary(BinOp::Add, Reg::R0, Reg::R0, 10u32);
    b.exit_tb(3);
    let b = b.finish();
    (a, b)
}

#[test]
fn escaping_branch_tail_dispatches_to_the_next_compiled_block() {
    let (a, b) = chained_blocks();
    let mut backend = backend_with(&[(0x100, &a), (0x200, &b)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, a.len() as u32);
    engine.register(0x200, b.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);
    compile_now(&mut engine, &mut backend, 0x200);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exit(3)
    );
    assert_eq!(backend.reg(Reg::R0), 11);
    assert_eq!(engine.stats().compiled_blocks_executed, 2);
}

#[test]
fn chain_depth_budget_yields_continue() {
    let (a, b) = chained_blocks();
    let mut backend = backend_with(&[(0x100, &a), (0x200, &b)]);
    let mut engine = Engine::new(JitConfig {
        hot_threshold: 1,
        max_chain_depth: 1,
        ..JitConfig::default()
    });
    engine.register(0x100, a.len() as u32);
    engine.register(0x200, b.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);
    compile_now(&mut engine, &mut backend, 0x200);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Continue(0x200)
    );
    assert_eq!(backend.reg(Reg::R0), 1);
    assert_eq!(
        engine.execute(0x200, &mut backend).unwrap(),
        DispatchOutcome::Exit(3)
    );
}

#[test]
fn dispatch_to_an_unregistered_target_falls_back_to_the_interpreter() {
    let (a, _) = chained_blocks();
    let mut backend = backend_with(&[(0x100, &a)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, a.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::InterpretRequired(0x200)
    );
}

#[test]
fn division_keeps_the_block_in_the_interpreter() {
    init_tracing();
    let mut asm = IrAssembler::new(0x100);
    asm.movi(Reg::R1, 3);
    asm.movi(Reg::R2, 12);
    asm.binary(BinOp::Divu, Reg::R0, Reg::R2, Reg::R1);
    asm.exit_tb(0);
    let code = asm.finish();

    let mut driver = new_driver(hot_after(1), BackendConfig::default()).unwrap();
    driver.backend_mut().load_code(0x100, &code).unwrap();
    driver.engine_mut().register(0x100, code.len() as u32);

    for _ in 0..3 {
        assert_eq!(driver.step(0x100).unwrap(), StepOutcome::Exit(0));
        assert_eq!(driver.backend().reg(Reg::R0), 4);
    }
    assert!(driver.engine().registry().get(0x100).unwrap().interpret_only);
    assert_eq!(driver.engine().stats().compile_failures, 1);
    assert_eq!(driver.backend().compiled_blocks(), 0);
}

#[test]
fn disabled_jit_never_compiles() {
    let code = counting_loop(200);
    let config = JitConfig {
        enabled: false,
        ..JitConfig::default()
    };
    let mut driver = new_driver(config, BackendConfig::default()).unwrap();
    driver.backend_mut().load_code(0x100, &code).unwrap();
    driver.engine_mut().register(0x100, code.len() as u32);

    assert_eq!(driver.run(0x100, 1_000).unwrap(), StepOutcome::Exit(9));
    assert_eq!(driver.backend().reg(Reg::R0), 200);
    assert_eq!(driver.backend().compiled_blocks(), 0);
}

#[test]
fn compiled_code_sees_env_and_stack_pointers() {
    let config = BackendConfig::default();
    let mut asm = IrAssembler::new(0x100);
    asm.mov(Reg::R0, Reg::new(14).unwrap());
    asm.mov(Reg::R1, Reg::new(15).unwrap());
    asm.exit_tb(0);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    engine.execute(0x100, &mut backend).unwrap();
    assert_eq!(backend.reg(Reg::R0), config.env_base);
    assert_eq!(backend.reg(Reg::R1), config.stack_top());
}

#[test]
fn dead_branch_to_entry_does_not_hide_env_from_the_block() {
    let config = BackendConfig::default();
    let env = Reg::new(14).unwrap();
    let mut asm = IrAssembler::new(0x100);
    let top = asm.new_label();
    asm.bind(top);
    asm.binary(BinOp::Add, Reg::R0, env, 0u32);
    asm.exit_tb(0);
    asm.br(top);
    let code = asm.finish();

    let mut backend = backend_with(&[(0x100, &code)]);
    backend.set_reg(env, 0x1234);
    let mut engine = Engine::new(hot_after(1));
    engine.register(0x100, code.len() as u32);
    compile_now(&mut engine, &mut backend, 0x100);

    assert_eq!(
        engine.execute(0x100, &mut backend).unwrap(),
        DispatchOutcome::Exit(0)
    );
    assert_eq!(backend.reg(Reg::R0), config.env_base);
    assert_eq!(backend.reg(env), config.env_base);
}
