use std::ops::Range;

use tbjit_core::ir::DecodeError;
use tbjit_core::machine::{read_sized, write_sized, HelperFn};
use tbjit_core::{
    BlockExit, CallableHandle, CodeBus, ExceptionKind, ExecError, HelperFault, JitBackend,
    Machine, MemFault,
};
use tbjit_types::regs::{reg_offset, REG_CALL_STACK, REG_ENV};
use tbjit_types::{Address, Endian, MemOp, MemSize, Reg};
use tracing::trace;
use wasmtime::{Caller, Config, Engine, Linker, Memory, MemoryType, Module, Store, TypedFunc};

use super::write_log::GuestWriteLog;
use super::{BackendConfig, BackendError, LoadError};
use crate::compiler::CodegenOptions;
use crate::wasm::abi::{BlockReturn, BridgeImport, EXPORT_BLOCK_FN, IMPORT_MEMORY, IMPORT_MODULE};

type BlockFn = TypedFunc<(i32, i32, i32, i32), i64>;

/// Store data shared by every bridge import.
struct HostState {
    /// Raised by a bridge call; compiled code polls it through `exception_pending`.
    exception: Option<ExceptionKind>,
    writes: GuestWriteLog,
    helpers: Vec<HelperFn>,
    ram_size: u32,
    code_region: Range<Address>,
}

impl HostState {
    fn reset(&mut self) {
        self.exception = None;
    }

    fn raise(&mut self, kind: ExceptionKind) {
        trace!(%kind, "bridge call raised");
        self.exception = Some(kind);
    }

    fn ram<'m>(&self, mem: &'m [u8]) -> &'m [u8] {
        &mem[..self.ram_size as usize]
    }

    fn guest_load(&self, mem: &[u8], addr: Address, op: MemOp) -> Result<u64, MemFault> {
        read_sized(self.ram(mem), addr, op.size, op.endian())
    }

    fn guest_store(
        &mut self,
        mem: &mut [u8],
        addr: Address,
        op: MemOp,
        value: u64,
    ) -> Result<(), MemFault> {
        let ram = &mut mem[..self.ram_size as usize];
        write_sized(ram, addr, op.size, op.endian(), value)?;
        let len = op.size.bytes();
        let end = u64::from(addr) + u64::from(len);
        if addr < self.code_region.end && end > u64::from(self.code_region.start) {
            self.writes.record(addr, len);
        }
        Ok(())
    }

    fn call_helper(
        &mut self,
        mem: &mut [u8],
        func: u32,
        args: [u32; 10],
    ) -> Result<u64, HelperFault> {
        let helper = self
            .helpers
            .get_mut(func as usize)
            .ok_or(HelperFault::Unknown(func))?;
        helper(mem, args)
    }
}

/// `wasmtime` host that loads compiled blocks and runs them against one shared linear memory.
///
/// The memory holds guest RAM at address 0, the register bank, the `env` context area, and the
/// temp stack (see [`BackendConfig`]). The interpreter reaches the same memory through the
/// [`Machine`] impl, so both tiers see one bank and one RAM.
///
/// ## Block ABI (`export block(entry: i32, env: i32, sp: i32, depth: i32) -> i64`)
///
/// See [`BlockReturn`] for the result encoding.
pub struct WasmtimeBackend {
    engine: Engine,
    store: Store<HostState>,
    linker: Linker<HostState>,
    memory: Memory,
    config: BackendConfig,
    blocks: Vec<BlockFn>,
}

impl WasmtimeBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let wasmtime_err = |context: &'static str| {
            move |error: wasmtime::Error| BackendError::Wasmtime { context, error }
        };

        let engine = Engine::new(&Config::new()).map_err(wasmtime_err("create wasmtime engine"))?;
        let mut store = Store::new(
            &engine,
            HostState {
                exception: None,
                writes: GuestWriteLog::new(),
                helpers: Vec::new(),
                ram_size: config.ram_size,
                code_region: config.code_region.clone(),
            },
        );
        let mut linker = Linker::new(&engine);

        // A single memory is imported by all generated blocks.
        let memory = Memory::new(&mut store, MemoryType::new(config.memory_pages, None))
            .map_err(wasmtime_err("create wasmtime memory"))?;
        linker
            .define(&mut store, IMPORT_MODULE, IMPORT_MEMORY, memory)
            .map_err(wasmtime_err("define env.memory import"))?;

        define_guest_access(&mut linker, memory).map_err(wasmtime_err("define guest access"))?;
        define_runtime_helpers(&mut linker, memory)
            .map_err(wasmtime_err("define runtime helpers"))?;

        let mut backend = Self {
            engine,
            store,
            linker,
            memory,
            config,
            blocks: Vec::new(),
        };
        backend.set_reg(REG_ENV, backend.config.env_base);
        backend.set_reg(REG_CALL_STACK, backend.config.stack_top());
        Ok(backend)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Code generation settings matching this backend's memory layout.
    pub fn codegen_options(&self) -> CodegenOptions {
        CodegenOptions {
            bank_base: self.config.bank_base,
            memory_min_pages: self.config.memory_pages,
        }
    }

    /// Instantiate a compiled block module and append it to the internal table.
    pub fn add_compiled_block(&mut self, wasm_bytes: &[u8]) -> Result<CallableHandle, LoadError> {
        let load_err =
            |stage: &'static str| move |error: wasmtime::Error| LoadError { stage, error };
        let module = Module::new(&self.engine, wasm_bytes).map_err(load_err("compile module"))?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(load_err("instantiate module"))?;
        let func = instance
            .get_typed_func::<(i32, i32, i32, i32), i64>(&mut self.store, EXPORT_BLOCK_FN)
            .map_err(load_err("find block export"))?;
        let handle = CallableHandle(self.blocks.len() as u32);
        self.blocks.push(func);
        Ok(handle)
    }

    pub fn compiled_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Register a helper for IR `call`. Returns its index.
    pub fn register_helper(
        &mut self,
        f: impl FnMut(&mut [u8], [u32; 10]) -> Result<u64, HelperFault> + 'static,
    ) -> u32 {
        let helpers = &mut self.store.data_mut().helpers;
        helpers.push(Box::new(f));
        (helpers.len() - 1) as u32
    }

    /// Copy IR or data into guest RAM. Not a guest write; nothing is invalidated.
    pub fn load_code(&mut self, addr: Address, bytes: &[u8]) -> Result<(), MemFault> {
        let fault = MemFault {
            addr,
            len: bytes.len() as u32,
        };
        let start = addr as usize;
        let end = start.checked_add(bytes.len()).ok_or(fault)?;
        if end > self.config.ram_size as usize {
            return Err(fault);
        }
        self.memory.data_mut(&mut self.store)[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn guest_ram(&self) -> &[u8] {
        &self.memory.data(&self.store)[..self.config.ram_size as usize]
    }

    fn bank_addr(&self, reg: Reg) -> usize {
        (self.config.bank_base + reg_offset(reg)) as usize
    }
}

impl CodeBus for WasmtimeBackend {
    fn read_u8(&self, addr: Address) -> Option<u8> {
        self.guest_ram().get(addr as usize).copied()
    }
}

impl Machine for WasmtimeBackend {
    fn reg(&self, reg: Reg) -> u32 {
        let off = self.bank_addr(reg);
        let mem = self.memory.data(&self.store);
        u32::from_le_bytes([mem[off], mem[off + 1], mem[off + 2], mem[off + 3]])
    }

    fn set_reg(&mut self, reg: Reg, value: u32) {
        let off = self.bank_addr(reg);
        self.memory.data_mut(&mut self.store)[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn host_load(&self, addr: Address, size: MemSize) -> Result<u32, MemFault> {
        read_sized(self.memory.data(&self.store), addr, size, Endian::Little).map(|v| v as u32)
    }

    fn host_store(&mut self, addr: Address, size: MemSize, value: u32) -> Result<(), MemFault> {
        write_sized(
            self.memory.data_mut(&mut self.store),
            addr,
            size,
            Endian::Little,
            value.into(),
        )
    }

    fn guest_load(&mut self, addr: Address, op: MemOp, _retaddr: Address) -> Result<u64, MemFault> {
        let (mem, state) = self.memory.data_and_store_mut(&mut self.store);
        state.guest_load(mem, addr, op)
    }

    fn guest_store(
        &mut self,
        addr: Address,
        op: MemOp,
        value: u64,
        _retaddr: Address,
    ) -> Result<(), MemFault> {
        let (mem, state) = self.memory.data_and_store_mut(&mut self.store);
        state.guest_store(mem, addr, op, value)
    }

    fn call_helper(&mut self, func: u32, args: [u32; 10]) -> Result<u64, HelperFault> {
        let (mem, state) = self.memory.data_and_store_mut(&mut self.store);
        state.call_helper(mem, func, args)
    }
}

impl JitBackend for WasmtimeBackend {
    fn execute(
        &mut self,
        handle: CallableHandle,
        entry: Address,
        depth: u32,
    ) -> Result<BlockExit, ExecError> {
        let func = self
            .blocks
            .get(handle.0 as usize)
            .cloned()
            .unwrap_or_else(|| panic!("invalid block handle {handle:?}"));

        self.store.data_mut().reset();
        let args = (
            entry as i32,
            self.config.env_base as i32,
            self.config.stack_top() as i32,
            depth as i32,
        );
        let ret = func
            .call(&mut self.store, args)
            .map_err(|e| ExecError::Trap {
                handle,
                entry,
                message: format!("{e:#}"),
            })?;

        match BlockReturn::decode(ret) {
            Some(BlockReturn::Exit(code)) => Ok(BlockExit::Exit(code)),
            Some(BlockReturn::TailDispatch(target)) => Ok(BlockExit::TailDispatch(target)),
            Some(BlockReturn::Abort) => {
                let kind = self
                    .store
                    .data_mut()
                    .exception
                    .take()
                    .unwrap_or_else(|| panic!("block {handle:?} aborted without an exception"));
                Ok(BlockExit::Aborted(kind))
            }
            None => panic!("block {handle:?} returned undecodable value {ret:#x}"),
        }
    }

    fn drain_code_writes(&mut self, sink: &mut dyn FnMut(Address, u64)) {
        let state = self.store.data_mut();
        if state.writes.is_empty() {
            return;
        }
        let region = state.code_region.clone();
        state.writes.drain_to(&region, |begin, end| sink(begin, end));
    }
}

/// Resolve the memop a compiled access passes, checking it matches the import it called.
fn bridge_memop(
    import: BridgeImport,
    raw: i32,
    retaddr: i32,
) -> Result<MemOp, ExceptionKind> {
    let bad = || DecodeError::BadMemOp {
        address: retaddr as u32,
        raw: raw as u32,
    };
    let op = MemOp::decode(raw as u32).ok_or_else(bad)?;
    // Byte accesses share one import whatever their endian flag.
    let expected = if import.is_load() {
        BridgeImport::load(op.size, op.endian())
    } else {
        BridgeImport::store(op.size, op.endian())
    };
    if import != expected {
        return Err(bad().into());
    }
    Ok(op)
}

fn define_guest_access(linker: &mut Linker<HostState>, memory: Memory) -> wasmtime::Result<()> {
    for import in BridgeImport::ALL {
        let Some((size, _)) = import.access() else {
            continue;
        };
        match (import.is_load(), size) {
            (true, MemSize::U64) => {
                linker.func_wrap(
                    IMPORT_MODULE,
                    import.name(),
                    move |mut caller: Caller<'_, HostState>,
                          _env: i32,
                          addr: i32,
                          memop: i32,
                          retaddr: i32|
                          -> i64 {
                        bridge_load(&mut caller, memory, import, addr, memop, retaddr) as i64
                    },
                )?;
            }
            (true, _) => {
                linker.func_wrap(
                    IMPORT_MODULE,
                    import.name(),
                    move |mut caller: Caller<'_, HostState>,
                          _env: i32,
                          addr: i32,
                          memop: i32,
                          retaddr: i32|
                          -> i32 {
                        bridge_load(&mut caller, memory, import, addr, memop, retaddr) as i32
                    },
                )?;
            }
            (false, MemSize::U64) => {
                linker.func_wrap(
                    IMPORT_MODULE,
                    import.name(),
                    move |mut caller: Caller<'_, HostState>,
                          _env: i32,
                          addr: i32,
                          value: i64,
                          memop: i32,
                          retaddr: i32| {
                        bridge_store(&mut caller, memory, import, addr, value as u64, memop, retaddr);
                    },
                )?;
            }
            (false, _) => {
                linker.func_wrap(
                    IMPORT_MODULE,
                    import.name(),
                    move |mut caller: Caller<'_, HostState>,
                          _env: i32,
                          addr: i32,
                          value: i32,
                          memop: i32,
                          retaddr: i32| {
                        let value = u64::from(value as u32);
                        bridge_store(&mut caller, memory, import, addr, value, memop, retaddr);
                    },
                )?;
            }
        }
    }
    Ok(())
}

/// Raw zero-extended value, or 0 with the exception raised.
fn bridge_load(
    caller: &mut Caller<'_, HostState>,
    memory: Memory,
    import: BridgeImport,
    addr: i32,
    memop: i32,
    retaddr: i32,
) -> u64 {
    let (mem, state) = memory.data_and_store_mut(caller);
    let loaded = bridge_memop(import, memop, retaddr)
        .and_then(|op| Ok(state.guest_load(mem, addr as u32, op)?));
    loaded.unwrap_or_else(|kind| {
        state.raise(kind);
        0
    })
}

fn bridge_store(
    caller: &mut Caller<'_, HostState>,
    memory: Memory,
    import: BridgeImport,
    addr: i32,
    value: u64,
    memop: i32,
    retaddr: i32,
) {
    let (mem, state) = memory.data_and_store_mut(caller);
    let stored = bridge_memop(import, memop, retaddr)
        .and_then(|op| Ok(state.guest_store(mem, addr as u32, op, value)?));
    if let Err(kind) = stored {
        state.raise(kind);
    }
}

fn pair(lo: i32, hi: i32) -> u64 {
    (u64::from(hi as u32) << 32) | u64::from(lo as u32)
}

fn define_runtime_helpers(linker: &mut Linker<HostState>, memory: Memory) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        BridgeImport::I64Add.name(),
        |_caller: Caller<'_, HostState>, al: i32, ah: i32, bl: i32, bh: i32| -> i64 {
            pair(al, ah).wrapping_add(pair(bl, bh)) as i64
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        BridgeImport::I64Sub.name(),
        |_caller: Caller<'_, HostState>, al: i32, ah: i32, bl: i32, bh: i32| -> i64 {
            pair(al, ah).wrapping_sub(pair(bl, bh)) as i64
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        BridgeImport::I64Mul.name(),
        |_caller: Caller<'_, HostState>, al: i32, ah: i32, bl: i32, bh: i32| -> i64 {
            pair(al, ah).wrapping_mul(pair(bl, bh)) as i64
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        BridgeImport::CallHelper.name(),
        move |mut caller: Caller<'_, HostState>,
              func: i32,
              a0: i32,
              a1: i32,
              a2: i32,
              a3: i32,
              _reserved: i32,
              a5: i32,
              a6: i32,
              a7: i32,
              a8: i32,
              a9: i32,
              a10: i32|
              -> i64 {
            let args = [a0, a1, a2, a3, a5, a6, a7, a8, a9, a10].map(|a| a as u32);
            let (mem, state) = memory.data_and_store_mut(&mut caller);
            match state.call_helper(mem, func as u32, args) {
                Ok(v) => v as i64,
                Err(fault) => {
                    state.raise(fault.into());
                    0
                }
            }
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        BridgeImport::ExceptionPending.name(),
        |caller: Caller<'_, HostState>| -> i32 { i32::from(caller.data().exception.is_some()) },
    )?;
    Ok(())
}
