//! Compile-and-load pipeline that plugs the wasm compiler into [`ExecDriver`].

use std::time::Instant;

use tbjit_core::{
    BlockCompiler, CallableHandle, CompileFailure, Engine, ExecDriver, JitConfig, RefInterpreter,
    TbBounds, TracingStatsSink,
};
use tracing::debug;

use crate::backend::{BackendConfig, BackendError, WasmtimeBackend};
use crate::compiler::compile_block;

/// Compiles translation blocks read from the backend's guest RAM and loads them into it.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmCompiler;

impl BlockCompiler<WasmtimeBackend> for WasmCompiler {
    fn compile(
        &mut self,
        backend: &mut WasmtimeBackend,
        bounds: TbBounds,
    ) -> Result<CallableHandle, CompileFailure> {
        let started = Instant::now();
        let options = backend.codegen_options();
        let compiled = compile_block(&*backend, bounds, &options)
            .map_err(|e| CompileFailure::Rejected(Box::new(e)))?;
        let handle = backend
            .add_compiled_block(&compiled.wasm)
            .map_err(|e| CompileFailure::Load(Box::new(e)))?;
        debug!(
            start = format_args!("{:#x}", bounds.start),
            length = bounds.length,
            basic_blocks = compiled.basic_blocks,
            wasm_bytes = compiled.wasm.len(),
            elapsed = ?started.elapsed(),
            ?handle,
            "compiled block"
        );
        Ok(handle)
    }
}

/// Reference interpreter, wasm compiler, and wasmtime host in one driver.
pub type WasmDriver = ExecDriver<RefInterpreter, WasmtimeBackend, WasmCompiler>;

pub fn new_driver(config: JitConfig, backend: BackendConfig) -> Result<WasmDriver, BackendError> {
    let interpreter = RefInterpreter::new(config.interpreter_step_budget);
    let backend = WasmtimeBackend::new(backend)?;
    Ok(
        ExecDriver::new(Engine::new(config), interpreter, backend, WasmCompiler)
            .with_stats_sink(Box::new(TracingStatsSink)),
    )
}
