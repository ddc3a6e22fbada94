//! WebAssembly tier for the translation-block JIT.
//!
//! - [`compiler`]: IR → wasm module for one translation block.
//! - [`relooper`]: structured control flow from an arbitrary jump graph.
//! - [`wasm`]: the ABI shared by generated modules and their host.
//! - `backend` / `pipeline` (native only): a `wasmtime` host and the driver glue.

pub mod compiler;
pub mod relooper;
pub mod wasm;

#[cfg(not(target_arch = "wasm32"))]
pub mod backend;
#[cfg(not(target_arch = "wasm32"))]
pub mod pipeline;

pub use compiler::{compile_block, CodegenOptions, CompileError, CompiledBlock};

#[cfg(not(target_arch = "wasm32"))]
pub use backend::{BackendConfig, BackendError, LoadError, WasmtimeBackend};
#[cfg(not(target_arch = "wasm32"))]
pub use pipeline::{new_driver, WasmCompiler, WasmDriver};
