//! Tiered execution core: IR model, translation-block registry, tiering dispatcher, execution
//! driver, and the reference interpreter.
//!
//! Nothing in this crate knows how compiled code is produced. Compilers and loaders plug in
//! through [`dispatch::JitBackend`] and [`exec::BlockCompiler`].

pub mod config;
pub mod dispatch;
pub mod exec;
pub mod interp;
pub mod ir;
pub mod machine;
pub mod registry;
pub mod stats;

pub use config::JitConfig;
pub use dispatch::{BlockExit, CallableHandle, DispatchOutcome, Engine, ExecError, JitBackend};
pub use exec::{BlockCompiler, CompileFailure, DriverError, ExecDriver, StepOutcome};
pub use interp::{ExceptionKind, ExecResult, GuestException, Interpreter, RefInterpreter};
pub use machine::{CodeBus, FlatMachine, HelperFault, Machine, MemFault};
pub use registry::{TbBounds, TbRegistry, TranslationBlock};
pub use stats::{JitStats, StatsReport, StatsSink, TracingStatsSink};
pub use tbjit_types::Address;
