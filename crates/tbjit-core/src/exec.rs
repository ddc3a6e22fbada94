//! Execution driver: glues the dispatcher to an interpreter, a compiler, and a backend.

use std::time::Instant;

use tbjit_types::Address;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::{CallableHandle, DispatchOutcome, Engine, ExecError, JitBackend};
use crate::interp::{ExecResult, GuestException, Interpreter};
use crate::registry::TbBounds;
use crate::stats::StatsSink;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CompileFailure {
    /// The block cannot be compiled; it will stay in the interpreter.
    #[error("block rejected by compiler: {0}")]
    Rejected(#[source] BoxError),
    /// The host module loader refused a module the compiler produced.
    #[error("compiled module failed to load: {0}")]
    Load(#[source] BoxError),
}

/// Produces and loads a callable for one translation block.
pub trait BlockCompiler<B> {
    fn compile(&mut self, backend: &mut B, bounds: TbBounds) -> Result<CallableHandle, CompileFailure>;
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("loading compiled block {start:#x}: {source}")]
    Load {
        start: Address,
        #[source]
        source: CompileFailure,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Exit(u32),
    /// Execution can resume at this address.
    Continue(Address),
    Exception(GuestException),
}

pub struct ExecDriver<I, B, C> {
    engine: Engine,
    interpreter: I,
    backend: B,
    compiler: C,
    stats_sink: Option<Box<dyn StatsSink>>,
}

impl<I, B, C> ExecDriver<I, B, C>
where
    B: JitBackend,
    I: Interpreter<B>,
    C: BlockCompiler<B>,
{
    pub fn new(engine: Engine, interpreter: I, backend: B, compiler: C) -> Self {
        Self {
            engine,
            interpreter,
            backend,
            compiler,
            stats_sink: None,
        }
    }

    pub fn with_stats_sink(mut self, sink: Box<dyn StatsSink>) -> Self {
        self.stats_sink = Some(sink);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// One dispatch from `addr`: run compiled code, interpret one block, or compile and retry.
    pub fn step(&mut self, addr: Address) -> Result<StepOutcome, DriverError> {
        let mut addr = addr;
        let outcome = loop {
            match self.engine.execute(addr, &mut self.backend)? {
                DispatchOutcome::Exit(code) => break StepOutcome::Exit(code),
                DispatchOutcome::Continue(next) => break StepOutcome::Continue(next),
                DispatchOutcome::Exception(e) => break StepOutcome::Exception(e),
                DispatchOutcome::InterpretRequired(at) => {
                    let res = self.interpreter.interpret(&mut self.backend, at);
                    self.engine.record_interpreted();
                    self.engine.sync_code_writes(&mut self.backend);
                    break match res {
                        ExecResult::Exit(code) => StepOutcome::Exit(code),
                        ExecResult::Chain(next) => StepOutcome::Continue(next),
                        ExecResult::Exception(e) => StepOutcome::Exception(e),
                    };
                }
                DispatchOutcome::CompilePending(bounds) => {
                    self.compile(bounds)?;
                    addr = bounds.start;
                }
            }
        };

        if let Some(sink) = self.stats_sink.as_deref_mut() {
            self.engine.maybe_report(Instant::now(), sink);
        }
        Ok(outcome)
    }

    /// Step until the guest exits or raises an exception, or `max_steps` is used up.
    ///
    /// On budget exhaustion returns `Continue` with the resume address.
    pub fn run(&mut self, addr: Address, max_steps: usize) -> Result<StepOutcome, DriverError> {
        let mut addr = addr;
        for _ in 0..max_steps {
            match self.step(addr)? {
                StepOutcome::Continue(next) => addr = next,
                done => return Ok(done),
            }
        }
        Ok(StepOutcome::Continue(addr))
    }

    fn compile(&mut self, bounds: TbBounds) -> Result<(), DriverError> {
        let started = Instant::now();
        let result = self.compiler.compile(&mut self.backend, bounds);
        self.engine.record_compile(started.elapsed(), result.is_ok());
        match result {
            Ok(handle) => {
                self.engine.install(bounds.start, handle);
                Ok(())
            }
            Err(CompileFailure::Rejected(reason)) => {
                warn!(
                    start = format_args!("{:#x}", bounds.start),
                    length = bounds.length,
                    %reason,
                    "block stays interpreted"
                );
                self.engine.mark_interpret_only(bounds.start);
                Ok(())
            }
            Err(err @ CompileFailure::Load(_)) => {
                debug!(start = format_args!("{:#x}", bounds.start), "module load failed");
                Err(DriverError::Load {
                    start: bounds.start,
                    source: err,
                })
            }
        }
    }
}
