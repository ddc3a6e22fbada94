//! Tiering dispatcher.
//!
//! [`Engine::execute`] decides, per translation block, whether to interpret, request a compile,
//! or run the installed artifact. Tail-dispatches between compiled blocks go through a
//! non-recursive trampoline bounded by [`JitConfig::max_chain_depth`].

use std::time::{Duration, Instant};

use tbjit_types::Address;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::JitConfig;
use crate::interp::{ExceptionKind, GuestException};
use crate::registry::{TbBounds, TbRegistry};
use crate::stats::{JitStats, StatsSink, StatsWindow};

/// Opaque reference to a loaded compiled artifact, owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallableHandle(pub u32);

/// How a compiled block finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockExit {
    Exit(u32),
    TailDispatch(Address),
    /// The exception flag was raised by a bridge call.
    Aborted(ExceptionKind),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("compiled block {handle:?} entered at {entry:#x} trapped: {message}")]
    Trap {
        handle: CallableHandle,
        entry: Address,
        message: String,
    },
}

/// Runs compiled artifacts and reports guest writes that hit code.
pub trait JitBackend {
    /// Invoke `handle`, entering at `entry`. `depth` is the trampoline iteration index.
    fn execute(
        &mut self,
        handle: CallableHandle,
        entry: Address,
        depth: u32,
    ) -> Result<BlockExit, ExecError>;

    /// Hand every pending code write, as `(begin, end)`, to `sink`, and forget them.
    fn drain_code_writes(&mut self, sink: &mut dyn FnMut(Address, u64));
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Exit(u32),
    /// Run the interpreter at this address.
    InterpretRequired(Address),
    /// The block is hot; compile it, install the result, and call `execute` again.
    CompilePending(TbBounds),
    /// Chain budget exhausted; resume with `execute(address)`.
    Continue(Address),
    Exception(GuestException),
}

/// Process-wide translation state: registry, tiering policy, and statistics.
pub struct Engine {
    config: JitConfig,
    registry: TbRegistry,
    stats: JitStats,
    window: StatsWindow,
}

impl Engine {
    pub fn new(config: JitConfig) -> Self {
        assert!(config.hot_threshold > 0, "hot_threshold must be non-zero");
        Self {
            config,
            registry: TbRegistry::new(),
            stats: JitStats::default(),
            window: StatsWindow::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn registry(&self) -> &TbRegistry {
        &self.registry
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn register(&mut self, start: Address, length: u32) {
        self.registry.register(start, length);
    }

    pub fn lookup(&self, addr: Address) -> Option<TbBounds> {
        self.registry.lookup(addr)
    }

    pub fn invalidate_range(&mut self, begin: Address, end: u64) {
        let touched = self.registry.invalidate_range(begin, end);
        self.stats.invalidations += touched as u64;
    }

    /// Forward every pending code write from `backend` to the registry.
    pub fn sync_code_writes<B: JitBackend + ?Sized>(&mut self, backend: &mut B) {
        backend.drain_code_writes(&mut |begin, end| self.invalidate_range(begin, end));
    }

    /// Install a compiled artifact for the block starting at `start`.
    pub fn install(&mut self, start: Address, handle: CallableHandle) {
        let tb = self
            .registry
            .get_mut(start)
            .unwrap_or_else(|| panic!("install for unregistered block {start:#x}"));
        tb.compiled = Some(handle);
        tb.stale = false;
        debug!(start = format_args!("{start:#x}"), ?handle, "installed compiled block");
    }

    /// Stop offering the block at `start` to the compiler.
    pub fn mark_interpret_only(&mut self, start: Address) {
        if let Some(tb) = self.registry.get_mut(start) {
            tb.interpret_only = true;
        }
    }

    pub fn record_compile(&mut self, elapsed: Duration, succeeded: bool) {
        self.stats.compile_time += elapsed;
        if succeeded {
            self.stats.blocks_compiled += 1;
        } else {
            self.stats.compile_failures += 1;
        }
    }

    pub fn record_interpreted(&mut self) {
        self.stats.blocks_executed += 1;
    }

    /// Report to `sink` if the current statistics window is due.
    pub fn maybe_report(&mut self, now: Instant, sink: &mut dyn StatsSink) {
        if let Some(report) = self
            .window
            .poll(now, self.config.stats_interval, &self.stats)
        {
            sink.report(&report);
        }
    }

    pub fn execute<B: JitBackend + ?Sized>(
        &mut self,
        address: Address,
        backend: &mut B,
    ) -> Result<DispatchOutcome, ExecError> {
        let mut addr = address;
        let mut depth = 0u32;
        loop {
            self.sync_code_writes(backend);

            let Some(tb) = self
                .registry
                .lookup(addr)
                .and_then(|bounds| self.registry.get_mut(bounds.start))
            else {
                trace!(addr = format_args!("{addr:#x}"), "no translation block");
                return Ok(DispatchOutcome::InterpretRequired(addr));
            };
            if tb.start != addr {
                // Compiled code has a single entry at `start`.
                return Ok(DispatchOutcome::InterpretRequired(addr));
            }

            if let Some(handle) = tb.compiled {
                self.stats.blocks_executed += 1;
                self.stats.compiled_blocks_executed += 1;
                match backend.execute(handle, addr, depth)? {
                    BlockExit::Exit(code) => return Ok(DispatchOutcome::Exit(code)),
                    BlockExit::Aborted(kind) => {
                        return Ok(DispatchOutcome::Exception(GuestException {
                            address: addr,
                            kind,
                        }))
                    }
                    BlockExit::TailDispatch(next) => {
                        depth += 1;
                        if depth >= self.config.max_chain_depth {
                            trace!(next = format_args!("{next:#x}"), depth, "chain budget exhausted");
                            return Ok(DispatchOutcome::Continue(next));
                        }
                        addr = next;
                        continue;
                    }
                }
            }

            if !self.config.enabled || tb.interpret_only {
                return Ok(DispatchOutcome::InterpretRequired(addr));
            }
            if tb.stale {
                tb.stale = false;
                return Ok(DispatchOutcome::InterpretRequired(addr));
            }

            tb.hit_count = tb.hit_count.saturating_add(1);
            if tb.hit_count >= self.config.hot_threshold {
                trace!(start = format_args!("{:#x}", tb.start), hits = tb.hit_count, "block is hot");
                return Ok(DispatchOutcome::CompilePending(tb.bounds()));
            }
            return Ok(DispatchOutcome::InterpretRequired(addr));
        }
    }
}
