//! Native host for compiled blocks.

mod wasmtime;
mod write_log;

use std::ops::Range;

use tbjit_types::regs::BANK_SIZE;
use tbjit_types::Address;
use thiserror::Error;

use crate::wasm::abi::{WASM32_MAX_PAGES, WASM_PAGE_SIZE};

pub use self::wasmtime::WasmtimeBackend;

/// Placement of every region inside the single shared linear memory.
///
/// Guest RAM always starts at address 0. The register bank, the context area (`env`), and the
/// temp stack are host-owned and sit above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub memory_pages: u32,
    /// Guest loads and stores outside `[0, ram_size)` fault.
    pub ram_size: u32,
    pub bank_base: u32,
    pub env_base: u32,
    pub env_size: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    /// Guest writes that intersect this range invalidate translation blocks.
    pub code_region: Range<Address>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            memory_pages: 3,
            ram_size: 0x1_0000,
            bank_base: 0x1_0000,
            env_base: 0x1_0100,
            env_size: 0x1000,
            stack_base: 0x1_2000,
            stack_size: 0x1_0000,
            code_region: 0..0x1_0000,
        }
    }
}

impl BackendConfig {
    /// Initial value of the temp-stack pointer.
    pub fn stack_top(&self) -> u32 {
        self.stack_base + self.stack_size
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        let layout = |msg: String| Err(BackendError::Layout(msg));
        if self.memory_pages == 0 || self.memory_pages > WASM32_MAX_PAGES {
            return layout(format!("memory_pages {} out of range", self.memory_pages));
        }
        let memory_end = u64::from(self.memory_pages) * u64::from(WASM_PAGE_SIZE);

        let regions = [
            ("guest ram", 0u64, u64::from(self.ram_size)),
            ("register bank", self.bank_base.into(), BANK_SIZE.into()),
            ("env", self.env_base.into(), self.env_size.into()),
            ("stack", self.stack_base.into(), self.stack_size.into()),
        ];
        for (name, start, len) in regions {
            if start + len > memory_end {
                return layout(format!(
                    "{name} [{start:#x}, {:#x}) exceeds linear memory ({memory_end:#x} bytes)",
                    start + len
                ));
            }
        }
        for (i, &(a, a_start, a_len)) in regions.iter().enumerate() {
            for &(b, b_start, b_len) in &regions[i + 1..] {
                if a_start < b_start + b_len && b_start < a_start + a_len {
                    return layout(format!("{a} overlaps {b}"));
                }
            }
        }
        // The stack top is passed to compiled code as an i32.
        if u64::from(self.stack_base) + u64::from(self.stack_size) > u64::from(u32::MAX) {
            return layout("stack top does not fit in 32 bits".into());
        }
        if self.code_region.start > self.code_region.end || self.code_region.end > self.ram_size {
            return layout(format!(
                "code region {:#x}..{:#x} is not inside guest ram",
                self.code_region.start, self.code_region.end
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid memory layout: {0}")]
    Layout(String),
    #[error("{context}: {error:#}")]
    Wasmtime {
        context: &'static str,
        error: ::wasmtime::Error,
    },
}

/// The host refused a compiled module.
#[derive(Debug, Error)]
#[error("{stage}: {error:#}")]
pub struct LoadError {
    pub stage: &'static str,
    pub error: ::wasmtime::Error,
}
