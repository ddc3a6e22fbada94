//! Import/export names and result encoding shared by the code generator and the wasmtime host.

pub mod abi;

pub use abi::*;
