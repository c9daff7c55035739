//! stackjit — a method-at-a-time JIT compiler back end.
//!
//! The crate lowers a single method body of stack-based bytecode into
//! x86-64 assembly text. The pipeline: control-flow graph construction,
//! backward liveness, stack-to-register IR translation with per-edge value
//! passing ([`ir::CallInfo`], the phi-node analogue), forward constant
//! propagation, a register-preference pass, a backward per-block register
//! allocator with spilling and cross-block repair code, and linear code
//! emission.
//!
//! # Usage
//!
//! ```
//! use stackjit::bytecode::asm::BodyAsm;
//! use stackjit::bytecode::{MethodDef, Module, Signature, Ty};
//! use stackjit::Compiler;
//!
//! let mut module = Module::new();
//! let body = BodyAsm::new().ldarg(0).ldarg(1).add().ret().finish();
//! let index = module.push(MethodDef::new("add2", Signature::new(2, Ty::Int), body));
//!
//! let compiled = Compiler::new(&module, index as usize).compile().unwrap();
//! assert!(compiled.asm.contains("add2:"));
//! ```
//!
//! # Architecture
//!
//! - [`bytecode`] — the decoded-instruction surface the core consumes
//! - [`ir`] — instruction nodes, operands, blocks and edge contracts
//! - [`cfg`], [`liveness`], [`frontend`], [`cprop`], [`regprefs`],
//!   [`regalloc`] — the pipeline passes
//! - [`x64`] — target description and the textual code generator
//! - [`compiler`] — the per-method driver

pub mod bytecode;
pub mod cfg;
pub mod compiler;
pub mod cprop;
pub mod error;
pub mod frontend;
pub mod ir;
pub mod liveness;
pub mod regalloc;
pub mod regprefs;
pub mod x64;

pub use compiler::{CompiledMethod, Compiler};
pub use error::{CompileError, CompileResult};
