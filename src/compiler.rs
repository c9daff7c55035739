// This module drives the compilation pipeline for one method: CFG
// construction, liveness, stack-to-IR translation, constant propagation,
// ABI pseudo-op insertion, register preferences, allocation, and code
// emission, strictly in that order. One Compiler instance serves one method
// compile; any fatal condition aborts the method and discards the whole
// in-progress state, so failures never leak into other compilations.

//! The per-method compilation pipeline.

use log::debug;

use crate::bytecode::{MethodDef, Module};
use crate::error::CompileResult;
use crate::ir::block::FlowGraph;
use crate::x64::emit;
use crate::x64::Register;
use crate::{cfg, cprop, frontend, liveness, regalloc, regprefs};

/// The result of compiling one method.
#[derive(Debug)]
pub struct CompiledMethod {
    /// Line-oriented AT&T assembly for the whole method.
    pub asm: String,
    /// The fully allocated block graph (useful for inspection and tests).
    pub graph: FlowGraph,
    /// Callee-saved registers the prologue preserves.
    pub callee_saved: Vec<Register>,
    /// Method-wide spill-slot count.
    pub spill_slots: u32,
}

/// Compiles a single method body to x86-64.
pub struct Compiler<'m> {
    module: &'m Module,
    index: usize,
}

impl<'m> Compiler<'m> {
    pub fn new(module: &'m Module, index: usize) -> Compiler<'m> {
        Compiler { module, index }
    }

    fn method(&self) -> CompileResult<&'m MethodDef> {
        self.module.method(self.index as u32)
    }

    /// Run the whole pipeline.
    pub fn compile(&self) -> CompileResult<CompiledMethod> {
        let method = self.method()?;
        debug!("compiling {}", method.name);

        let mut g = cfg::build(&method.body)?;
        liveness::run(&mut g, method)?;
        frontend::translate(&mut g, method, self.module)?;
        cprop::run(&mut g);
        regalloc::insert_abi_pseudos(&mut g, &method.signature)?;
        regprefs::run(&mut g);
        let outcome = regalloc::run(&mut g)?;
        let asm = emit::emit_text(&g, &outcome, &method.name)?;

        Ok(CompiledMethod {
            asm,
            graph: g,
            callee_saved: outcome.callee_saved,
            spill_slots: outcome.spill_slots,
        })
    }
}
